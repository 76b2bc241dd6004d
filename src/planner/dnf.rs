//! Predicate normalization.
//!
//! The classifier runs the expression-level rewrite only (constant
//! folding, De Morgan, NOT and IN lowering, AND/OR flattening); the
//! union-scan path additionally distributes AND over OR into disjunctive
//! normal form, capped to avoid term explosion.

use crate::errors::Result;
use crate::expression::Expr;
use crate::value::Value;

/// Upper bound on the number of disjuncts a full DNF may produce;
/// distribution stops when exceeded.
const DNF_TERM_CAP: usize = 64;

pub struct Dnf {
    full: bool,
}

impl Dnf {
    /// `full` distributes AND over OR; without it only the
    /// expression-level rewrites run.
    pub fn new(full: bool) -> Self {
        Self { full }
    }

    /// Rewrites bottom-up.
    pub fn map(&self, expr: Expr) -> Result<Expr> {
        let expr = expr.map_children(&mut |c| self.map(c))?;
        self.apply(expr)
    }

    fn apply(&self, expr: Expr) -> Result<Expr> {
        // Fold any non-constant node whose subtree became constant.
        if !matches!(expr, Expr::Constant(_)) {
            if let Some(v) = expr.constant_value() {
                return Ok(Expr::Constant(v));
            }
        }

        let rewritten = match expr {
            Expr::Not(inner) => negate(*inner),
            Expr::Between { item, low, high } => Expr::And(vec![
                Expr::Le {
                    left: low,
                    right: item.clone(),
                },
                Expr::Le {
                    left: item,
                    right: high,
                },
            ]),
            Expr::In { item, list } => lower_in(*item, *list),
            Expr::And(ops) => Expr::And(flatten_and(ops)),
            Expr::Or(ops) => Expr::Or(flatten_or_ops(ops)),
            other => other,
        };

        // The rewrite may have produced fresh AND/OR nesting.
        let rewritten = match rewritten {
            Expr::And(ops) => {
                let ops = flatten_and(ops);
                if self.full {
                    distribute(ops)
                } else {
                    and_of(ops)
                }
            }
            Expr::Or(ops) => or_of(flatten_or_ops(ops)),
            other => other,
        };
        Ok(rewritten)
    }
}

/// Pushes a negation one level down.
fn negate(inner: Expr) -> Expr {
    match inner {
        Expr::Not(x) => *x,
        Expr::And(ops) => Expr::Or(ops.into_iter().map(negate).collect()),
        Expr::Or(ops) => Expr::And(ops.into_iter().map(negate).collect()),
        Expr::Le { left, right } => Expr::Lt {
            left: right,
            right: left,
        },
        Expr::Lt { left, right } => Expr::Le {
            left: right,
            right: left,
        },
        Expr::IsMissing(x) => Expr::IsNotMissing(x),
        Expr::IsNotMissing(x) => Expr::IsMissing(x),
        Expr::IsNull(x) => Expr::IsNotNull(x),
        Expr::IsNotNull(x) => Expr::IsNull(x),
        Expr::IsValued(x) => Expr::IsNotValued(x),
        Expr::IsNotValued(x) => Expr::IsValued(x),
        other => Expr::Not(Box::new(other)),
    }
}

/// `x IN [c1, c2, ...]` with a constant list becomes an OR of equalities,
/// which sargs and classifies like any other disjunction.
fn lower_in(item: Expr, list: Expr) -> Expr {
    let values: Option<Vec<Value>> = list
        .constant_value()
        .and_then(|v| v.as_array().map(|a| a.to_vec()));
    match values {
        Some(vals) if !vals.is_empty() && vals.len() <= 16 => Expr::Or(
            vals.into_iter()
                .map(|v| Expr::eq(item.clone(), Expr::Constant(v)))
                .collect(),
        ),
        _ => Expr::In {
            item: Box::new(item),
            list: Box::new(list),
        },
    }
}

fn flatten_and(ops: Vec<Expr>) -> Vec<Expr> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            Expr::And(inner) => out.extend(flatten_and(inner)),
            // TRUE conjuncts are dropped here; a FALSE conjunct folds the
            // whole AND to a constant upstream.
            Expr::Constant(v) if v.truth() => {}
            other => out.push(other),
        }
    }
    out
}

fn flatten_or_ops(ops: Vec<Expr>) -> Vec<Expr> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            Expr::Or(inner) => out.extend(flatten_or_ops(inner)),
            // FALSE disjuncts are inert; NULL and MISSING are not.
            Expr::Constant(Value::Bool(false)) => {}
            other => out.push(other),
        }
    }
    out
}

fn and_of(mut ops: Vec<Expr>) -> Expr {
    match ops.len() {
        0 => Expr::constant(true),
        1 => ops.remove(0),
        _ => Expr::And(ops),
    }
}

fn or_of(mut ops: Vec<Expr>) -> Expr {
    match ops.len() {
        0 => Expr::constant(false),
        1 => ops.remove(0),
        _ => Expr::Or(ops),
    }
}

/// Distributes AND over OR: the conjunction of disjunctions becomes a
/// disjunction of conjunctions.
fn distribute(ops: Vec<Expr>) -> Expr {
    let mut terms: Vec<Vec<Expr>> = vec![Vec::new()];
    for op in ops {
        match op {
            Expr::Or(disjuncts) => {
                if terms.len() * disjuncts.len() > DNF_TERM_CAP {
                    // too wide; keep the remaining conjunct undistributed
                    for term in &mut terms {
                        term.push(Expr::Or(disjuncts.clone()));
                    }
                    continue;
                }
                let mut next = Vec::with_capacity(terms.len() * disjuncts.len());
                for term in &terms {
                    for d in &disjuncts {
                        let mut t = term.clone();
                        t.push(d.clone());
                        next.push(t);
                    }
                }
                terms = next;
            }
            other => {
                for term in &mut terms {
                    term.push(other.clone());
                }
            }
        }
    }
    or_of(terms.into_iter().map(and_of).collect())
}

/// Flattens an OR into its disjunct list; returns None when the
/// expression is not a disjunction, and flags a constant-true result.
pub fn flatten_or(expr: &Expr) -> (Option<Vec<Expr>>, bool) {
    match expr {
        Expr::Or(ops) => {
            let flat = flatten_or_ops(ops.clone());
            let truth = flat.is_empty()
                || flat
                    .iter()
                    .any(|e| e.constant_value().map_or(false, |v| v.truth()));
            (Some(flat), truth)
        }
        _ => (None, false),
    }
}
