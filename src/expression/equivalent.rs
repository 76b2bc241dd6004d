//! Structural equivalence and dependency analysis.
//!
//! False negatives are permitted in both directions; index selection uses
//! these as conservative filters.

use std::mem::discriminant;
use std::sync::Arc;

use super::Expr;

impl Expr {
    /// True when both expressions are known to evaluate identically on
    /// every input.
    pub fn equivalent_to(&self, other: &Expr) -> bool {
        // Constant-equal subtrees are equivalent regardless of shape.
        if let (Some(a), Some(b)) = (self.constant_value(), other.constant_value()) {
            return a.collate(&b) == std::cmp::Ordering::Equal;
        }

        match (self, other) {
            (Expr::Identifier(a), Expr::Identifier(b)) => a == b,
            (Expr::SelfRef, Expr::SelfRef) => true,
            (Expr::NamedParameter(a), Expr::NamedParameter(b)) => a == b,
            (Expr::PositionalParameter(a), Expr::PositionalParameter(b)) => a == b,
            (Expr::Subquery(a), Expr::Subquery(b)) => Arc::ptr_eq(a, b),
            (Expr::Cover { text: a, .. }, Expr::Cover { text: b, .. }) => a == b,
            (
                Expr::Function {
                    func: fa,
                    operands: oa,
                },
                Expr::Function {
                    func: fb,
                    operands: ob,
                },
            ) => fa == fb && pairwise(oa.iter().collect(), ob.iter().collect()),
            (Expr::Aggregate(a), Expr::Aggregate(b)) => {
                a.kind == b.kind
                    && a.distinct == b.distinct
                    && match (&a.operand, &b.operand) {
                        (None, None) => true,
                        (Some(x), Some(y)) => x.equivalent_to(y),
                        _ => false,
                    }
            }
            (Expr::ObjectConstruct(a), Expr::ObjectConstruct(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.equivalent_to(vb))
            }
            // Commutative operators match operands as a multiset.
            (Expr::And(a), Expr::And(b))
            | (Expr::Or(a), Expr::Or(b))
            | (Expr::Add(a), Expr::Add(b))
            | (Expr::Mult(a), Expr::Mult(b)) => multiset(a, b),
            _ => {
                if discriminant(self) != discriminant(other) {
                    return false;
                }
                if !bindings_match(self, other) {
                    return false;
                }
                pairwise(self.children(), other.children())
            }
        }
    }

    /// True when some subtree of `self` is equivalent to `other`.
    /// Conditional receivers and constant targets never depend.
    pub fn depends_on(&self, other: &Expr) -> bool {
        if self.is_conditional() || other.constant_value().is_some() {
            return false;
        }
        if self.equivalent_to(other) {
            return true;
        }
        self.children().iter().any(|c| c.depends_on(other))
    }
}

fn pairwise(ours: Vec<&Expr>, theirs: Vec<&Expr>) -> bool {
    ours.len() == theirs.len()
        && ours
            .iter()
            .zip(theirs.iter())
            .all(|(a, b)| a.equivalent_to(b))
}

/// Unordered operand matching for commutative operators.
fn multiset(ours: &[Expr], theirs: &[Expr]) -> bool {
    if ours.len() != theirs.len() {
        return false;
    }
    let mut used = vec![false; theirs.len()];
    for a in ours {
        let mut matched = false;
        for (i, b) in theirs.iter().enumerate() {
            if !used[i] && a.equivalent_to(b) {
                used[i] = true;
                matched = true;
                break;
            }
        }
        if !matched {
            return false;
        }
    }
    true
}

/// Binding variable names carry meaning beyond the child expressions.
fn bindings_match(a: &Expr, b: &Expr) -> bool {
    let vars = |e: &Expr| -> Option<Vec<(String, bool)>> {
        match e {
            Expr::Any { bindings, .. }
            | Expr::Every { bindings, .. }
            | Expr::AnyEvery { bindings, .. }
            | Expr::ArrayComp { bindings, .. }
            | Expr::First { bindings, .. }
            | Expr::ObjectComp { bindings, .. } => Some(
                bindings
                    .iter()
                    .map(|bd| (bd.variable.clone(), bd.descend))
                    .collect(),
            ),
            _ => None,
        }
    };
    match (vars(a), vars(b)) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
