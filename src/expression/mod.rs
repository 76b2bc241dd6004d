//! Expression algebra.
//!
//! Expressions are a single tagged enum rather than trait objects, so the
//! dispatchers (evaluation, folding, equivalence, covering, rendering) are
//! exhaustive matches checked at compile time.

mod cover;
mod eval;
mod fold;
mod equivalent;
mod refs;
mod text;

pub use cover::{CoverOptions, Covered};
pub use eval::{EvalContext, FoldContext};

use std::sync::Arc;

use crate::algebra::Select;
use crate::value::Value;

/// A variable binding in a collection predicate or comprehension
/// (`ANY v IN expr SATISFIES ... END`). `descend` marks WITHIN bindings,
/// which range over all nested descendants of the source.
#[derive(Debug, Clone)]
pub struct Binding {
    pub variable: String,
    pub source: Expr,
    pub descend: bool,
}

impl Binding {
    pub fn new(variable: impl Into<String>, source: Expr) -> Self {
        Self {
            variable: variable.into(),
            source,
            descend: false,
        }
    }
}

/// Scalar builtin functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Lower,
    Upper,
    Length,
    Abs,
    /// Document metadata (primary key and friends).
    Meta,
    /// Statement-fixed wall clock; volatile for folding purposes.
    NowUtc,
    /// Pseudo-random number; volatile.
    Random,
}

impl Func {
    pub fn name(&self) -> &'static str {
        match self {
            Func::Lower => "lower",
            Func::Upper => "upper",
            Func::Length => "length",
            Func::Abs => "abs",
            Func::Meta => "meta",
            Func::NowUtc => "now_utc",
            Func::Random => "random",
        }
    }

    pub fn volatile(&self) -> bool {
        matches!(self, Func::NowUtc | Func::Random)
    }
}

/// Aggregate function kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    CountStar,
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggKind::CountStar | AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Avg => "avg",
            AggKind::Min => "min",
            AggKind::Max => "max",
        }
    }
}

/// An aggregate reference inside a projection, HAVING or LETTING clause.
/// During execution it reads its computed value from the group operator's
/// `aggregates` attachment, keyed by the aggregate's rendered text.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub kind: AggKind,
    pub operand: Option<Box<Expr>>,
    pub distinct: bool,
}

impl Aggregate {
    pub fn count_star() -> Self {
        Self {
            kind: AggKind::CountStar,
            operand: None,
            distinct: false,
        }
    }

    pub fn new(kind: AggKind, operand: Expr) -> Self {
        Self {
            kind,
            operand: Some(Box::new(operand)),
            distinct: false,
        }
    }
}

/// An expression tree node.
#[derive(Debug, Clone)]
pub enum Expr {
    Constant(Value),
    Identifier(String),
    SelfRef,

    Field {
        base: Box<Expr>,
        name: Box<Expr>,
    },
    Element {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        base: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },

    Neg(Box<Expr>),
    Add(Vec<Expr>),
    Sub {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Mult(Vec<Expr>),
    Div {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Mod {
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Eq {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Le {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Lt {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Like {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Between {
        item: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    In {
        item: Box<Expr>,
        list: Box<Expr>,
    },
    Within {
        item: Box<Expr>,
        list: Box<Expr>,
    },

    IsMissing(Box<Expr>),
    IsNotMissing(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    IsValued(Box<Expr>),
    IsNotValued(Box<Expr>),

    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Exists(Box<Expr>),

    Any {
        bindings: Vec<Binding>,
        satisfies: Box<Expr>,
    },
    Every {
        bindings: Vec<Binding>,
        satisfies: Box<Expr>,
    },
    AnyEvery {
        bindings: Vec<Binding>,
        satisfies: Box<Expr>,
    },
    ArrayComp {
        mapping: Box<Expr>,
        bindings: Vec<Binding>,
        when: Option<Box<Expr>>,
    },
    First {
        mapping: Box<Expr>,
        bindings: Vec<Binding>,
        when: Option<Box<Expr>>,
    },
    ObjectComp {
        name: Box<Expr>,
        mapping: Box<Expr>,
        bindings: Vec<Binding>,
        when: Option<Box<Expr>>,
    },

    ArrayConstruct(Vec<Expr>),
    ObjectConstruct(Vec<(String, Expr)>),

    SimpleCase {
        search: Box<Expr>,
        whens: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    SearchedCase {
        whens: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },

    Concat(Vec<Expr>),

    NamedParameter(String),
    PositionalParameter(usize),
    Subquery(Arc<Select>),

    /// A covering-index answer: evaluation reads the annotated value's
    /// cover map under `text` instead of evaluating `covered`.
    Cover {
        covered: Box<Expr>,
        text: String,
    },

    Function {
        func: Func,
        operands: Vec<Expr>,
    },
    Aggregate(Aggregate),
}

impl Expr {
    // Constructor helpers, N1QL-flavored.

    pub fn constant(v: impl Into<Value>) -> Expr {
        Expr::Constant(v.into())
    }

    pub fn ident(name: impl Into<String>) -> Expr {
        Expr::Identifier(name.into())
    }

    /// `base.name` with a constant field name.
    pub fn field(base: Expr, name: impl Into<String>) -> Expr {
        Expr::Field {
            base: Box::new(base),
            name: Box::new(Expr::Constant(Value::String(name.into()))),
        }
    }

    /// `alias.name` shorthand.
    pub fn path(alias: impl Into<String>, name: impl Into<String>) -> Expr {
        Expr::field(Expr::ident(alias), name)
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::Eq {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn le(left: Expr, right: Expr) -> Expr {
        Expr::Le {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn lt(left: Expr, right: Expr) -> Expr {
        Expr::Lt {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `left >= right`, expressed as `right <= left`.
    pub fn ge(left: Expr, right: Expr) -> Expr {
        Expr::le(right, left)
    }

    /// `left > right`, expressed as `right < left`.
    pub fn gt(left: Expr, right: Expr) -> Expr {
        Expr::lt(right, left)
    }

    pub fn and(operands: Vec<Expr>) -> Expr {
        Expr::And(operands)
    }

    pub fn or(operands: Vec<Expr>) -> Expr {
        Expr::Or(operands)
    }

    pub fn not(operand: Expr) -> Expr {
        Expr::Not(Box::new(operand))
    }

    pub fn cover(covered: Expr) -> Expr {
        let text = covered.to_string();
        Expr::Cover {
            covered: Box::new(covered),
            text,
        }
    }

    pub fn is_constant_true(&self) -> bool {
        self.constant_value().map_or(false, |v| v.truth())
    }

    /// Ordered borrows of every child expression.
    pub fn children(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        self.visit_children(&mut |c| out.push(c));
        out
    }

    fn visit_children<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        match self {
            Expr::Constant(_)
            | Expr::Identifier(_)
            | Expr::SelfRef
            | Expr::NamedParameter(_)
            | Expr::PositionalParameter(_)
            | Expr::Subquery(_) => {}
            Expr::Field { base, name } => {
                f(base);
                f(name);
            }
            Expr::Element { base, index } => {
                f(base);
                f(index);
            }
            Expr::Slice { base, start, end } => {
                f(base);
                if let Some(s) = start {
                    f(s);
                }
                if let Some(e) = end {
                    f(e);
                }
            }
            Expr::Neg(x) | Expr::Not(x) | Expr::Exists(x) => f(x),
            Expr::IsMissing(x)
            | Expr::IsNotMissing(x)
            | Expr::IsNull(x)
            | Expr::IsNotNull(x)
            | Expr::IsValued(x)
            | Expr::IsNotValued(x) => f(x),
            Expr::Add(ops) | Expr::Mult(ops) | Expr::And(ops) | Expr::Or(ops) | Expr::Concat(ops) => {
                for op in ops {
                    f(op);
                }
            }
            Expr::Sub { left, right }
            | Expr::Div { left, right }
            | Expr::Mod { left, right }
            | Expr::Eq { left, right }
            | Expr::Le { left, right }
            | Expr::Lt { left, right }
            | Expr::Like { left, right } => {
                f(left);
                f(right);
            }
            Expr::Between { item, low, high } => {
                f(item);
                f(low);
                f(high);
            }
            Expr::In { item, list } | Expr::Within { item, list } => {
                f(item);
                f(list);
            }
            Expr::Any { bindings, satisfies }
            | Expr::Every { bindings, satisfies }
            | Expr::AnyEvery { bindings, satisfies } => {
                for b in bindings {
                    f(&b.source);
                }
                f(satisfies);
            }
            Expr::ArrayComp { mapping, bindings, when }
            | Expr::First { mapping, bindings, when } => {
                for b in bindings {
                    f(&b.source);
                }
                if let Some(w) = when {
                    f(w);
                }
                f(mapping);
            }
            Expr::ObjectComp {
                name,
                mapping,
                bindings,
                when,
            } => {
                for b in bindings {
                    f(&b.source);
                }
                if let Some(w) = when {
                    f(w);
                }
                f(name);
                f(mapping);
            }
            Expr::ArrayConstruct(ops) => {
                for op in ops {
                    f(op);
                }
            }
            Expr::ObjectConstruct(pairs) => {
                for (_, v) in pairs {
                    f(v);
                }
            }
            Expr::SimpleCase {
                search,
                whens,
                otherwise,
            } => {
                f(search);
                for (w, t) in whens {
                    f(w);
                    f(t);
                }
                if let Some(e) = otherwise {
                    f(e);
                }
            }
            Expr::SearchedCase { whens, otherwise } => {
                for (w, t) in whens {
                    f(w);
                    f(t);
                }
                if let Some(e) = otherwise {
                    f(e);
                }
            }
            Expr::Cover { covered, .. } => f(covered),
            Expr::Function { operands, .. } => {
                for op in operands {
                    f(op);
                }
            }
            Expr::Aggregate(agg) => {
                if let Some(op) = &agg.operand {
                    f(op);
                }
            }
        }
    }

    /// Rebuilds the node with every child mapped through `f`. Used by the
    /// normalization rewriter.
    pub fn map_children(
        self,
        f: &mut impl FnMut(Expr) -> crate::errors::Result<Expr>,
    ) -> crate::errors::Result<Expr> {
        let mapped = match self {
            leaf @ (Expr::Constant(_)
            | Expr::Identifier(_)
            | Expr::SelfRef
            | Expr::NamedParameter(_)
            | Expr::PositionalParameter(_)
            | Expr::Subquery(_)) => leaf,
            Expr::Field { base, name } => Expr::Field {
                base: Box::new(f(*base)?),
                name: Box::new(f(*name)?),
            },
            Expr::Element { base, index } => Expr::Element {
                base: Box::new(f(*base)?),
                index: Box::new(f(*index)?),
            },
            Expr::Slice { base, start, end } => Expr::Slice {
                base: Box::new(f(*base)?),
                start: match start {
                    Some(s) => Some(Box::new(f(*s)?)),
                    None => None,
                },
                end: match end {
                    Some(e) => Some(Box::new(f(*e)?)),
                    None => None,
                },
            },
            Expr::Neg(x) => Expr::Neg(Box::new(f(*x)?)),
            Expr::Not(x) => Expr::Not(Box::new(f(*x)?)),
            Expr::Exists(x) => Expr::Exists(Box::new(f(*x)?)),
            Expr::IsMissing(x) => Expr::IsMissing(Box::new(f(*x)?)),
            Expr::IsNotMissing(x) => Expr::IsNotMissing(Box::new(f(*x)?)),
            Expr::IsNull(x) => Expr::IsNull(Box::new(f(*x)?)),
            Expr::IsNotNull(x) => Expr::IsNotNull(Box::new(f(*x)?)),
            Expr::IsValued(x) => Expr::IsValued(Box::new(f(*x)?)),
            Expr::IsNotValued(x) => Expr::IsNotValued(Box::new(f(*x)?)),
            Expr::Add(ops) => Expr::Add(map_vec(ops, f)?),
            Expr::Mult(ops) => Expr::Mult(map_vec(ops, f)?),
            Expr::And(ops) => Expr::And(map_vec(ops, f)?),
            Expr::Or(ops) => Expr::Or(map_vec(ops, f)?),
            Expr::Concat(ops) => Expr::Concat(map_vec(ops, f)?),
            Expr::Sub { left, right } => Expr::Sub {
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            Expr::Div { left, right } => Expr::Div {
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            Expr::Mod { left, right } => Expr::Mod {
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            Expr::Eq { left, right } => Expr::Eq {
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            Expr::Le { left, right } => Expr::Le {
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            Expr::Lt { left, right } => Expr::Lt {
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            Expr::Like { left, right } => Expr::Like {
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            Expr::Between { item, low, high } => Expr::Between {
                item: Box::new(f(*item)?),
                low: Box::new(f(*low)?),
                high: Box::new(f(*high)?),
            },
            Expr::In { item, list } => Expr::In {
                item: Box::new(f(*item)?),
                list: Box::new(f(*list)?),
            },
            Expr::Within { item, list } => Expr::Within {
                item: Box::new(f(*item)?),
                list: Box::new(f(*list)?),
            },
            Expr::Any { bindings, satisfies } => Expr::Any {
                bindings: map_bindings(bindings, f)?,
                satisfies: Box::new(f(*satisfies)?),
            },
            Expr::Every { bindings, satisfies } => Expr::Every {
                bindings: map_bindings(bindings, f)?,
                satisfies: Box::new(f(*satisfies)?),
            },
            Expr::AnyEvery { bindings, satisfies } => Expr::AnyEvery {
                bindings: map_bindings(bindings, f)?,
                satisfies: Box::new(f(*satisfies)?),
            },
            Expr::ArrayComp { mapping, bindings, when } => Expr::ArrayComp {
                mapping: Box::new(f(*mapping)?),
                bindings: map_bindings(bindings, f)?,
                when: match when {
                    Some(w) => Some(Box::new(f(*w)?)),
                    None => None,
                },
            },
            Expr::First { mapping, bindings, when } => Expr::First {
                mapping: Box::new(f(*mapping)?),
                bindings: map_bindings(bindings, f)?,
                when: match when {
                    Some(w) => Some(Box::new(f(*w)?)),
                    None => None,
                },
            },
            Expr::ObjectComp {
                name,
                mapping,
                bindings,
                when,
            } => Expr::ObjectComp {
                name: Box::new(f(*name)?),
                mapping: Box::new(f(*mapping)?),
                bindings: map_bindings(bindings, f)?,
                when: match when {
                    Some(w) => Some(Box::new(f(*w)?)),
                    None => None,
                },
            },
            Expr::ArrayConstruct(ops) => Expr::ArrayConstruct(map_vec(ops, f)?),
            Expr::ObjectConstruct(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    out.push((k, f(v)?));
                }
                Expr::ObjectConstruct(out)
            }
            Expr::SimpleCase {
                search,
                whens,
                otherwise,
            } => Expr::SimpleCase {
                search: Box::new(f(*search)?),
                whens: map_whens(whens, f)?,
                otherwise: match otherwise {
                    Some(e) => Some(Box::new(f(*e)?)),
                    None => None,
                },
            },
            Expr::SearchedCase { whens, otherwise } => Expr::SearchedCase {
                whens: map_whens(whens, f)?,
                otherwise: match otherwise {
                    Some(e) => Some(Box::new(f(*e)?)),
                    None => None,
                },
            },
            Expr::Cover { covered, text } => Expr::Cover {
                covered: Box::new(f(*covered)?),
                text,
            },
            Expr::Function { func, operands } => Expr::Function {
                func,
                operands: map_vec(operands, f)?,
            },
            Expr::Aggregate(agg) => Expr::Aggregate(Aggregate {
                kind: agg.kind,
                operand: match agg.operand {
                    Some(op) => Some(Box::new(f(*op)?)),
                    None => None,
                },
                distinct: agg.distinct,
            }),
        };
        Ok(mapped)
    }

    /// Collects every aggregate reference in the subtree.
    pub fn collect_aggregates(&self, out: &mut Vec<Aggregate>) {
        if let Expr::Aggregate(agg) = self {
            if !out.iter().any(|a| a.text() == agg.text()) {
                out.push(agg.clone());
            }
        }
        for child in self.children() {
            child.collect_aggregates(out);
        }
    }
}

fn map_vec(
    ops: Vec<Expr>,
    f: &mut impl FnMut(Expr) -> crate::errors::Result<Expr>,
) -> crate::errors::Result<Vec<Expr>> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        out.push(f(op)?);
    }
    Ok(out)
}

fn map_bindings(
    bindings: Vec<Binding>,
    f: &mut impl FnMut(Expr) -> crate::errors::Result<Expr>,
) -> crate::errors::Result<Vec<Binding>> {
    let mut out = Vec::with_capacity(bindings.len());
    for b in bindings {
        out.push(Binding {
            variable: b.variable,
            source: f(b.source)?,
            descend: b.descend,
        });
    }
    Ok(out)
}

fn map_whens(
    whens: Vec<(Expr, Expr)>,
    f: &mut impl FnMut(Expr) -> crate::errors::Result<Expr>,
) -> crate::errors::Result<Vec<(Expr, Expr)>> {
    let mut out = Vec::with_capacity(whens.len());
    for (w, t) in whens {
        out.push((f(w)?, f(t)?));
    }
    Ok(out)
}

/// Builds an object-construct expression from alias/expr pairs; used by
/// projections.
pub fn object_of(pairs: Vec<(String, Expr)>) -> Expr {
    Expr::ObjectConstruct(pairs)
}
