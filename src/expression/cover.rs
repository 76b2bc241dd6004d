//! Covering analysis for index selection.
//!
//! `covered_by` decides whether an expression can be answered from a list
//! of index expressions without fetching the document. `filter_covers`
//! derives the expressions a partial-index WHERE clause implicitly pins.

use std::collections::HashMap;

use crate::value::{Value, TRUE_VALUE};

use super::Expr;

/// Outcome of a covering check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Covered {
    /// Not covered; dominates the whole fold.
    False,
    /// Covering cannot be established at this node; the enclosing field
    /// decides.
    Continue,
    /// Not related to the keyspace under test; ignored.
    Skip,
    /// Covered by an equivalent entry; trickles to the outermost field so
    /// inner terms can terminate checking.
    Equiv,
    /// Covered.
    True,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoverOptions {
    /// The parent has exactly one child.
    pub is_single: bool,
    /// A sibling was skipped as unrelated.
    pub skip: bool,
    /// Propagate Equiv instead of True on an exact match.
    pub trickle_equiv: bool,
}

impl Expr {
    /// Whether this expression over keyspace `alias` is covered by
    /// `exprs` (typically index keys plus the primary-key expression).
    pub fn covered_by(&self, alias: &str, exprs: &[Expr], mut options: CoverOptions) -> Covered {
        match self {
            Expr::Cover { .. } => Covered::True,
            Expr::Constant(_)
            | Expr::NamedParameter(_)
            | Expr::PositionalParameter(_) => Covered::Skip,

            Expr::Identifier(name) => {
                if name != alias {
                    return Covered::Skip;
                }
                for e in exprs {
                    if self.equivalent_to(e) {
                        return Covered::True;
                    }
                }
                // A keyspace as a bare term is not covered; as part of a
                // path, the enclosing field decides.
                if options.is_single {
                    Covered::Continue
                } else {
                    Covered::False
                }
            }

            Expr::Field { base, .. } => {
                for e in exprs {
                    if self.equivalent_to(e) {
                        return if options.trickle_equiv {
                            Covered::Equiv
                        } else {
                            Covered::True
                        };
                    }
                }
                options.is_single = true;
                match base.covered_by(alias, exprs, options) {
                    Covered::False => Covered::False,
                    Covered::Skip => Covered::Skip,
                    // the base alone reached the keyspace and this field is
                    // not among the index expressions
                    Covered::Continue => Covered::False,
                    Covered::Equiv => Covered::Equiv,
                    Covered::True => Covered::True,
                }
            }

            _ => {
                for e in exprs {
                    if self.equivalent_to(e) {
                        return Covered::True;
                    }
                }
                let children = self.children();
                options.is_single = children.len() == 1;
                let mut rv = Covered::True;
                let mut all_skip = !children.is_empty();
                for child in children {
                    match child.covered_by(alias, exprs, options) {
                        Covered::False | Covered::Continue => return Covered::False,
                        Covered::Skip => {
                            options.skip = true;
                        }
                        Covered::Equiv => {
                            options.skip = true;
                            all_skip = false;
                            if options.trickle_equiv {
                                rv = Covered::Equiv;
                            }
                        }
                        Covered::True => {
                            all_skip = false;
                        }
                    }
                }
                if all_skip {
                    Covered::Skip
                } else {
                    rv
                }
            }
        }
    }

    /// Implicit covers contributed by this predicate when it appears in a
    /// partial-index WHERE clause: the predicate itself is known TRUE for
    /// every indexed entry, and an equality additionally pins its
    /// non-constant side. AND unions children; OR keeps only covers every
    /// disjunct agrees on.
    pub fn filter_covers(&self, covers: &mut HashMap<String, Value>) {
        match self {
            Expr::And(ops) => {
                for op in ops {
                    op.filter_covers(covers);
                }
            }
            Expr::Or(ops) => {
                let Some((first, rest)) = ops.split_first() else {
                    return;
                };
                let mut common = HashMap::new();
                first.filter_covers(&mut common);
                if common.is_empty() {
                    return;
                }
                for op in rest {
                    let mut next = HashMap::new();
                    op.filter_covers(&mut next);
                    if next.is_empty() {
                        return;
                    }
                    common.retain(|k, v| {
                        next.get(k)
                            .map_or(false, |vn| v.equals(vn).truth())
                    });
                    if common.is_empty() {
                        return;
                    }
                }
                covers.extend(common);
            }
            Expr::Eq { left, right } => {
                covers.insert(self.to_string(), TRUE_VALUE);
                match (left.constant_value(), right.constant_value()) {
                    (Some(v), None) => {
                        covers.insert(right.to_string(), v);
                    }
                    (None, Some(v)) => {
                        covers.insert(left.to_string(), v);
                    }
                    _ => {}
                }
            }
            Expr::Le { .. }
            | Expr::Lt { .. }
            | Expr::Like { .. }
            | Expr::Between { .. }
            | Expr::In { .. }
            | Expr::Within { .. }
            | Expr::IsMissing(_)
            | Expr::IsNotMissing(_)
            | Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::IsValued(_)
            | Expr::IsNotValued(_)
            | Expr::Not(_)
            | Expr::Exists(_)
            | Expr::Any { .. }
            | Expr::Every { .. }
            | Expr::AnyEvery { .. } => {
                covers.insert(self.to_string(), TRUE_VALUE);
            }
            _ => {}
        }
    }

    /// Like [`filter_covers`](Self::filter_covers), but pairs each cover
    /// with the actual subtree expression so callers can run equivalence
    /// checks against it. OR keeps only pairs whose text survives the
    /// intersection.
    pub fn filter_cover_exprs(&self) -> Vec<(Expr, Value)> {
        let mut surviving = HashMap::new();
        self.filter_covers(&mut surviving);
        let mut out = Vec::new();
        self.collect_cover_exprs(&surviving, &mut out);
        out.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        out.dedup_by(|a, b| a.0.to_string() == b.0.to_string());
        out
    }

    fn collect_cover_exprs(
        &self,
        surviving: &HashMap<String, Value>,
        out: &mut Vec<(Expr, Value)>,
    ) {
        let mut push = |e: &Expr, out: &mut Vec<(Expr, Value)>| {
            if let Some(v) = surviving.get(&e.to_string()) {
                out.push((e.clone(), v.clone()));
            }
        };
        match self {
            Expr::And(ops) => {
                for op in ops {
                    op.collect_cover_exprs(surviving, out);
                }
            }
            Expr::Or(ops) => {
                // every disjunct agrees; the first carries the shapes
                if let Some(first) = ops.first() {
                    first.collect_cover_exprs(surviving, out);
                }
            }
            Expr::Eq { left, right } => {
                push(self, out);
                push(left, out);
                push(right, out);
            }
            _ => push(self, out),
        }
    }
}
