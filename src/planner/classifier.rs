//! Predicate classifier.
//!
//! Breaks a predicate on AND boundaries and attributes each conjunct to
//! the keyspaces it references. Single-keyspace conjuncts land in that
//! keyspace's `filters`; multi-keyspace conjuncts land in every
//! referenced keyspace's `join_filters`. A multi-keyspace OR additionally
//! yields, per keyspace, the OR of its keyspace-only fragments as a new
//! single-keyspace filter, which is what makes union scans possible.

use std::collections::{BTreeMap, HashSet};

use crate::errors::{Error, Result};
use crate::expression::Expr;

use super::dnf::{flatten_or, Dnf};
use super::keyspace::{copy_base_keyspaces, BaseKeyspace, Filter};

/// Classifies `expr` into `base_keyspaces`.
pub fn classify_expr(
    expr: &Expr,
    base_keyspaces: &mut BTreeMap<String, BaseKeyspace>,
    is_onclause: bool,
) -> Result<()> {
    if base_keyspaces.is_empty() {
        return Err(Error::plan("classify_expr: empty base keyspace table"));
    }
    let mut classifier = Classifier::new(base_keyspaces, is_onclause);
    match expr {
        Expr::And(ops) => classifier.visit_and(ops),
        other => classifier.visit_default(other),
    }
}

struct Classifier<'a> {
    base_keyspaces: &'a mut BTreeMap<String, BaseKeyspace>,
    keyspace_names: HashSet<String>,
    recursion: bool,
    recurse_expr: Option<Expr>,
    recursion_join: bool,
    recurse_join_expr: Option<Expr>,
    is_onclause: bool,
}

impl<'a> Classifier<'a> {
    fn new(base_keyspaces: &'a mut BTreeMap<String, BaseKeyspace>, is_onclause: bool) -> Self {
        let keyspace_names = base_keyspaces.keys().cloned().collect();
        Self {
            base_keyspaces,
            keyspace_names,
            recursion: false,
            recurse_expr: None,
            recursion_join: false,
            recurse_join_expr: None,
            is_onclause,
        }
    }

    fn visit_and(&mut self, ops: &[Expr]) -> Result<()> {
        for op in ops {
            match op {
                Expr::And(inner) => self.visit_and(inner)?,
                other => self.visit_default(other)?,
            }
        }
        Ok(())
    }

    fn visit_default(&mut self, expr: &Expr) -> Result<()> {
        // Constant-true conjuncts carry no information.
        if let Some(v) = expr.constant_value() {
            if v.truth() {
                return Ok(());
            }
        }

        let mut keyspaces = expr.keyspace_references(&self.keyspace_names);
        if keyspaces.is_empty() {
            return Ok(());
        }

        // Expression-level normalization without full DNF.
        let dnf_expr = Dnf::new(false).map(expr.clone())?;

        // When the rewrite exposes new AND terms, recurse into them,
        // remembering the original text once per recursion chain.
        if let Expr::And(ops) = &dnf_expr {
            if keyspaces.len() == 1 {
                let saved = self.recursion;
                self.recursion = true;
                if self.recurse_expr.is_none() {
                    self.recurse_expr = Some(expr.clone());
                }
                let result = self.visit_and(ops);
                self.recursion = saved;
                return result;
            } else {
                let saved = self.recursion_join;
                self.recursion_join = true;
                if self.recurse_join_expr.is_none() {
                    self.recurse_join_expr = Some(expr.clone());
                }
                let result = self.visit_and(ops);
                self.recursion_join = saved;
                return result;
            }
        }

        // The original (pre-rewrite) expression: taken from the recursion
        // chain once, or this conjunct itself.
        let orig_expr = if keyspaces.len() == 1 {
            if self.recursion {
                self.recurse_expr.take()
            } else {
                Some(expr.clone())
            }
        } else if self.recursion_join {
            self.recurse_join_expr.take()
        } else {
            Some(expr.clone())
        };

        let is_join = keyspaces.len() > 1;

        if self.is_onclause {
            // Keyspaces whose plan is final already had this predicate
            // pushed into their side.
            keyspaces.retain(|name| {
                self.base_keyspaces
                    .get(name)
                    .map_or(true, |k| !k.plan_done())
            });
        }

        let keyspace_list: Vec<String> = keyspaces.iter().cloned().collect();
        for name in &keyspace_list {
            if !self.base_keyspaces.contains_key(name) {
                return Err(Error::plan_internal(format!(
                    "classifier: missing keyspace {}",
                    name
                )));
            }

            let filter = Filter::new(
                dnf_expr.clone(),
                orig_expr.clone(),
                keyspaces.clone(),
                self.is_onclause,
                is_join,
            );

            if keyspace_list.len() == 1 {
                self.base_keyspaces
                    .get_mut(name)
                    .unwrap()
                    .filters
                    .push(filter);
            } else {
                self.base_keyspaces
                    .get_mut(name)
                    .unwrap()
                    .join_filters
                    .push(filter);

                // A multi-keyspace OR may still pin each keyspace on its
                // own: extract the per-keyspace fragments.
                if let Expr::Or(_) = &dnf_expr {
                    if let Some((new_pred, new_orig, or_is_join)) =
                        self.extract_expr(&dnf_expr, name)?
                    {
                        let mut single = HashSet::new();
                        single.insert(name.clone());
                        let extracted =
                            Filter::new(new_pred, new_orig, single, self.is_onclause, or_is_join);
                        self.base_keyspaces
                            .get_mut(name)
                            .unwrap()
                            .filters
                            .push(extracted);
                    }
                }
            }
        }

        Ok(())
    }

    /// Classifies each OR disjunct against a copy of the table and ANDs
    /// together the fragments attributed to `keyspace` alone. Succeeds
    /// only when every disjunct contributes something for the keyspace.
    fn extract_expr(
        &self,
        or_expr: &Expr,
        keyspace: &str,
    ) -> Result<Option<(Expr, Option<Expr>, bool)>> {
        let (Some(disjuncts), truth) = flatten_or(or_expr) else {
            return Ok(None);
        };
        if truth || disjuncts.is_empty() {
            return Ok(None);
        }

        let mut new_terms = Vec::with_capacity(disjuncts.len());
        let mut new_orig_terms = Vec::with_capacity(disjuncts.len());
        let mut is_join = false;

        for disjunct in &disjuncts {
            let mut copies = copy_base_keyspaces(self.base_keyspaces);
            classify_expr(disjunct, &mut copies, self.is_onclause)?;

            let Some(kspace) = copies.get(keyspace) else {
                return Ok(None);
            };
            if kspace.filters.is_empty() {
                // this disjunct says nothing about the keyspace alone
                return Ok(None);
            }

            let mut term: Option<Expr> = None;
            let mut orig_term: Option<Expr> = None;
            for fl in &kspace.filters {
                term = Some(match term {
                    None => fl.fltr_expr.clone(),
                    Some(t) => Expr::And(vec![t, fl.fltr_expr.clone()]),
                });
                if let Some(orig) = &fl.orig_expr {
                    orig_term = Some(match orig_term {
                        None => orig.clone(),
                        Some(t) => Expr::And(vec![t, orig.clone()]),
                    });
                }
                is_join = is_join || fl.is_join();
            }

            new_terms.push(term.unwrap());
            if let Some(o) = orig_term {
                new_orig_terms.push(o);
            }
        }

        let orig = if new_orig_terms.is_empty() {
            None
        } else {
            Some(Expr::Or(new_orig_terms))
        };
        Ok(Some((Expr::Or(new_terms), orig, is_join)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(aliases: &[&str]) -> BTreeMap<String, BaseKeyspace> {
        aliases
            .iter()
            .map(|a| {
                (
                    a.to_string(),
                    BaseKeyspace::new(*a, format!("default:{}", a)),
                )
            })
            .collect()
    }

    #[test]
    fn test_conjuncts_attributed_to_single_keyspace() {
        let mut base = table(&["k"]);
        let pred = Expr::And(vec![
            Expr::eq(Expr::path("k", "x"), Expr::constant(1)),
            Expr::eq(Expr::path("k", "y"), Expr::constant(2)),
        ]);
        classify_expr(&pred, &mut base, false).unwrap();
        assert_eq!(base["k"].filters.len(), 2);
        assert!(base["k"].join_filters.is_empty());
    }

    #[test]
    fn test_join_conjunct_lands_in_every_keyspace() {
        let mut base = table(&["l", "r"]);
        let pred = Expr::eq(Expr::path("l", "id"), Expr::path("r", "lid"));
        classify_expr(&pred, &mut base, false).unwrap();
        assert_eq!(base["l"].join_filters.len(), 1);
        assert_eq!(base["r"].join_filters.len(), 1);
        assert!(base["l"].filters.is_empty());
        assert!(base["r"].filters.is_empty());
    }

    #[test]
    fn test_constant_true_conjunct_dropped() {
        let mut base = table(&["k"]);
        let pred = Expr::And(vec![
            Expr::constant(true),
            Expr::eq(Expr::path("k", "x"), Expr::constant(1)),
        ]);
        classify_expr(&pred, &mut base, false).unwrap();
        assert_eq!(base["k"].filters.len(), 1);
    }

    #[test]
    fn test_conjunct_accounting() {
        // filters across keyspaces == AND-arity minus dropped conjuncts;
        // each join conjunct appears in exactly |keyspaces| join lists
        let mut base = table(&["l", "r"]);
        let pred = Expr::And(vec![
            Expr::eq(Expr::path("l", "x"), Expr::constant(1)),
            Expr::eq(Expr::path("r", "y"), Expr::constant(2)),
            Expr::eq(Expr::path("l", "id"), Expr::path("r", "lid")),
            Expr::constant(true),
        ]);
        classify_expr(&pred, &mut base, false).unwrap();
        let filters: usize = base.values().map(|k| k.filters.len()).sum();
        assert_eq!(filters, 2);
        let join_filters: usize = base.values().map(|k| k.join_filters.len()).sum();
        assert_eq!(join_filters, 2);
    }

    #[test]
    fn test_rewrite_recursion_preserves_original() {
        // BETWEEN rewrites to an AND; both new conjuncts keep the original
        // expression, recorded once
        let mut base = table(&["k"]);
        let pred = Expr::Between {
            item: Box::new(Expr::path("k", "x")),
            low: Box::new(Expr::constant(1)),
            high: Box::new(Expr::constant(5)),
        };
        classify_expr(&pred, &mut base, false).unwrap();
        assert_eq!(base["k"].filters.len(), 2);
        let with_orig: Vec<_> = base["k"]
            .filters
            .iter()
            .filter(|f| f.orig_expr.is_some())
            .collect();
        assert_eq!(with_orig.len(), 1);
        assert!(with_orig[0]
            .orig_expr
            .as_ref()
            .unwrap()
            .equivalent_to(&pred));
    }

    #[test]
    fn test_or_extraction_enables_union_scan() {
        // (l.x=1 and r.y=2) or (l.x=3 and r.y=4): per-keyspace fragments
        // are extracted as single-keyspace OR filters
        let mut base = table(&["l", "r"]);
        let pred = Expr::Or(vec![
            Expr::And(vec![
                Expr::eq(Expr::path("l", "x"), Expr::constant(1)),
                Expr::eq(Expr::path("r", "y"), Expr::constant(2)),
            ]),
            Expr::And(vec![
                Expr::eq(Expr::path("l", "x"), Expr::constant(3)),
                Expr::eq(Expr::path("r", "y"), Expr::constant(4)),
            ]),
        ]);
        classify_expr(&pred, &mut base, false).unwrap();

        // the OR itself is a join filter on both sides
        assert_eq!(base["l"].join_filters.len(), 1);
        assert_eq!(base["r"].join_filters.len(), 1);

        // and each side gained an extracted single-keyspace OR
        assert_eq!(base["l"].filters.len(), 1);
        assert_eq!(base["r"].filters.len(), 1);
        match &base["l"].filters[0].fltr_expr {
            Expr::Or(ops) => assert_eq!(ops.len(), 2),
            other => panic!("expected OR, got {}", other),
        }
    }

    #[test]
    fn test_single_keyspace_or_extraction() {
        // (x=1 and y=2) or (x=1 and y=3) on one keyspace stays a filter;
        // extraction only fires for multi-keyspace ORs
        let mut base = table(&["k"]);
        let pred = Expr::Or(vec![
            Expr::And(vec![
                Expr::eq(Expr::path("k", "x"), Expr::constant(1)),
                Expr::eq(Expr::path("k", "y"), Expr::constant(2)),
            ]),
            Expr::And(vec![
                Expr::eq(Expr::path("k", "x"), Expr::constant(1)),
                Expr::eq(Expr::path("k", "y"), Expr::constant(3)),
            ]),
        ]);
        classify_expr(&pred, &mut base, false).unwrap();
        assert_eq!(base["k"].filters.len(), 1);
        assert!(base["k"].join_filters.is_empty());
    }

    #[test]
    fn test_onclause_drops_planned_keyspaces() {
        let mut base = table(&["l", "r"]);
        base.get_mut("l").unwrap().set_plan_done();
        let pred = Expr::eq(Expr::path("l", "id"), Expr::path("r", "lid"));
        classify_expr(&pred, &mut base, true).unwrap();
        // l is finalized: the predicate attributes to r alone
        assert!(base["l"].join_filters.is_empty());
        assert_eq!(base["r"].filters.len(), 1);
    }

    #[test]
    fn test_unknown_keyspace_is_internal_error() {
        let mut base = table(&["k"]);
        // reference an alias that is in the name set but removed from the
        // table after name collection cannot happen through the public
        // API; an empty table is the reachable failure
        let pred = Expr::eq(Expr::path("k", "x"), Expr::constant(1));
        let mut empty = BTreeMap::new();
        assert!(classify_expr(&pred, &mut empty, false).is_err());
        classify_expr(&pred, &mut base, false).unwrap();
    }
}
