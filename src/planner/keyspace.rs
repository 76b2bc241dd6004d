//! Planner records pairing FROM-clause aliases with their attributed
//! predicates.

use std::collections::{BTreeMap, HashSet};

use crate::expression::Expr;

/// One classified conjunct. `fltr_expr` is the normalized form used for
/// sargability; `orig_expr` preserves the pre-rewrite text for
/// diagnostics and covering checks.
#[derive(Debug, Clone)]
pub struct Filter {
    pub fltr_expr: Expr,
    pub orig_expr: Option<Expr>,
    pub keyspaces: HashSet<String>,
    pub is_onclause: bool,
    pub is_join: bool,
}

impl Filter {
    pub fn new(
        fltr_expr: Expr,
        orig_expr: Option<Expr>,
        keyspaces: HashSet<String>,
        is_onclause: bool,
        is_join: bool,
    ) -> Self {
        Self {
            fltr_expr,
            orig_expr,
            keyspaces,
            is_onclause,
            is_join,
        }
    }

    pub fn is_join(&self) -> bool {
        self.is_join
    }
}

/// A FROM-clause keyspace with the predicates attributed to it.
/// `filters` hold single-keyspace conjuncts, `join_filters` conjuncts
/// spanning several keyspaces.
#[derive(Debug, Clone)]
pub struct BaseKeyspace {
    name: String,
    keyspace: String,
    pub filters: Vec<Filter>,
    pub join_filters: Vec<Filter>,
    plan_done: bool,
}

impl BaseKeyspace {
    pub fn new(alias: impl Into<String>, keyspace: impl Into<String>) -> Self {
        Self {
            name: alias.into(),
            keyspace: keyspace.into(),
            filters: Vec::new(),
            join_filters: Vec::new(),
            plan_done: false,
        }
    }

    /// The FROM-clause alias this record is keyed by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying keyspace's full name.
    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn plan_done(&self) -> bool {
        self.plan_done
    }

    pub fn set_plan_done(&mut self) {
        self.plan_done = true;
    }

    /// The conjunction of all single-keyspace filters, for span
    /// derivation.
    pub fn filter_exprs(&self) -> Vec<&Expr> {
        self.filters.iter().map(|f| &f.fltr_expr).collect()
    }
}

/// Fresh copies of the table with empty filter lists, preserving names
/// and plan state. The classifier's OR extraction classifies disjuncts
/// against copies so the primary table is untouched.
pub fn copy_base_keyspaces(
    base: &BTreeMap<String, BaseKeyspace>,
) -> BTreeMap<String, BaseKeyspace> {
    base.iter()
        .map(|(k, v)| {
            let mut copy = BaseKeyspace::new(v.name.clone(), v.keyspace.clone());
            if v.plan_done {
                copy.set_plan_done();
            }
            (k.clone(), copy)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_resets_filters() {
        let mut base = BTreeMap::new();
        let mut k = BaseKeyspace::new("k", "default:k");
        k.filters.push(Filter::new(
            Expr::constant(true),
            None,
            HashSet::new(),
            false,
            false,
        ));
        base.insert("k".to_string(), k);

        let copy = copy_base_keyspaces(&base);
        assert!(copy["k"].filters.is_empty());
        assert_eq!(copy["k"].keyspace(), "default:k");
    }
}
