//! Classifier accounting invariants over generated predicates.

use std::collections::BTreeMap;

use siftdb::expression::Expr;
use siftdb::planner::{classify_expr, BaseKeyspace};

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

fn eq(alias: &str, field: &str, v: i64) -> Expr {
    Expr::eq(Expr::path(alias, field), Expr::constant(v))
}

fn join_pred(left: &str, right: &str) -> Expr {
    Expr::eq(Expr::path(left, "id"), Expr::path(right, "lid"))
}

#[test]
fn test_filter_count_matches_and_arity() {
    // conjuncts that mention exactly one keyspace land as one filter
    // each; constant-true conjuncts vanish
    let cases: Vec<(Vec<Expr>, usize)> = vec![
        (vec![eq("k", "x", 1)], 1),
        (vec![eq("k", "x", 1), eq("k", "y", 2)], 2),
        (vec![eq("k", "x", 1), Expr::constant(true), eq("k", "z", 3)], 2),
        (
            vec![
                eq("k", "a", 1),
                eq("k", "b", 2),
                eq("k", "c", 3),
                eq("k", "d", 4),
            ],
            4,
        ),
    ];
    for (conjuncts, expected) in cases {
        let mut base = table(&["k"]);
        let pred = Expr::And(conjuncts);
        classify_expr(&pred, &mut base, false).unwrap();
        let total: usize = base.values().map(|b| b.filters.len()).sum();
        assert_eq!(total, expected, "{}", pred);
        assert_eq!(base["k"].join_filters.len(), 0);
    }
}

#[test]
fn test_join_conjunct_appears_in_every_referenced_keyspace() {
    let mut base = table(&["l", "r", "s"]);
    let three_way = Expr::And(vec![
        Expr::eq(Expr::path("l", "a"), Expr::path("r", "b")),
        Expr::eq(Expr::path("r", "b"), Expr::path("s", "c")),
    ]);
    classify_expr(&three_way, &mut base, false).unwrap();

    // each conjunct references two keyspaces and must appear in both
    assert_eq!(base["l"].join_filters.len(), 1);
    assert_eq!(base["r"].join_filters.len(), 2);
    assert_eq!(base["s"].join_filters.len(), 1);
    let total: usize = base.values().map(|b| b.join_filters.len()).sum();
    assert_eq!(total, 4);
}

#[test]
fn test_mixed_predicate_partitions_cleanly() {
    let mut base = table(&["l", "r"]);
    let pred = Expr::And(vec![
        eq("l", "x", 1),
        join_pred("l", "r"),
        eq("r", "y", 2),
        Expr::constant(true),
    ]);
    classify_expr(&pred, &mut base, false).unwrap();

    assert_eq!(base["l"].filters.len(), 1);
    assert_eq!(base["r"].filters.len(), 1);
    assert_eq!(base["l"].join_filters.len(), 1);
    assert_eq!(base["r"].join_filters.len(), 1);

    // normalized and original forms both survive
    let filter = &base["l"].filters[0];
    assert!(filter.orig_expr.is_some());
    assert!(!filter.is_join());
    assert!(base["l"].join_filters[0].is_join());
}

#[test]
fn test_multi_keyspace_or_extracts_per_keyspace_fragments() {
    let mut base = table(&["l", "r"]);
    let pred = Expr::Or(vec![
        Expr::And(vec![eq("l", "x", 1), eq("r", "y", 2)]),
        Expr::And(vec![eq("l", "x", 3), eq("r", "y", 4)]),
    ]);
    classify_expr(&pred, &mut base, false).unwrap();

    // each side gets: the OR join filter, plus an extracted
    // single-keyspace OR of its own fragments
    for alias in ["l", "r"] {
        assert_eq!(base[alias].join_filters.len(), 1, "{}", alias);
        assert_eq!(base[alias].filters.len(), 1, "{}", alias);
        match &base[alias].filters[0].fltr_expr {
            Expr::Or(ops) => assert_eq!(ops.len(), 2),
            other => panic!("expected extracted OR, got {}", other),
        }
    }
}

#[test]
fn test_extraction_fails_when_a_disjunct_is_silent() {
    // the second disjunct says nothing about l, so no l-only OR exists
    let mut base = table(&["l", "r"]);
    let pred = Expr::Or(vec![
        Expr::And(vec![eq("l", "x", 1), eq("r", "y", 2)]),
        eq("r", "y", 4),
    ]);
    classify_expr(&pred, &mut base, false).unwrap();

    assert_eq!(base["l"].filters.len(), 0);
    // r appears in every disjunct, so r still gets an extracted OR
    assert_eq!(base["r"].filters.len(), 1);
}

#[test]
fn test_between_rewrite_recurses_with_original_preserved() {
    let mut base = table(&["k"]);
    let pred = Expr::Between {
        item: Box::new(Expr::path("k", "x")),
        low: Box::new(Expr::constant(1)),
        high: Box::new(Expr::constant(9)),
    };
    classify_expr(&pred, &mut base, false).unwrap();

    // the rewrite split it into two conjuncts
    assert_eq!(base["k"].filters.len(), 2);
    // the original text is recorded exactly once across the recursion
    let originals: Vec<_> = base["k"]
        .filters
        .iter()
        .filter_map(|f| f.orig_expr.as_ref())
        .collect();
    assert_eq!(originals.len(), 1);
    assert!(originals[0].equivalent_to(&pred));
}

#[test]
fn test_not_in_lowers_and_classifies() {
    let mut base = table(&["k"]);
    let pred = Expr::not(Expr::In {
        item: Box::new(Expr::path("k", "x")),
        list: Box::new(Expr::Constant(siftdb::value::Value::from(
            serde_json::json!([1, 2]),
        ))),
    });
    classify_expr(&pred, &mut base, false).unwrap();

    // NOT IN becomes a conjunction of negated equalities
    assert_eq!(base["k"].filters.len(), 2);
}

#[test]
fn test_empty_table_is_an_error() {
    let mut empty = BTreeMap::new();
    let err = classify_expr(&eq("k", "x", 1), &mut empty, false).unwrap_err();
    assert_eq!(err.kind(), siftdb::errors::ErrorKind::Plan);
}
