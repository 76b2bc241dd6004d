//! Sargability and index selection.
//!
//! Derives index spans from a keyspace's classified filters and picks the
//! scan: the index whose leading keys are equality-pinned by the most
//! filters wins, ties broken by covering status, then by span
//! selectivity. A sargable single-keyspace OR becomes a union of scans
//! deduplicated by primary key.

use std::collections::HashSet;
use std::sync::Arc;

use crate::datastore::{Inclusion, Index, Indexer};
use crate::errors::Result;
use crate::expression::{CoverOptions, Covered, Expr, Func};
use crate::plan::{IndexScanNode, KeyspaceRef, PlanNode, RangeExpr, SpanExpr};

use super::keyspace::BaseKeyspace;

/// Rewrites an index key expression (written against the document root)
/// into the query's alias space: free identifiers become alias paths.
pub fn qualify(expr: &Expr, alias: &str) -> Expr {
    qualify_inner(expr.clone(), alias, &mut Vec::new())
}

fn qualify_inner(expr: Expr, alias: &str, shadowed: &mut Vec<String>) -> Expr {
    match expr {
        Expr::Identifier(name) => {
            if shadowed.iter().any(|s| s == &name) {
                Expr::Identifier(name)
            } else {
                Expr::path(alias, name)
            }
        }
        Expr::SelfRef => Expr::ident(alias),
        other => {
            // binding variables shadow document fields inside quantifiers
            let vars: Vec<String> = match &other {
                Expr::Any { bindings, .. }
                | Expr::Every { bindings, .. }
                | Expr::AnyEvery { bindings, .. }
                | Expr::ArrayComp { bindings, .. }
                | Expr::First { bindings, .. }
                | Expr::ObjectComp { bindings, .. } => {
                    bindings.iter().map(|b| b.variable.clone()).collect()
                }
                _ => Vec::new(),
            };
            let depth = shadowed.len();
            shadowed.extend(vars);
            let out = other
                .map_children(&mut |c| Ok(qualify_inner(c, alias, shadowed)))
                .expect("qualify rewrite is infallible");
            shadowed.truncate(depth);
            out
        }
    }
}

/// The expression a covering scan uses for the primary key.
pub fn meta_id_expr(alias: &str) -> Expr {
    Expr::field(
        Expr::Function {
            func: Func::Meta,
            operands: vec![Expr::ident(alias)],
        },
        "id",
    )
}

/// Bounds gathered for one index key position.
#[derive(Debug, Clone, Default)]
struct KeyBounds {
    low: Option<(Expr, bool)>,
    high: Option<(Expr, bool)>,
    exact: bool,
}

impl KeyBounds {
    fn is_empty(&self) -> bool {
        self.low.is_none() && self.high.is_none()
    }

    fn to_range(&self) -> RangeExpr {
        let inclusion = match (
            self.low.as_ref().map(|(_, inc)| *inc),
            self.high.as_ref().map(|(_, inc)| *inc),
        ) {
            (Some(true), Some(true)) => Inclusion::Both,
            (Some(true), _) => Inclusion::Low,
            (_, Some(true)) => Inclusion::High,
            _ => Inclusion::Neither,
        };
        RangeExpr {
            low: self.low.as_ref().map(|(e, _)| e.clone()),
            high: self.high.as_ref().map(|(e, _)| e.clone()),
            inclusion,
        }
    }
}

/// A scored candidate scan over one index.
pub struct IndexCandidate {
    pub index: Arc<dyn Index>,
    pub spans: Vec<SpanExpr>,
    pub eq_pinned: usize,
    pub bounded_keys: usize,
    pub covering: bool,
}

/// Derives the sarg spans of `index` from `filters`. Returns None when
/// the leading key is unconstrained.
fn sarg_index(
    index: &Arc<dyn Index>,
    alias: &str,
    filters: &[&Expr],
) -> Option<(Vec<SpanExpr>, usize, usize)> {
    let qualified_keys: Vec<Expr> = index.keys().iter().map(|k| qualify(k, alias)).collect();
    if qualified_keys.is_empty() {
        return None;
    }

    let mut ranges = Vec::new();
    let mut eq_pinned = 0;
    let mut bounded = 0;
    for (pos, key) in qualified_keys.iter().enumerate() {
        let mut bounds = KeyBounds::default();
        for filter in filters.iter().copied() {
            collect_bounds(filter, key, alias, &mut bounds);
        }
        if bounds.is_empty() {
            break;
        }
        bounded += 1;
        if bounds.exact && eq_pinned == pos {
            eq_pinned += 1;
        }
        let exact = bounds.exact;
        ranges.push(bounds.to_range());
        if !exact {
            // a range key ends the sargable prefix
            break;
        }
    }

    if ranges.is_empty() {
        return None;
    }
    Some((
        vec![SpanExpr {
            seek: None,
            ranges,
        }],
        eq_pinned,
        bounded,
    ))
}

/// Accumulates the bounds one conjunct contributes to `key`.
fn collect_bounds(filter: &Expr, key: &Expr, alias: &str, bounds: &mut KeyBounds) {
    match filter {
        Expr::And(ops) => {
            for op in ops {
                collect_bounds(op, key, alias, bounds);
            }
        }
        Expr::Eq { left, right } => {
            if left.equivalent_to(key) && independent(right, alias) {
                bounds.low = Some(((**right).clone(), true));
                bounds.high = Some(((**right).clone(), true));
                bounds.exact = true;
            } else if right.equivalent_to(key) && independent(left, alias) {
                bounds.low = Some(((**left).clone(), true));
                bounds.high = Some(((**left).clone(), true));
                bounds.exact = true;
            }
        }
        Expr::Le { left, right } => {
            if left.equivalent_to(key) && independent(right, alias) {
                tighten_high(bounds, (**right).clone(), true);
            } else if right.equivalent_to(key) && independent(left, alias) {
                tighten_low(bounds, (**left).clone(), true);
            }
        }
        Expr::Lt { left, right } => {
            if left.equivalent_to(key) && independent(right, alias) {
                tighten_high(bounds, (**right).clone(), false);
            } else if right.equivalent_to(key) && independent(left, alias) {
                tighten_low(bounds, (**left).clone(), false);
            }
        }
        _ => {}
    }
}

/// A bound expression is usable when it does not reference the keyspace
/// being scanned; constants, parameters and nested-loop outer references
/// all qualify.
fn independent(expr: &Expr, alias: &str) -> bool {
    let mut names = HashSet::new();
    names.insert(alias.to_string());
    expr.keyspace_references(&names).is_empty()
}

fn tighten_low(bounds: &mut KeyBounds, expr: Expr, inclusive: bool) {
    if bounds.exact {
        return;
    }
    match &bounds.low {
        Some((existing, _)) => {
            if let (Some(a), Some(b)) = (existing.constant_value(), expr.constant_value()) {
                if b.collate(&a).is_gt() {
                    bounds.low = Some((expr, inclusive));
                }
            }
        }
        None => bounds.low = Some((expr, inclusive)),
    }
}

fn tighten_high(bounds: &mut KeyBounds, expr: Expr, inclusive: bool) {
    if bounds.exact {
        return;
    }
    match &bounds.high {
        Some((existing, _)) => {
            if let (Some(a), Some(b)) = (existing.constant_value(), expr.constant_value()) {
                if b.collate(&a).is_lt() {
                    bounds.high = Some((expr, inclusive));
                }
            }
        }
        None => bounds.high = Some((expr, inclusive)),
    }
}

/// Whether `exprs` are all answerable from `covers` plus the static
/// filter covers.
fn covers_all(
    exprs: &[&Expr],
    alias: &str,
    covers: &[Expr],
    filter_cover_keys: &[Expr],
) -> bool {
    let mut all: Vec<Expr> = covers.to_vec();
    all.extend(filter_cover_keys.iter().cloned());
    exprs.iter().all(|e| {
        matches!(
            e.covered_by(alias, &all, CoverOptions { trickle_equiv: false, ..Default::default() }),
            Covered::True | Covered::Equiv | Covered::Skip
        )
    })
}

/// Picks the scan for one keyspace term.
///
/// `required_exprs` are every expression the statement needs answered for
/// this term (projection, filter, order, group); they drive the covering
/// decision. Returns the scan node and whether it is covering.
pub fn choose_scan(
    term: &KeyspaceRef,
    base: &BaseKeyspace,
    indexer: &Arc<dyn Indexer>,
    required_exprs: &[&Expr],
    under_nl: bool,
    no_union_scan: bool,
) -> Result<(PlanNode, Vec<Expr>, Vec<(Expr, crate::value::Value)>)> {
    let filters = base.filter_exprs();
    let alias = &term.alias;

    let mut candidates: Vec<IndexCandidate> = Vec::new();
    for index in indexer.indexes()? {
        if index.is_primary() {
            continue;
        }
        // a partial index applies only when its condition is implied by
        // some filter
        if let Some(cond) = index.condition() {
            let qcond = qualify(cond, alias);
            let implied = filters.iter().any(|f| f.depends_on(&qcond) || f.equivalent_to(&qcond));
            if !implied {
                continue;
            }
        }
        if let Some((spans, eq_pinned, bounded)) = sarg_index(&index, alias, &filters) {
            let qualified: Vec<Expr> = index.keys().iter().map(|k| qualify(k, alias)).collect();
            let mut covers = qualified;
            covers.push(meta_id_expr(alias));

            let filter_cover_pairs = filter_cover_pairs(&index, alias);
            let cover_keys: Vec<Expr> =
                filter_cover_pairs.iter().map(|(e, _)| e.clone()).collect();
            let covering = covers_all(required_exprs, alias, &covers, &cover_keys);

            candidates.push(IndexCandidate {
                index,
                spans,
                eq_pinned,
                bounded_keys: bounded,
                covering,
            });
        }
    }

    // Most equality-pinned leading keys, then covering, then tighter
    // spans; index name as the deterministic tail.
    candidates.sort_by(|a, b| {
        b.eq_pinned
            .cmp(&a.eq_pinned)
            .then(b.covering.cmp(&a.covering))
            .then(b.bounded_keys.cmp(&a.bounded_keys))
            .then(a.index.name().cmp(b.index.name()))
    });

    if let Some(best) = candidates.into_iter().next() {
        let qualified: Vec<Expr> = best
            .index
            .keys()
            .iter()
            .map(|k| qualify(k, alias))
            .collect();
        let mut covers = Vec::new();
        let mut filter_covers = Vec::new();
        if best.covering {
            covers = qualified;
            covers.push(meta_id_expr(alias));
            filter_covers = filter_cover_pairs(&best.index, alias);
        }
        let node = PlanNode::IndexScan(IndexScanNode {
            term: term.clone(),
            index_name: best.index.name().to_string(),
            spans: best.spans,
            reverse: false,
            distinct: false,
            ordered: best.index.ordered(),
            projection: None,
            offset: None,
            limit: None,
            covers: covers.clone(),
            filter_covers: filter_covers.clone(),
            under_nl,
        });
        return Ok((node, covers, filter_covers));
    }

    // Union scan: a single sargable OR filter over this keyspace alone.
    if !no_union_scan {
        if let Some(union) = try_union_scan(term, base, indexer, under_nl)? {
            return Ok((union, Vec::new(), Vec::new()));
        }
    }

    Ok((
        PlanNode::PrimaryScan { term: term.clone() },
        Vec::new(),
        Vec::new(),
    ))
}

/// Static covers from a partial index condition, qualified to the alias.
fn filter_cover_pairs(index: &Arc<dyn Index>, alias: &str) -> Vec<(Expr, crate::value::Value)> {
    let Some(cond) = index.condition() else {
        return Vec::new();
    };
    qualify(cond, alias).filter_cover_exprs()
}

/// Builds `DistinctScan(UnionAll(scans))` when some OR filter sargs an
/// index per disjunct.
fn try_union_scan(
    term: &KeyspaceRef,
    base: &BaseKeyspace,
    indexer: &Arc<dyn Indexer>,
    under_nl: bool,
) -> Result<Option<PlanNode>> {
    let indexes = indexer.indexes()?;
    for filter in &base.filters {
        let Expr::Or(disjuncts) = &filter.fltr_expr else {
            continue;
        };
        let mut scans = Vec::with_capacity(disjuncts.len());
        let mut all_sarged = true;
        for disjunct in disjuncts {
            let d_filters = [disjunct];
            let mut best: Option<(Arc<dyn Index>, Vec<SpanExpr>, usize)> = None;
            for index in &indexes {
                if index.is_primary() || index.condition().is_some() {
                    continue;
                }
                let refs: Vec<&Expr> = d_filters.to_vec();
                if let Some((spans, eq, _)) = sarg_index(index, &term.alias, &refs) {
                    if best.as_ref().map_or(true, |(_, _, beq)| eq > *beq) {
                        best = Some((index.clone(), spans, eq));
                    }
                }
            }
            match best {
                Some((index, spans, _)) => scans.push(Arc::new(PlanNode::IndexScan(
                    IndexScanNode {
                        term: term.clone(),
                        index_name: index.name().to_string(),
                        spans,
                        reverse: false,
                        distinct: false,
                        ordered: index.ordered(),
                        projection: None,
                        offset: None,
                        limit: None,
                        covers: Vec::new(),
                        filter_covers: Vec::new(),
                        under_nl,
                    },
                ))),
                None => {
                    all_sarged = false;
                    break;
                }
            }
        }
        if all_sarged && scans.len() > 1 {
            return Ok(Some(PlanNode::DistinctScan {
                scan: Arc::new(PlanNode::UnionAll { children: scans }),
                limit: None,
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{Keyspace, MemoryDatastore};
    use crate::planner::classifier::classify_expr;
    use std::collections::BTreeMap;

    // the returned store keeps the keyspace (and the indexer's weak
    // reference to it) alive
    fn setup() -> (Arc<MemoryDatastore>, Arc<dyn Indexer>, KeyspaceRef) {
        let store = MemoryDatastore::new("t");
        let ns = store.add_namespace("default");
        let ks = ns.add_keyspace("k");
        let indexer = ks.indexer().unwrap();
        indexer
            .create_index("ix_x", vec![Expr::ident("x")], None, false)
            .unwrap();
        indexer
            .create_index(
                "ix_xy",
                vec![Expr::ident("x"), Expr::ident("y")],
                None,
                false,
            )
            .unwrap();
        (store, indexer, KeyspaceRef::new("default", "k", "k"))
    }

    fn classified(pred: Expr) -> BaseKeyspace {
        let mut base = BTreeMap::new();
        base.insert("k".to_string(), BaseKeyspace::new("k", "default:k"));
        classify_expr(&pred, &mut base, false).unwrap();
        base.remove("k").unwrap()
    }

    #[test]
    fn test_qualify_rewrites_identifiers() {
        let key = Expr::ident("x");
        let q = qualify(&key, "k");
        assert!(q.equivalent_to(&Expr::path("k", "x")));
    }

    #[test]
    fn test_more_equality_keys_wins() {
        let (_store, indexer, term) = setup();
        let base = classified(Expr::And(vec![
            Expr::eq(Expr::path("k", "x"), Expr::constant(1)),
            Expr::eq(Expr::path("k", "y"), Expr::constant(2)),
        ]));
        let (scan, _, _) = choose_scan(&term, &base, &indexer, &[], false, false).unwrap();
        match scan {
            PlanNode::IndexScan(node) => {
                assert_eq!(node.index_name, "ix_xy");
                assert_eq!(node.spans[0].ranges.len(), 2);
            }
            other => panic!("expected IndexScan, got {}", other.operator_name()),
        }
    }

    #[test]
    fn test_unconstrained_leading_key_falls_back_to_primary() {
        let (_store, indexer, term) = setup();
        let base = classified(Expr::eq(Expr::path("k", "z"), Expr::constant(1)));
        let (scan, _, _) = choose_scan(&term, &base, &indexer, &[], false, false).unwrap();
        assert!(matches!(scan, PlanNode::PrimaryScan { .. }));
    }

    #[test]
    fn test_range_bounds_derive_spans() {
        let (_store, indexer, term) = setup();
        let base = classified(Expr::And(vec![
            Expr::gt(Expr::path("k", "x"), Expr::constant(1)),
            Expr::le(Expr::path("k", "x"), Expr::constant(9)),
        ]));
        let (scan, _, _) = choose_scan(&term, &base, &indexer, &[], false, false).unwrap();
        match scan {
            PlanNode::IndexScan(node) => {
                let range = &node.spans[0].ranges[0];
                assert!(range.low.is_some());
                assert!(range.high.is_some());
                assert_eq!(range.inclusion, Inclusion::High);
            }
            other => panic!("expected IndexScan, got {}", other.operator_name()),
        }
    }

    #[test]
    fn test_covering_when_projection_within_keys() {
        let (_store, indexer, term) = setup();
        let base = classified(Expr::eq(Expr::path("k", "x"), Expr::constant(1)));
        let proj = Expr::path("k", "x");
        let required = vec![&proj];
        let (scan, covers, _) =
            choose_scan(&term, &base, &indexer, &required, false, false).unwrap();
        match scan {
            PlanNode::IndexScan(node) => {
                assert!(!node.covers.is_empty());
                assert!(!covers.is_empty());
            }
            other => panic!("expected IndexScan, got {}", other.operator_name()),
        }
    }

    #[test]
    fn test_not_covering_when_projection_outside_keys() {
        let (_store, indexer, term) = setup();
        let base = classified(Expr::eq(Expr::path("k", "x"), Expr::constant(1)));
        let proj = Expr::path("k", "other");
        let required = vec![&proj];
        let (scan, covers, _) =
            choose_scan(&term, &base, &indexer, &required, false, false).unwrap();
        match scan {
            PlanNode::IndexScan(node) => {
                assert!(node.covers.is_empty());
                assert!(covers.is_empty());
            }
            other => panic!("expected IndexScan, got {}", other.operator_name()),
        }
    }

    #[test]
    fn test_union_scan_from_or_filter() {
        let (_store, indexer, term) = setup();
        // OR over different leading keys of different indexes: x=1 or y=2
        // sargs ix_x and... y alone doesn't sarg ix_xy (y is second key),
        // so build an index on y first
        indexer
            .create_index("ix_y", vec![Expr::ident("y")], None, false)
            .unwrap();
        let base = classified(Expr::Or(vec![
            Expr::eq(Expr::path("k", "x"), Expr::constant(1)),
            Expr::eq(Expr::path("k", "y"), Expr::constant(2)),
        ]));
        let (scan, _, _) = choose_scan(&term, &base, &indexer, &[], false, false).unwrap();
        match scan {
            PlanNode::DistinctScan { scan, .. } => match scan.as_ref() {
                PlanNode::UnionAll { children } => assert_eq!(children.len(), 2),
                other => panic!("expected UnionAll, got {}", other.operator_name()),
            },
            other => panic!("expected DistinctScan, got {}", other.operator_name()),
        }
    }
}
