//! Physical plan.
//!
//! An immutable DAG of operators produced by the planner and consumed by
//! the execution layer. One enum variant per operator; children are
//! shared via Arc so nested-loop operators can respawn subtrees.

use std::sync::Arc;

use serde_json::json;

use crate::algebra::{
    AlterIndex, CreateIndex, DropIndex, InsertValues, LetBinding, MergeDelete, MergeUpdate,
    OrderTerm, Projection, SetTerm, UnsetTerm,
};
use crate::datastore::{Inclusion, IndexProjection};
use crate::expression::{Aggregate, Expr};
use crate::value::Value;

/// A keyspace reference resolved at plan time; execution re-resolves it
/// against the datastore by name.
#[derive(Debug, Clone)]
pub struct KeyspaceRef {
    pub namespace: String,
    pub keyspace: String,
    pub alias: String,
}

impl KeyspaceRef {
    pub fn new(
        namespace: impl Into<String>,
        keyspace: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            keyspace: keyspace.into(),
            alias: alias.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}:{}", self.namespace, self.keyspace)
    }
}

/// A span range whose bounds are expressions, evaluated at scan time
/// (against the nested-loop outer item when the scan runs under one).
#[derive(Debug, Clone)]
pub struct RangeExpr {
    pub low: Option<Expr>,
    pub high: Option<Expr>,
    pub inclusion: Inclusion,
}

/// An index span with expression bounds.
#[derive(Debug, Clone)]
pub struct SpanExpr {
    pub seek: Option<Vec<Expr>>,
    pub ranges: Vec<RangeExpr>,
}

impl SpanExpr {
    /// Full-index span.
    pub fn whole() -> Self {
        Self {
            seek: None,
            ranges: vec![RangeExpr {
                low: None,
                high: None,
                inclusion: Inclusion::Both,
            }],
        }
    }
}

/// Index scan payload (the Scan2-style scan: projection, reverse,
/// ordered, covering).
#[derive(Debug, Clone)]
pub struct IndexScanNode {
    pub term: KeyspaceRef,
    pub index_name: String,
    pub spans: Vec<SpanExpr>,
    pub reverse: bool,
    pub distinct: bool,
    pub ordered: bool,
    pub projection: Option<IndexProjection>,
    pub offset: Option<Expr>,
    pub limit: Option<Expr>,
    /// Cover expressions in index-key order, with the primary-key
    /// expression last; empty for non-covering scans.
    pub covers: Vec<Expr>,
    /// Static covers implied by a partial index condition.
    pub filter_covers: Vec<(Expr, Value)>,
    /// True for the inner side of a nested-loop join: span expressions
    /// may reference the outer item.
    pub under_nl: bool,
}

/// A physical operator.
#[derive(Debug, Clone)]
pub enum PlanNode {
    // Scans
    PrimaryScan {
        term: KeyspaceRef,
    },
    IndexScan(IndexScanNode),
    KeyScan {
        keys: Expr,
    },
    ValueScan {
        values: Expr,
    },
    DummyScan,
    ParentScan,
    CountScan {
        term: KeyspaceRef,
    },
    DistinctScan {
        scan: Arc<PlanNode>,
        limit: Option<Expr>,
    },
    IntersectScan {
        scans: Vec<Arc<PlanNode>>,
    },

    // Document assembly
    Fetch {
        term: KeyspaceRef,
    },
    /// Lookup join: per left item, fetch right documents by evaluated
    /// keys and attach each as `alias`.
    Join {
        term: KeyspaceRef,
        keys: Expr,
        outer: bool,
    },
    /// Lookup nest: like Join, but matched documents are gathered into
    /// one array-valued field.
    Nest {
        term: KeyspaceRef,
        keys: Expr,
        outer: bool,
    },
    Unnest {
        expr: Expr,
        alias: String,
        outer: bool,
    },
    /// ANSI nested-loop join; `child` is the inner subplan, reopened per
    /// outer item.
    NLJoin {
        child: Arc<PlanNode>,
        onclause: Expr,
        alias: String,
        outer: bool,
    },
    NLNest {
        child: Arc<PlanNode>,
        onclause: Expr,
        alias: String,
        outer: bool,
    },

    // Row operators
    Filter {
        condition: Expr,
    },
    Let {
        bindings: Vec<LetBinding>,
    },
    InitialProject {
        projection: Arc<Projection>,
    },
    FinalProject,
    InitialGroup {
        keys: Vec<Expr>,
        aggregates: Vec<Aggregate>,
    },
    IntermediateGroup {
        keys: Vec<Expr>,
        aggregates: Vec<Aggregate>,
    },
    FinalGroup {
        keys: Vec<Expr>,
        aggregates: Vec<Aggregate>,
    },
    Distinct,
    Order {
        terms: Vec<OrderTerm>,
    },
    Offset {
        expr: Expr,
    },
    Limit {
        expr: Expr,
    },

    // Composition
    UnionAll {
        children: Vec<Arc<PlanNode>>,
    },
    Sequence {
        children: Vec<Arc<PlanNode>>,
    },
    Parallel {
        child: Arc<PlanNode>,
    },
    Stream,
    Discard,

    // Mutation
    Clone,
    Set {
        alias: String,
        terms: Vec<SetTerm>,
    },
    Unset {
        alias: String,
        terms: Vec<UnsetTerm>,
    },
    SendInsert {
        term: KeyspaceRef,
        values: Vec<InsertValues>,
        upsert: bool,
    },
    SendUpdate {
        term: KeyspaceRef,
        limit: Option<Expr>,
    },
    SendDelete {
        term: KeyspaceRef,
        limit: Option<Expr>,
    },
    Merge {
        target: KeyspaceRef,
        key: Expr,
        update: Option<MergeUpdate>,
        delete: Option<MergeDelete>,
        insert: Option<Expr>,
    },

    // DDL
    CreateIndex {
        node: CreateIndex,
    },
    DropIndex {
        node: DropIndex,
    },
    AlterIndex {
        node: AlterIndex,
    },

    Explain {
        child: Arc<PlanNode>,
    },
}

impl PlanNode {
    pub fn operator_name(&self) -> &'static str {
        match self {
            PlanNode::PrimaryScan { .. } => "PrimaryScan",
            PlanNode::IndexScan(_) => "IndexScan2",
            PlanNode::KeyScan { .. } => "KeyScan",
            PlanNode::ValueScan { .. } => "ValueScan",
            PlanNode::DummyScan => "DummyScan",
            PlanNode::ParentScan => "ParentScan",
            PlanNode::CountScan { .. } => "CountScan",
            PlanNode::DistinctScan { .. } => "DistinctScan",
            PlanNode::IntersectScan { .. } => "IntersectScan",
            PlanNode::Fetch { .. } => "Fetch",
            PlanNode::Join { .. } => "Join",
            PlanNode::Nest { .. } => "Nest",
            PlanNode::Unnest { .. } => "Unnest",
            PlanNode::NLJoin { .. } => "NestedLoopJoin",
            PlanNode::NLNest { .. } => "NestedLoopNest",
            PlanNode::Filter { .. } => "Filter",
            PlanNode::Let { .. } => "Let",
            PlanNode::InitialProject { .. } => "InitialProject",
            PlanNode::FinalProject => "FinalProject",
            PlanNode::InitialGroup { .. } => "InitialGroup",
            PlanNode::IntermediateGroup { .. } => "IntermediateGroup",
            PlanNode::FinalGroup { .. } => "FinalGroup",
            PlanNode::Distinct => "Distinct",
            PlanNode::Order { .. } => "Order",
            PlanNode::Offset { .. } => "Offset",
            PlanNode::Limit { .. } => "Limit",
            PlanNode::UnionAll { .. } => "UnionAll",
            PlanNode::Sequence { .. } => "Sequence",
            PlanNode::Parallel { .. } => "Parallel",
            PlanNode::Stream => "Stream",
            PlanNode::Discard => "Discard",
            PlanNode::Clone => "Clone",
            PlanNode::Set { .. } => "Set",
            PlanNode::Unset { .. } => "Unset",
            PlanNode::SendInsert { .. } => "SendInsert",
            PlanNode::SendUpdate { .. } => "SendUpdate",
            PlanNode::SendDelete { .. } => "SendDelete",
            PlanNode::Merge { .. } => "Merge",
            PlanNode::CreateIndex { .. } => "CreateIndex",
            PlanNode::DropIndex { .. } => "DropIndex",
            PlanNode::AlterIndex { .. } => "AlterIndex",
            PlanNode::Explain { .. } => "Explain",
        }
    }

    /// True when some operator in the tree satisfies `pred`.
    pub fn contains(&self, pred: &dyn Fn(&PlanNode) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            PlanNode::DistinctScan { scan, .. } => scan.contains(pred),
            PlanNode::IntersectScan { scans } => scans.iter().any(|s| s.contains(pred)),
            PlanNode::NLJoin { child, .. }
            | PlanNode::NLNest { child, .. }
            | PlanNode::Parallel { child }
            | PlanNode::Explain { child } => child.contains(pred),
            PlanNode::UnionAll { children } | PlanNode::Sequence { children } => {
                children.iter().any(|c| c.contains(pred))
            }
            _ => false,
        }
    }

    /// EXPLAIN rendering.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = json!({ "#operator": self.operator_name() });
        match self {
            PlanNode::PrimaryScan { term } | PlanNode::CountScan { term } => {
                obj["keyspace"] = json!(term.full_name());
                obj["as"] = json!(term.alias);
            }
            PlanNode::IndexScan(node) => {
                obj["keyspace"] = json!(node.term.full_name());
                obj["as"] = json!(node.term.alias);
                obj["index"] = json!(node.index_name);
                obj["spans"] = json!(node
                    .spans
                    .iter()
                    .map(span_json)
                    .collect::<Vec<_>>());
                if !node.covers.is_empty() {
                    obj["covers"] = json!(node
                        .covers
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>());
                }
                if node.reverse {
                    obj["reverse"] = json!(true);
                }
                if node.distinct {
                    obj["distinct"] = json!(true);
                }
            }
            PlanNode::KeyScan { keys } => {
                obj["keys"] = json!(keys.to_string());
            }
            PlanNode::ValueScan { values } => {
                obj["values"] = json!(values.to_string());
            }
            PlanNode::DistinctScan { scan, .. } => {
                obj["scan"] = scan.to_json();
            }
            PlanNode::IntersectScan { scans } => {
                obj["scans"] = json!(scans.iter().map(|s| s.to_json()).collect::<Vec<_>>());
            }
            PlanNode::Fetch { term } => {
                obj["keyspace"] = json!(term.full_name());
                obj["as"] = json!(term.alias);
            }
            PlanNode::Join { term, keys, outer } | PlanNode::Nest { term, keys, outer } => {
                obj["keyspace"] = json!(term.full_name());
                obj["as"] = json!(term.alias);
                obj["on_keys"] = json!(keys.to_string());
                if *outer {
                    obj["outer"] = json!(true);
                }
            }
            PlanNode::Unnest { expr, alias, outer } => {
                obj["expr"] = json!(expr.to_string());
                obj["as"] = json!(alias);
                if *outer {
                    obj["outer"] = json!(true);
                }
            }
            PlanNode::NLJoin {
                child,
                onclause,
                alias,
                outer,
            }
            | PlanNode::NLNest {
                child,
                onclause,
                alias,
                outer,
            } => {
                obj["alias"] = json!(alias);
                obj["on_clause"] = json!(onclause.to_string());
                obj["~child"] = child.to_json();
                if *outer {
                    obj["outer"] = json!(true);
                }
            }
            PlanNode::Filter { condition } => {
                obj["condition"] = json!(condition.to_string());
            }
            PlanNode::Let { bindings } => {
                obj["bindings"] = json!(bindings
                    .iter()
                    .map(|b| json!({ "var": b.variable, "expr": b.expr.to_string() }))
                    .collect::<Vec<_>>());
            }
            PlanNode::InitialProject { projection } => {
                obj["result_terms"] = projection.signature();
                if projection.distinct {
                    obj["distinct"] = json!(true);
                }
            }
            PlanNode::InitialGroup { keys, aggregates }
            | PlanNode::IntermediateGroup { keys, aggregates }
            | PlanNode::FinalGroup { keys, aggregates } => {
                obj["group_keys"] =
                    json!(keys.iter().map(|k| k.to_string()).collect::<Vec<_>>());
                obj["aggregates"] =
                    json!(aggregates.iter().map(|a| a.text()).collect::<Vec<_>>());
            }
            PlanNode::Order { terms } => {
                obj["sort_terms"] = json!(terms
                    .iter()
                    .map(|t| json!({
                        "expr": t.expr.to_string(),
                        "desc": t.descending,
                    }))
                    .collect::<Vec<_>>());
            }
            PlanNode::Offset { expr } | PlanNode::Limit { expr } => {
                obj["expr"] = json!(expr.to_string());
            }
            PlanNode::UnionAll { children } | PlanNode::Sequence { children } => {
                obj["~children"] =
                    json!(children.iter().map(|c| c.to_json()).collect::<Vec<_>>());
            }
            PlanNode::Parallel { child } => {
                obj["~child"] = child.to_json();
            }
            PlanNode::Set { terms, .. } => {
                obj["set_terms"] = json!(terms
                    .iter()
                    .map(|t| json!({
                        "path": t.path.join("."),
                        "value": t.value.to_string(),
                    }))
                    .collect::<Vec<_>>());
            }
            PlanNode::Unset { terms, .. } => {
                obj["unset_terms"] = json!(terms
                    .iter()
                    .map(|t| t.path.join("."))
                    .collect::<Vec<_>>());
            }
            PlanNode::SendInsert { term, upsert, .. } => {
                obj["keyspace"] = json!(term.full_name());
                if *upsert {
                    obj["upsert"] = json!(true);
                }
            }
            PlanNode::SendUpdate { term, .. } | PlanNode::SendDelete { term, .. } => {
                obj["keyspace"] = json!(term.full_name());
            }
            PlanNode::Merge { target, key, .. } => {
                obj["keyspace"] = json!(target.full_name());
                obj["key"] = json!(key.to_string());
            }
            PlanNode::CreateIndex { node } => {
                obj["keyspace"] = json!(node.term.full_name());
                obj["index"] = json!(node.name);
            }
            PlanNode::DropIndex { node } => {
                obj["keyspace"] = json!(node.term.full_name());
                obj["index"] = json!(node.name);
            }
            PlanNode::AlterIndex { node } => {
                obj["keyspace"] = json!(node.term.full_name());
                obj["index"] = json!(node.name);
            }
            PlanNode::Explain { child } => {
                obj["~child"] = child.to_json();
            }
            _ => {}
        }
        obj
    }
}

fn span_json(span: &SpanExpr) -> serde_json::Value {
    json!({
        "ranges": span
            .ranges
            .iter()
            .map(|r| json!({
                "low": r.low.as_ref().map(|e| e.to_string()),
                "high": r.high.as_ref().map(|e| e.to_string()),
                "inclusion": format!("{:?}", r.inclusion),
            }))
            .collect::<Vec<_>>(),
    })
}
