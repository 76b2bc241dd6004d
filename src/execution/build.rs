//! Pipeline assembly: one task per plan operator.
//!
//! `spawn_plan` walks the plan and spawns every operator with its
//! bounded channels wired, returning a handle holding the terminal
//! output, the stop fan-out and the task handles. Panics in any operator
//! task are caught at the task boundary and surface as internal errors.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};

use crate::errors::{Error, Result};
use crate::plan::PlanNode;
use crate::value::AnnotatedValue;

use super::base::{
    run_operator, Operator, OperatorIo, Pipeline, ValueInput, ValueReceiver, ValueSender,
};
use super::context::{Context, PhaseId};
use super::ddl;
use super::fetch::Fetch;
use super::filter::{Filter, Let};
use super::group::{Group, GroupStage};
use super::join::{Join, Nest, Unnest};
use super::join_nl::{NestedLoop, NlKind};
use super::mutate;
use super::order::{Distinct, Limit, Offset, Order};
use super::project::{FinalProject, InitialProject};
use super::scan::{CountScan, DummyScan, KeyScan, ParentScan, PrimaryScan, ValueScan};
use super::scan_distinct::DistinctScan;
use super::scan_index::IndexScan;
use super::scan_intersect::IntersectScan;
use super::stream::{Discard, Stream};

struct Parts {
    stops: Vec<watch::Sender<bool>>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Spawns the whole plan. `parent` is the nested-loop outer item (or the
/// correlated-subquery item) visible to scans and producers.
pub fn spawn_plan(
    plan: &Arc<PlanNode>,
    ctx: &Arc<Context>,
    parent: Option<AnnotatedValue>,
) -> Result<Pipeline> {
    let mut parts = Parts {
        stops: Vec::new(),
        handles: Vec::new(),
    };
    let output = spawn_node(plan, ctx, None, &parent, &mut parts, 0)?;
    Ok(Pipeline {
        output: Some(output),
        stopper: super::base::PipelineStopper::new(parts.stops),
        handles: parts.handles,
    })
}

fn spawn_node(
    plan: &Arc<PlanNode>,
    ctx: &Arc<Context>,
    input: Option<ValueInput>,
    parent: &Option<AnnotatedValue>,
    parts: &mut Parts,
    bit: u8,
) -> Result<ValueReceiver> {
    match plan.as_ref() {
        PlanNode::Sequence { children } => {
            let mut upstream = input;
            let mut out = None;
            for child in children {
                let rx = spawn_node(child, ctx, upstream.take(), parent, parts, bit)?;
                upstream = Some(ValueInput::Chan(rx));
            }
            if let Some(ValueInput::Chan(rx)) = upstream.take() {
                out = Some(rx);
            }
            out.ok_or_else(|| Error::plan_internal("empty sequence"))
        }

        PlanNode::Parallel { child } => {
            let input =
                input.ok_or_else(|| Error::plan_internal("parallel operator without input"))?;
            let shared = input.into_shared();
            let replicas = ctx.max_parallelism().max(1).min(u8::MAX as usize);
            let (tx, rx) = mpsc::channel(ctx.pipeline_batch());
            for i in 0..replicas {
                let replica_rx = spawn_node(
                    child,
                    ctx,
                    Some(ValueInput::Shared(shared.clone())),
                    parent,
                    parts,
                    i as u8,
                )?;
                forward(replica_rx, tx.clone(), parts);
            }
            Ok(rx)
        }

        PlanNode::UnionAll { children } => {
            let (tx, rx) = mpsc::channel(ctx.pipeline_batch());
            for child in children {
                let child_rx = spawn_node(child, ctx, None, parent, parts, bit)?;
                forward(child_rx, tx.clone(), parts);
            }
            Ok(rx)
        }

        PlanNode::IntersectScan { scans } => {
            let mut child_outputs = Vec::with_capacity(scans.len());
            for scan in scans {
                child_outputs.push(spawn_node(scan, ctx, None, parent, parts, bit)?);
            }
            spawn_operator(
                IntersectScan::new(child_outputs),
                Some(PhaseId::IndexScan),
                ctx,
                None,
                parent,
                parts,
                bit,
            )
        }

        PlanNode::DistinctScan { scan, limit } => {
            let inner = spawn_node(scan, ctx, None, parent, parts, bit)?;
            spawn_operator(
                DistinctScan::new(limit.clone()),
                Some(PhaseId::Distinct),
                ctx,
                Some(ValueInput::Chan(inner)),
                parent,
                parts,
                bit,
            )
        }

        PlanNode::PrimaryScan { term } => spawn_operator(
            PrimaryScan { term: term.clone() },
            Some(PhaseId::PrimaryScan),
            ctx,
            None,
            parent,
            parts,
            bit,
        ),
        PlanNode::IndexScan(node) => spawn_operator(
            IndexScan { node: node.clone() },
            Some(PhaseId::IndexScan),
            ctx,
            None,
            parent,
            parts,
            bit,
        ),
        PlanNode::KeyScan { keys } => spawn_operator(
            KeyScan { keys: keys.clone() },
            Some(PhaseId::KeyScan),
            ctx,
            None,
            parent,
            parts,
            bit,
        ),
        PlanNode::ValueScan { values } => spawn_operator(
            ValueScan {
                values: values.clone(),
            },
            Some(PhaseId::ValueScan),
            ctx,
            None,
            parent,
            parts,
            bit,
        ),
        PlanNode::DummyScan => {
            spawn_operator(DummyScan, None, ctx, None, parent, parts, bit)
        }
        PlanNode::ParentScan => {
            spawn_operator(ParentScan, None, ctx, None, parent, parts, bit)
        }
        PlanNode::CountScan { term } => spawn_operator(
            CountScan { term: term.clone() },
            Some(PhaseId::CountScan),
            ctx,
            None,
            parent,
            parts,
            bit,
        ),

        PlanNode::Fetch { term } => spawn_operator(
            Fetch::new(term.clone()),
            Some(PhaseId::Fetch),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Join { term, keys, outer } => spawn_operator(
            Join {
                term: term.clone(),
                keys: keys.clone(),
                outer: *outer,
            },
            Some(PhaseId::Join),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Nest { term, keys, outer } => spawn_operator(
            Nest {
                term: term.clone(),
                keys: keys.clone(),
                outer: *outer,
            },
            Some(PhaseId::Join),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Unnest { expr, alias, outer } => spawn_operator(
            Unnest {
                expr: expr.clone(),
                alias: alias.clone(),
                outer: *outer,
            },
            Some(PhaseId::Unnest),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::NLJoin {
            child,
            onclause,
            alias,
            outer,
        } => spawn_operator(
            NestedLoop::new(
                NlKind::Join,
                child.clone(),
                onclause.clone(),
                alias.clone(),
                *outer,
            ),
            Some(PhaseId::NlJoin),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::NLNest {
            child,
            onclause,
            alias,
            outer,
        } => spawn_operator(
            NestedLoop::new(
                NlKind::Nest,
                child.clone(),
                onclause.clone(),
                alias.clone(),
                *outer,
            ),
            Some(PhaseId::NlNest),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),

        PlanNode::Filter { condition } => spawn_operator(
            Filter {
                condition: condition.clone(),
            },
            Some(PhaseId::Filter),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Let { bindings } => spawn_operator(
            Let {
                bindings: bindings.clone(),
            },
            None,
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::InitialProject { projection } => spawn_operator(
            InitialProject {
                projection: projection.clone(),
            },
            Some(PhaseId::Project),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::FinalProject => spawn_operator(
            FinalProject,
            Some(PhaseId::Project),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::InitialGroup { keys, aggregates } => spawn_operator(
            Group::new(GroupStage::Initial, keys.clone(), aggregates.clone()),
            Some(PhaseId::Group),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::IntermediateGroup { keys, aggregates } => spawn_operator(
            Group::new(GroupStage::Intermediate, keys.clone(), aggregates.clone()),
            Some(PhaseId::Group),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::FinalGroup { keys, aggregates } => spawn_operator(
            Group::new(GroupStage::Final, keys.clone(), aggregates.clone()),
            Some(PhaseId::Group),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Distinct => spawn_operator(
            Distinct::new(),
            Some(PhaseId::Distinct),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Order { terms } => spawn_operator(
            Order::new(terms.clone()),
            Some(PhaseId::Order),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Offset { expr } => spawn_operator(
            Offset::new(expr.clone()),
            None,
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Limit { expr } => spawn_operator(
            Limit::new(expr.clone()),
            None,
            ctx,
            input,
            parent,
            parts,
            bit,
        ),

        PlanNode::Stream => spawn_operator(
            Stream,
            Some(PhaseId::Stream),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Discard => {
            spawn_operator(Discard, None, ctx, input, parent, parts, bit)
        }

        PlanNode::Clone => {
            spawn_operator(mutate::Clone_, None, ctx, input, parent, parts, bit)
        }
        PlanNode::Set { alias, terms } => spawn_operator(
            mutate::Set {
                alias: alias.clone(),
                terms: terms.clone(),
            },
            Some(PhaseId::Update),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Unset { alias, terms } => spawn_operator(
            mutate::Unset {
                alias: alias.clone(),
                terms: terms.clone(),
            },
            Some(PhaseId::Update),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::SendInsert {
            term,
            values,
            upsert,
        } => spawn_operator(
            mutate::SendInsert {
                term: term.clone(),
                values: values.clone(),
                upsert: *upsert,
            },
            Some(PhaseId::Insert),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::SendUpdate { term, limit } => spawn_operator(
            mutate::SendUpdate::new(term.clone(), limit.clone()),
            Some(PhaseId::Update),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::SendDelete { term, limit } => spawn_operator(
            mutate::SendDelete::new(term.clone(), limit.clone()),
            Some(PhaseId::Delete),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),
        PlanNode::Merge {
            target,
            key,
            update,
            delete,
            insert,
        } => spawn_operator(
            mutate::Merge {
                target: target.clone(),
                key: key.clone(),
                update: update.clone(),
                delete: delete.clone(),
                insert: insert.clone(),
            },
            Some(PhaseId::Merge),
            ctx,
            input,
            parent,
            parts,
            bit,
        ),

        PlanNode::CreateIndex { node } => spawn_operator(
            ddl::CreateIndex { node: node.clone() },
            None,
            ctx,
            None,
            parent,
            parts,
            bit,
        ),
        PlanNode::DropIndex { node } => spawn_operator(
            ddl::DropIndex { node: node.clone() },
            None,
            ctx,
            None,
            parent,
            parts,
            bit,
        ),
        PlanNode::AlterIndex { node } => spawn_operator(
            ddl::AlterIndex { node: node.clone() },
            None,
            ctx,
            None,
            parent,
            parts,
            bit,
        ),

        PlanNode::Explain { child } => spawn_operator(
            ddl::Explain {
                child: child.clone(),
            },
            None,
            ctx,
            None,
            parent,
            parts,
            bit,
        ),
    }
}

fn spawn_operator<O: Operator>(
    op: O,
    kernel: Option<PhaseId>,
    ctx: &Arc<Context>,
    input: Option<ValueInput>,
    parent: &Option<AnnotatedValue>,
    parts: &mut Parts,
    bit: u8,
) -> Result<ValueReceiver> {
    let (tx, rx) = mpsc::channel(ctx.pipeline_batch());
    let (stop_tx, stop_rx) = watch::channel(false);
    parts.stops.push(stop_tx);

    let io = OperatorIo::new(ctx.clone(), Some(tx), stop_rx, kernel, bit);
    let parent = parent.clone();
    let ctx = ctx.clone();
    let handle = tokio::spawn(async move {
        let task = run_operator(op, io, input, parent);
        if let Err(payload) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
            ctx.recover(payload);
        }
    });
    parts.handles.push(handle);
    Ok(rx)
}

/// Forwards one channel into another; used to merge union and parallel
/// outputs.
fn forward(mut from: ValueReceiver, to: ValueSender, parts: &mut Parts) {
    let handle = tokio::spawn(async move {
        while let Some(item) = from.recv().await {
            if to.send(item).await.is_err() {
                break;
            }
        }
    });
    parts.handles.push(handle);
}
