//! Nested-loop ANSI join and nest.
//!
//! For each outer item the inner subplan is reopened (the previous run
//! stopped, a fresh one spawned) and drained; the ON clause is evaluated
//! on inner values whose scope parent is the outer item. Constant ON
//! clauses short-circuit: TRUE skips evaluation, FALSE skips the inner
//! child entirely and pads OUTER rows.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::PlanNode;
use crate::value::{AnnotatedValue, Value};

use super::base::{stop_wait, Operator, OperatorIo, Phase, Pipeline};
use super::build::spawn_plan;
use super::context::PhaseId;

const ONCLAUSE_TRUE: u32 = 1 << 0;
const ONCLAUSE_FALSE: u32 = 1 << 1;
const REOPEN_CHILD: u32 = 1 << 2;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum NlKind {
    Join,
    Nest,
}

pub struct NestedLoop {
    pub kind: NlKind,
    pub child: Arc<PlanNode>,
    pub onclause: Expr,
    pub alias: String,
    pub outer: bool,
    flags: u32,
    previous: Option<Pipeline>,
}

impl NestedLoop {
    pub fn new(
        kind: NlKind,
        child: Arc<PlanNode>,
        onclause: Expr,
        alias: String,
        outer: bool,
    ) -> Self {
        Self {
            kind,
            child,
            onclause,
            alias,
            outer,
            flags: 0,
            previous: None,
        }
    }

    fn phase(&self) -> PhaseId {
        match self.kind {
            NlKind::Join => PhaseId::NlJoin,
            NlKind::Nest => PhaseId::NlNest,
        }
    }

    /// Emits the no-match shape: OUTER join passes the outer item
    /// through, OUTER nest pads an empty array, inner variants drop.
    async fn send_unmatched(
        &self,
        mut item: AnnotatedValue,
        io: &mut OperatorIo,
    ) -> bool {
        if !self.outer {
            return true;
        }
        if self.kind == NlKind::Nest {
            item.set_field(&self.alias, Value::empty_array());
        }
        io.send_item(item).await
    }
}

#[async_trait]
impl Operator for NestedLoop {
    fn name(&self) -> &'static str {
        match self.kind {
            NlKind::Join => "NestedLoopJoin",
            NlKind::Nest => "NestedLoopNest",
        }
    }

    async fn before_items(
        &mut self,
        _io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        if let Some(v) = self.onclause.constant_value() {
            if v.truth() {
                self.flags |= ONCLAUSE_TRUE;
            } else {
                self.flags |= ONCLAUSE_FALSE;
            }
        }
        true
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        if self.flags & ONCLAUSE_FALSE != 0 {
            return self.send_unmatched(item, io).await;
        }

        // reopen: stop the previous inner run before starting a new one
        if self.flags & REOPEN_CHILD != 0 {
            if let Some(mut previous) = self.previous.take() {
                previous.send_stop();
                previous.join().await;
            }
        } else {
            self.flags |= REOPEN_CHILD;
        }

        let mut child = match spawn_plan(&self.child, &io.ctx, Some(item.clone())) {
            Ok(p) => p,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };
        let mut output = child
            .take_output()
            .expect("inner pipeline always has an output");

        let mut stop = io.stop_handle();
        let mut right_items: Vec<AnnotatedValue> = Vec::new();
        let mut stopped = false;
        loop {
            io.timer.switch(Phase::Chan);
            let next = tokio::select! {
                biased;
                _ = stop_wait(&mut stop) => {
                    stopped = true;
                    None
                }
                right = output.recv() => right,
            };
            io.timer.switch(Phase::Exec);
            let Some(right_item) = next else {
                break;
            };

            let matched = if self.flags & ONCLAUSE_TRUE != 0 {
                true
            } else {
                match self.onclause.evaluate(&right_item, io.ctx.as_ref()) {
                    Ok(v) => v.truth(),
                    Err(e) => {
                        io.ctx.error(Error::evaluation(e, "onclause"));
                        false
                    }
                }
            };
            if matched {
                right_items.push(right_item);
            }
        }

        if stopped {
            child.send_stop();
            child.join().await;
            return false;
        }
        child.join().await;
        self.previous = Some(child);

        io.ctx
            .add_phase_count(self.phase(), right_items.len() as u64);

        if right_items.is_empty() {
            return self.send_unmatched(item, io).await;
        }

        match self.kind {
            NlKind::Join => {
                for right_item in right_items {
                    let mut out = item.clone();
                    let (right_val, present) = right_item.field(&self.alias);
                    if !present {
                        io.ctx.error(Error::execution_internal(format!(
                            "nested loop join: no value for alias {}",
                            self.alias
                        )));
                        return false;
                    }
                    out.set_field(&self.alias, right_val);
                    if !io.send_item(out).await {
                        return false;
                    }
                }
            }
            NlKind::Nest => {
                let mut vals = Vec::with_capacity(right_items.len());
                for right_item in right_items {
                    let (right_val, present) = right_item.field(&self.alias);
                    if !present {
                        io.ctx.error(Error::execution_internal(format!(
                            "nested loop nest: no value for alias {}",
                            self.alias
                        )));
                        return false;
                    }
                    vals.push(right_val);
                }
                let mut out = item.clone();
                out.set_field(&self.alias, Value::Array(vals));
                if !io.send_item(out).await {
                    return false;
                }
            }
        }
        true
    }

    async fn after_items(&mut self, _io: &mut OperatorIo) {
        if let Some(mut previous) = self.previous.take() {
            previous.send_stop();
            previous.join().await;
        }
    }
}
