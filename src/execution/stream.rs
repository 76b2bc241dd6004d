//! Terminal operators.

use async_trait::async_trait;

use crate::value::AnnotatedValue;

use super::base::{Operator, OperatorIo, Phase};
use super::context::PhaseId;

/// Forwards rows to the request's result sink and closes it when the
/// stream ends. The sink sees a single writer.
pub struct Stream;

#[async_trait]
impl Operator for Stream {
    fn name(&self) -> &'static str {
        "Stream"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        io.timer.switch(Phase::Chan);
        let ok = io.ctx.result(&item);
        io.timer.switch(Phase::Exec);
        if ok {
            io.ctx.add_phase_count(PhaseId::Stream, 1);
        }
        ok
    }

    async fn after_items(&mut self, io: &mut OperatorIo) {
        io.ctx.close_results();
    }
}

/// Swallows rows; mutations report through counters, not results.
pub struct Discard;

#[async_trait]
impl Operator for Discard {
    fn name(&self) -> &'static str {
        "Discard"
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        true
    }

    async fn after_items(&mut self, io: &mut OperatorIo) {
        io.ctx.close_results();
    }
}
