//! Filter and Let.

use std::sync::Arc;

use async_trait::async_trait;

use crate::algebra::LetBinding;
use crate::errors::Error;
use crate::expression::Expr;
use crate::value::AnnotatedValue;

use super::base::{Operator, OperatorIo};
use super::context::PhaseId;

/// Drops items whose condition is not TRUE. NULL and MISSING conditions
/// drop the item like FALSE does.
pub struct Filter {
    pub condition: Expr,
}

#[async_trait]
impl Operator for Filter {
    fn name(&self) -> &'static str {
        "Filter"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        match self.condition.evaluate(&item, io.ctx.as_ref()) {
            Ok(v) => {
                if v.truth() {
                    io.ctx.add_phase_count(PhaseId::Filter, 1);
                    io.send_item(item).await
                } else {
                    true
                }
            }
            Err(e) => {
                // the offending item is dropped, the stream continues
                io.ctx.error(Error::evaluation(e, "filter"));
                true
            }
        }
    }
}

/// Introduces LET variables as a fresh scope layer over each item.
pub struct Let {
    pub bindings: Vec<LetBinding>,
}

#[async_trait]
impl Operator for Let {
    fn name(&self) -> &'static str {
        "Let"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let mut scoped = AnnotatedValue::scope(Arc::new(item));
        for binding in &self.bindings {
            match binding.expr.evaluate(&scoped, io.ctx.as_ref()) {
                Ok(v) => scoped.set_field(&binding.variable, v),
                Err(e) => {
                    io.ctx.error(Error::evaluation(e, "let"));
                    return true;
                }
            }
        }
        io.send_item(scoped).await
    }
}
