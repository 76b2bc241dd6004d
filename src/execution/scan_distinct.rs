//! Primary-key deduplication over an inner scan.
//!
//! Wraps a scan whose entries may repeat primary keys (multi-valued
//! index keys, union spans) and emits each key at most once. An optional
//! limit truncates the stream; late arrivals after a stop are discarded
//! by the driver.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::errors::Error;
use crate::expression::Expr;
use crate::value::AnnotatedValue;

use super::base::{Operator, OperatorIo};
use super::context::PhaseId;

pub struct DistinctScan {
    pub limit: Option<Expr>,
    keys: HashSet<String>,
    max: Option<usize>,
}

impl DistinctScan {
    pub fn new(limit: Option<Expr>) -> Self {
        Self {
            limit,
            keys: HashSet::new(),
            max: None,
        }
    }
}

#[async_trait]
impl Operator for DistinctScan {
    fn name(&self) -> &'static str {
        "DistinctScan"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        if let Some(limit) = &self.limit {
            let item = AnnotatedValue::missing();
            if let Ok(v) = limit.evaluate(&item, io.ctx.as_ref()) {
                if let Some(n) = v.as_i64() {
                    if n >= 0 {
                        self.max = Some(n as usize);
                    }
                }
            }
        }
        true
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let Some(key) = item.meta_id() else {
            io.ctx.error(Error::execution(
                "distinct scan received an item without a primary key",
            ));
            return false;
        };

        if self.keys.contains(&key) {
            return true;
        }
        if let Some(max) = self.max {
            if self.keys.len() >= max {
                return false;
            }
        }
        self.keys.insert(key);
        io.ctx.add_phase_count(PhaseId::Distinct, 1);
        io.send_item(item).await
    }
}
