//! Blocking operators: Order, Offset, Limit, Distinct.

use async_trait::async_trait;

use crate::algebra::OrderTerm;
use crate::errors::Error;
use crate::expression::Expr;
use crate::value::{AnnotatedValue, Value};

use super::base::{Operator, OperatorIo};
use super::context::PhaseId;

/// Full sort by collation. Buffers everything, so it runs outside the
/// parallel stage and restores a total order behind it.
pub struct Order {
    pub terms: Vec<OrderTerm>,
    buffer: Vec<(Vec<Value>, AnnotatedValue)>,
}

impl Order {
    pub fn new(terms: Vec<OrderTerm>) -> Self {
        Self {
            terms,
            buffer: Vec::new(),
        }
    }
}

#[async_trait]
impl Operator for Order {
    fn name(&self) -> &'static str {
        "Order"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let mut keys = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            match term.expr.evaluate(&item, io.ctx.as_ref()) {
                Ok(v) => keys.push(v),
                Err(e) => {
                    io.ctx.error(Error::evaluation(e, "order"));
                    return true;
                }
            }
        }
        self.buffer.push((keys, item));
        true
    }

    async fn after_items(&mut self, io: &mut OperatorIo) {
        let descending: Vec<bool> = self.terms.iter().map(|t| t.descending).collect();
        self.buffer.sort_by(|(a, _), (b, _)| {
            for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                let mut ord = x.collate(y);
                if descending.get(i).copied().unwrap_or(false) {
                    ord = ord.reverse();
                }
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });

        io.ctx.add_sort_count(self.buffer.len() as u64);
        io.ctx
            .add_phase_count(PhaseId::Order, self.buffer.len() as u64);
        for (_, item) in self.buffer.drain(..) {
            if !io.send_item(item).await {
                return;
            }
        }
    }
}

/// Skips the first N items.
pub struct Offset {
    pub expr: Expr,
    remaining: i64,
}

impl Offset {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr,
            remaining: 0,
        }
    }
}

#[async_trait]
impl Operator for Offset {
    fn name(&self) -> &'static str {
        "Offset"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        let item = AnnotatedValue::missing();
        match self.expr.evaluate(&item, io.ctx.as_ref()) {
            Ok(v) => {
                self.remaining = v.as_i64().unwrap_or(0).max(0);
                true
            }
            Err(e) => {
                io.ctx.error(Error::evaluation(e, "offset"));
                false
            }
        }
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            return true;
        }
        io.send_item(item).await
    }
}

/// Ends the stream after N items; ending early cascades a stop upstream
/// through channel closure.
pub struct Limit {
    pub expr: Expr,
    remaining: i64,
}

impl Limit {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr,
            remaining: 0,
        }
    }
}

#[async_trait]
impl Operator for Limit {
    fn name(&self) -> &'static str {
        "Limit"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        let item = AnnotatedValue::missing();
        match self.expr.evaluate(&item, io.ctx.as_ref()) {
            Ok(v) => {
                self.remaining = v.as_i64().unwrap_or(0).max(0);
                self.remaining > 0
            }
            Err(e) => {
                io.ctx.error(Error::evaluation(e, "limit"));
                false
            }
        }
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        if self.remaining <= 0 {
            return false;
        }
        self.remaining -= 1;
        if !io.send_item(item).await {
            return false;
        }
        self.remaining > 0
    }
}

/// Row-level DISTINCT on the projected value.
pub struct Distinct {
    seen: std::collections::HashSet<String>,
}

impl Distinct {
    pub fn new() -> Self {
        Self {
            seen: std::collections::HashSet::new(),
        }
    }
}

impl Default for Distinct {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for Distinct {
    fn name(&self) -> &'static str {
        "Distinct"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let fingerprint = item.value().canonical_string();
        if !self.seen.insert(fingerprint) {
            return true;
        }
        io.ctx.add_phase_count(PhaseId::Distinct, 1);
        io.send_item(item).await
    }
}
