//! Secondary index scan.
//!
//! Spawns a producer task that evaluates the plan's span expressions
//! (against the nested-loop outer item when under one), drives the
//! index's streaming scan, and forwards entries as annotated values. A
//! covering scan writes each projected entry key into the value's cover
//! map instead of relying on a later fetch.

use std::sync::Arc;

use async_trait::async_trait;

use crate::datastore::{IndexConnection, Range2, Span2};
use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::{IndexScanNode, SpanExpr};
use crate::value::{AnnotatedValue, Value, ValueKind};

use super::base::{stop_wait, Operator, OperatorIo, Phase, PHASE_UPDATE_COUNT};
use super::context::{Context, PhaseId};

pub struct IndexScan {
    pub node: IndexScanNode,
}

/// Evaluates span expressions to concrete values. The bool result flags
/// an empty span (a bound evaluated to MISSING): the scan can skip the
/// index entirely.
fn eval_spans(
    spans: &[SpanExpr],
    item: &AnnotatedValue,
    ctx: &Context,
) -> crate::errors::Result<(Vec<Span2>, bool)> {
    let mut out = Vec::with_capacity(spans.len());
    for span in spans {
        let mut ranges = Vec::with_capacity(span.ranges.len());
        let mut empty = false;
        for range in &span.ranges {
            let low = match &range.low {
                Some(e) => {
                    let v = e.evaluate(item, ctx)?;
                    if v.kind() == ValueKind::Missing {
                        empty = true;
                        break;
                    }
                    Some(v)
                }
                None => None,
            };
            let high = match &range.high {
                Some(e) => {
                    let v = e.evaluate(item, ctx)?;
                    if v.kind() == ValueKind::Missing {
                        empty = true;
                        break;
                    }
                    Some(v)
                }
                None => None,
            };
            ranges.push(Range2 {
                low,
                high,
                inclusion: range.inclusion,
            });
        }
        if !empty && !ranges.is_empty() {
            out.push(Span2 { seek: None, ranges });
        }
    }
    let empty = out.is_empty();
    Ok((out, empty))
}

fn eval_limit(expr: &Option<Expr>, ctx: &Context, fallback: i64) -> i64 {
    let Some(expr) = expr else {
        return fallback;
    };
    let item = AnnotatedValue::missing();
    match expr.evaluate(&item, ctx) {
        Ok(v) => v.as_i64().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

#[async_trait]
impl Operator for IndexScan {
    fn name(&self) -> &'static str {
        "IndexScan"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        parent: Option<&AnnotatedValue>,
    ) -> bool {
        let keyspace = match io.ctx.keyspace(&self.node.term) {
            Ok(k) => k,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };
        let index = match keyspace
            .indexer()
            .and_then(|ix| ix.index_by_name(&self.node.index_name))
        {
            Ok(ix) => ix,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };

        // Only the inner side of a nested loop sees the outer item for
        // span evaluation and scope layering.
        let outer = if self.node.under_nl { parent } else { None };
        let span_item = match outer {
            Some(p) => p.clone(),
            None => AnnotatedValue::missing(),
        };
        let (spans, empty) = match eval_spans(&self.node.spans, &span_item, &io.ctx) {
            Ok(r) => r,
            Err(e) => {
                io.ctx.error(Error::evaluation(e, "span"));
                return false;
            }
        };
        if empty {
            return false;
        }

        let offset = eval_limit(&self.node.offset, &io.ctx, 0);
        let limit = eval_limit(&self.node.limit, &io.ctx, -1);

        let (conn, mut entries, conn_stop) = IndexConnection::new(io.ctx.scan_cap());
        let request_id = io.ctx.request_id().to_string();
        let consistency = io.ctx.scan_consistency();
        let reverse = self.node.reverse;
        let distinct = self.node.distinct;
        let ordered = self.node.ordered;
        let projection = self.node.projection.clone();
        let ctx = io.ctx.clone();
        let producer = tokio::spawn(async move {
            if let Err(e) = index
                .scan2(
                    &request_id,
                    &spans,
                    reverse,
                    distinct,
                    ordered,
                    projection.as_ref(),
                    offset,
                    limit,
                    consistency,
                    conn,
                )
                .await
            {
                ctx.error(e);
            }
        });

        let parent_arc = outer.map(|p| Arc::new(p.clone()));
        let covers = &self.node.covers;
        let entry_keys = self
            .node
            .projection
            .as_ref()
            .map(|p| p.entry_keys.clone())
            .unwrap_or_default();
        let want_primary = self
            .node
            .projection
            .as_ref()
            .map_or(true, |p| p.primary_key);

        let mut stop = io.stop_handle();
        let mut docs: u64 = 0;
        loop {
            io.timer.switch(Phase::Serv);
            let entry = tokio::select! {
                biased;
                _ = stop_wait(&mut stop) => None,
                e = entries.recv() => e,
            };
            io.timer.switch(Phase::Exec);
            let Some(entry) = entry else {
                break;
            };

            let mut av = match &parent_arc {
                Some(p) => AnnotatedValue::scope(p.clone()),
                None => AnnotatedValue::new(Value::empty_object()),
            };
            av.set_meta_id(&entry.primary_key);

            if !covers.is_empty() {
                for (expr, value) in &self.node.filter_covers {
                    av.set_cover(&expr.to_string(), value.clone());
                }
                // entry positions map through the index projection
                for (i, key_value) in entry.entry_key.iter().enumerate() {
                    let j = entry_keys.get(i).copied().unwrap_or(i);
                    if let Some(cover) = covers.get(j) {
                        av.set_cover(&cover.to_string(), key_value.clone());
                    }
                }
                if want_primary {
                    if let Some(cover) = covers.last() {
                        av.set_cover(&cover.to_string(), Value::string(&entry.primary_key));
                    }
                }
            }

            if !io.send_item(av).await {
                break;
            }
            docs += 1;
            if docs >= PHASE_UPDATE_COUNT {
                io.ctx.add_phase_count(PhaseId::IndexScan, docs);
                docs = 0;
            }
        }
        if docs > 0 {
            io.ctx.add_phase_count(PhaseId::IndexScan, docs);
        }

        // cancellation order: the index sees the stop before the entry
        // channel disappears
        let _ = conn_stop.send(true);
        drop(entries);
        let _ = producer.await;
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Inclusion;
    use crate::execution::context::CollectorSink;
    use crate::plan::RangeExpr;
    use crate::server::settings::Settings;
    use crate::datastore::MemoryDatastore;

    fn test_ctx() -> Arc<Context> {
        let store = MemoryDatastore::new("t");
        let (sink, _rows) = CollectorSink::new();
        Context::new("req", store, Settings::default(), Box::new(sink))
    }

    #[test]
    fn test_missing_span_bound_empties_scan() {
        let ctx = test_ctx();
        let spans = vec![SpanExpr {
            seek: None,
            ranges: vec![RangeExpr {
                low: Some(Expr::ident("no_such_field")),
                high: None,
                inclusion: Inclusion::Both,
            }],
        }];
        let item = AnnotatedValue::missing();
        let (out, empty) = eval_spans(&spans, &item, &ctx).unwrap();
        assert!(empty);
        assert!(out.is_empty());
    }

    #[test]
    fn test_constant_span_bounds_evaluate() {
        let ctx = test_ctx();
        let spans = vec![SpanExpr {
            seek: None,
            ranges: vec![RangeExpr {
                low: Some(Expr::constant(1)),
                high: Some(Expr::constant(5)),
                inclusion: Inclusion::Low,
            }],
        }];
        let item = AnnotatedValue::missing();
        let (out, empty) = eval_spans(&spans, &item, &ctx).unwrap();
        assert!(!empty);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ranges[0].low, Some(Value::int(1)));
        assert_eq!(out[0].ranges[0].inclusion, Inclusion::Low);
    }
}
