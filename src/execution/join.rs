//! Lookup join, nest and unnest.
//!
//! Lookup joins pair each left item with right documents fetched by the
//! evaluated ON KEYS expression. Nest gathers the matches into one
//! array-valued field. Unnest flattens an array-valued expression into
//! one output per element.

use async_trait::async_trait;

use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::KeyspaceRef;
use crate::value::{AnnotatedValue, Value};

use super::base::{Operator, OperatorIo, Phase};
use super::context::PhaseId;

fn eval_keys(
    keys: &Expr,
    item: &AnnotatedValue,
    io: &mut OperatorIo,
) -> Option<Vec<String>> {
    match keys.evaluate(item, io.ctx.as_ref()) {
        Ok(Value::String(s)) => Some(vec![s]),
        Ok(Value::Array(a)) => Some(
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
        ),
        Ok(_) => Some(Vec::new()),
        Err(e) => {
            io.ctx.error(Error::evaluation(e, "on keys"));
            None
        }
    }
}

/// Lookup JOIN: one output per fetched right document.
pub struct Join {
    pub term: KeyspaceRef,
    pub keys: Expr,
    pub outer: bool,
}

#[async_trait]
impl Operator for Join {
    fn name(&self) -> &'static str {
        "Join"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let Some(keys) = eval_keys(&self.keys, &item, io) else {
            // evaluation failure drops the item, the stream continues
            return true;
        };

        let keyspace = match io.ctx.keyspace(&self.term) {
            Ok(k) => k,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };

        io.timer.switch(Phase::Serv);
        let fetched = keyspace.fetch(&keys).await;
        io.timer.switch(Phase::Exec);

        let docs = match fetched {
            Ok(docs) => docs,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };
        io.ctx.add_phase_count(PhaseId::Join, docs.len() as u64);

        if docs.is_empty() {
            if self.outer {
                return io.send_item(item).await;
            }
            return true;
        }

        for doc in docs {
            let mut out = item.clone();
            out.set_field(&self.term.alias, doc.value);
            if !io.send_item(out).await {
                return false;
            }
        }
        true
    }
}

/// Lookup NEST: matches are gathered into a single array field.
pub struct Nest {
    pub term: KeyspaceRef,
    pub keys: Expr,
    pub outer: bool,
}

#[async_trait]
impl Operator for Nest {
    fn name(&self) -> &'static str {
        "Nest"
    }

    async fn process_item(&mut self, mut item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let Some(keys) = eval_keys(&self.keys, &item, io) else {
            return true;
        };

        let keyspace = match io.ctx.keyspace(&self.term) {
            Ok(k) => k,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };

        io.timer.switch(Phase::Serv);
        let fetched = keyspace.fetch(&keys).await;
        io.timer.switch(Phase::Exec);

        let docs = match fetched {
            Ok(docs) => docs,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };

        if docs.is_empty() {
            if self.outer {
                item.set_field(&self.term.alias, Value::empty_array());
                return io.send_item(item).await;
            }
            return true;
        }

        let vals: Vec<Value> = docs.into_iter().map(|d| d.value).collect();
        item.set_field(&self.term.alias, Value::Array(vals));
        io.send_item(item).await
    }
}

/// UNNEST: one output per element of the evaluated array.
pub struct Unnest {
    pub expr: Expr,
    pub alias: String,
    pub outer: bool,
}

#[async_trait]
impl Operator for Unnest {
    fn name(&self) -> &'static str {
        "Unnest"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let source = match self.expr.evaluate(&item, io.ctx.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                io.ctx.error(Error::evaluation(e, "unnest"));
                return true;
            }
        };

        let elems = match source.as_array() {
            Some(a) if !a.is_empty() => a.to_vec(),
            _ => {
                if self.outer {
                    return io.send_item(item).await;
                }
                return true;
            }
        };

        io.ctx.add_phase_count(PhaseId::Unnest, elems.len() as u64);
        for elem in elems {
            let mut out = item.clone();
            out.set_field(&self.alias, elem);
            if !io.send_item(out).await {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::execution::base::{run_operator, ValueInput};
    use crate::execution::context::{CollectorSink, Context};
    use crate::server::settings::Settings;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    fn ctx_with_right() -> Arc<Context> {
        let store = MemoryDatastore::new("t");
        let ns = store.add_namespace("default");
        let right = ns.add_keyspace("r");
        right.load(vec![
            ("r1", json!({"y": 10})),
            ("r2", json!({"y": 20})),
        ]);
        let (sink, _rows) = CollectorSink::new();
        Context::new("req", store, Settings::default(), Box::new(sink))
    }

    fn left_item(doc: serde_json::Value) -> AnnotatedValue {
        let mut av = AnnotatedValue::new(Value::empty_object());
        av.set_field("l", Value::from(doc));
        av.set_meta_id("l1");
        av
    }

    async fn run_join(op: impl Operator, items: Vec<AnnotatedValue>, ctx: Arc<Context>) -> Vec<AnnotatedValue> {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let io = OperatorIo::new(ctx, Some(out_tx), stop_rx, None, 0);

        let task = tokio::spawn(run_operator(op, io, Some(ValueInput::Chan(in_rx)), None));
        for item in items {
            in_tx.send(item).await.unwrap();
        }
        drop(in_tx);

        let mut out = Vec::new();
        while let Some(av) = out_rx.recv().await {
            out.push(av);
        }
        task.await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_lookup_join_pairs_by_keys() {
        let ctx = ctx_with_right();
        let op = Join {
            term: KeyspaceRef::new("default", "r", "r"),
            keys: Expr::path("l", "rkeys"),
            outer: false,
        };
        let out = run_join(
            op,
            vec![left_item(json!({"rkeys": ["r1", "r2"]}))],
            ctx,
        )
        .await;
        assert_eq!(out.len(), 2);
        let ys: Vec<Value> = out.iter().map(|av| av.field("r").0.field("y").0).collect();
        assert_eq!(ys, vec![Value::int(10), Value::int(20)]);
    }

    #[tokio::test]
    async fn test_inner_join_drops_unmatched() {
        let ctx = ctx_with_right();
        let op = Join {
            term: KeyspaceRef::new("default", "r", "r"),
            keys: Expr::path("l", "rkeys"),
            outer: false,
        };
        let out = run_join(op, vec![left_item(json!({"rkeys": []}))], ctx).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_outer_nest_pads_empty_array() {
        let ctx = ctx_with_right();
        let op = Nest {
            term: KeyspaceRef::new("default", "r", "r"),
            keys: Expr::path("l", "rkeys"),
            outer: true,
        };
        let out = run_join(op, vec![left_item(json!({"rkeys": []}))], ctx).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field("r").0, Value::empty_array());
    }

    #[tokio::test]
    async fn test_unnest_flattens_elements() {
        let ctx = ctx_with_right();
        let op = Unnest {
            expr: Expr::path("l", "tags"),
            alias: "tag".to_string(),
            outer: false,
        };
        let out = run_join(
            op,
            vec![left_item(json!({"tags": ["x", "y"]}))],
            ctx,
        )
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].field("tag").0, Value::string("x"));
        assert_eq!(out[1].field("tag").0, Value::string("y"));
    }
}
