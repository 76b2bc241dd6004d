//! Document fetch.
//!
//! Turns primary keys (the `meta.id` attachment set by scans) into full
//! documents, batched per datastore round trip. The fetched document is
//! attached under the term's alias; the incoming item's scope parent is
//! preserved so nested-loop inner values keep seeing the outer aliases.

use async_trait::async_trait;

use crate::plan::KeyspaceRef;
use crate::value::AnnotatedValue;

use super::base::{Operator, OperatorIo, Phase};
use super::context::PhaseId;

pub struct Fetch {
    pub term: KeyspaceRef,
    batch: Vec<AnnotatedValue>,
}

impl Fetch {
    pub fn new(term: KeyspaceRef) -> Self {
        Self {
            term,
            batch: Vec::new(),
        }
    }

    async fn flush(&mut self, io: &mut OperatorIo) -> bool {
        if self.batch.is_empty() {
            return true;
        }
        let keyspace = match io.ctx.keyspace(&self.term) {
            Ok(k) => k,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };

        let items = std::mem::take(&mut self.batch);
        let keys: Vec<String> = items.iter().filter_map(|i| i.meta_id()).collect();

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

        io.ctx.add_phase_count(PhaseId::Fetch, docs.len() as u64);

        // unknown keys are dropped; repeated keys pair with the same doc
        let by_key: std::collections::HashMap<String, crate::value::Value> =
            docs.into_iter().map(|d| (d.key, d.value)).collect();
        for mut item in items {
            let Some(key) = item.meta_id() else {
                continue;
            };
            let Some(doc) = by_key.get(&key) else {
                continue;
            };
            item.set_field(&self.term.alias, doc.clone());
            if !io.send_item(item).await {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl Operator for Fetch {
    fn name(&self) -> &'static str {
        "Fetch"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        self.batch.push(item);
        if self.batch.len() >= io.ctx.pipeline_batch() {
            return self.flush(io).await;
        }
        true
    }

    async fn after_items(&mut self, io: &mut OperatorIo) {
        self.flush(io).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{MemoryDatastore, MemoryKeyspace};
    use crate::execution::base::{run_operator, ValueInput};
    use crate::execution::context::{CollectorSink, Context};
    use crate::server::settings::Settings;
    use crate::value::Value;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    fn ctx_with_docs() -> (Arc<Context>, Arc<MemoryKeyspace>) {
        let store = MemoryDatastore::new("t");
        let ns = store.add_namespace("default");
        let ks = ns.add_keyspace("k");
        ks.load(vec![
            ("a", json!({"x": 1})),
            ("b", json!({"x": 2})),
        ]);
        let (sink, _rows) = CollectorSink::new();
        let ctx = Context::new("req", store, Settings::default(), Box::new(sink));
        (ctx, ks)
    }

    fn keyed(key: &str) -> AnnotatedValue {
        let mut av = AnnotatedValue::new(Value::empty_object());
        av.set_meta_id(key);
        av
    }

    #[tokio::test]
    async fn test_fetch_attaches_document_under_alias() {
        let (ctx, _ks) = ctx_with_docs();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let io = OperatorIo::new(ctx, Some(out_tx), stop_rx, None, 0);

        let task = tokio::spawn(run_operator(
            Fetch::new(KeyspaceRef::new("default", "k", "k")),
            io,
            Some(ValueInput::Chan(in_rx)),
            None,
        ));

        in_tx.send(keyed("a")).await.unwrap();
        in_tx.send(keyed("missing-key")).await.unwrap();
        in_tx.send(keyed("b")).await.unwrap();
        drop(in_tx);

        let mut xs = Vec::new();
        while let Some(av) = out_rx.recv().await {
            // primary key attachment survives the fetch
            assert!(av.meta_id().is_some());
            let (doc, _) = av.field("k");
            xs.push(doc.field("x").0);
        }
        assert_eq!(xs, vec![Value::int(1), Value::int(2)]);
        task.await.unwrap();
    }
}
