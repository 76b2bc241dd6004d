//! Simple scans: primary, key, value, dummy, parent, count.
//!
//! Scans are producers: all their work happens in `before_items`, pushing
//! annotated values downstream with the primary key attached as
//! `meta.id`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::datastore::{IndexConnection, Span2};
use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::KeyspaceRef;
use crate::value::{AnnotatedValue, Value, ValueKind};

use super::base::{stop_wait, Operator, OperatorIo, Phase, PHASE_UPDATE_COUNT};
use super::context::PhaseId;

/// Full keyspace scan through the primary index.
pub struct PrimaryScan {
    pub term: KeyspaceRef,
}

#[async_trait]
impl Operator for PrimaryScan {
    fn name(&self) -> &'static str {
        "PrimaryScan"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        parent: Option<&AnnotatedValue>,
    ) -> bool {
        let keyspace = match io.ctx.keyspace(&self.term) {
            Ok(k) => k,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };
        let index = match keyspace.indexer().and_then(|ix| ix.primary_index()) {
            Ok(ix) => ix,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };

        let (conn, mut entries, conn_stop) = IndexConnection::new(io.ctx.scan_cap());
        let request_id = io.ctx.request_id().to_string();
        let consistency = io.ctx.scan_consistency();
        let ctx = io.ctx.clone();
        let producer = tokio::spawn(async move {
            let spans = [Span2::whole()];
            if let Err(e) = index
                .scan2(&request_id, &spans, false, false, true, None, 0, -1, consistency, conn)
                .await
            {
                ctx.error(e);
            }
        });

        let parent_arc = parent.map(|p| Arc::new(p.clone()));
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
            if !io.send_item(av).await {
                break;
            }
            docs += 1;
            if docs >= PHASE_UPDATE_COUNT {
                io.ctx.add_phase_count(PhaseId::PrimaryScan, docs);
                docs = 0;
            }
        }
        if docs > 0 {
            io.ctx.add_phase_count(PhaseId::PrimaryScan, docs);
        }
        // stop the index before abandoning the entry channel
        let _ = conn_stop.send(true);
        drop(entries);
        let _ = producer.await;
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

/// KEYS-clause scan: emits one item per evaluated key.
pub struct KeyScan {
    pub keys: Expr,
}

#[async_trait]
impl Operator for KeyScan {
    fn name(&self) -> &'static str {
        "KeyScan"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        parent: Option<&AnnotatedValue>,
    ) -> bool {
        let item = match parent {
            Some(p) => p.clone(),
            None => AnnotatedValue::missing(),
        };
        let keys = match self.keys.evaluate(&item, io.ctx.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                io.ctx.error(Error::evaluation(e, "keys"));
                return false;
            }
        };

        let list: Vec<String> = match &keys {
            Value::String(s) => vec![s.clone()],
            Value::Array(a) => a
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => Vec::new(),
        };

        let parent_arc = parent.map(|p| Arc::new(p.clone()));
        let mut docs: u64 = 0;
        for key in list {
            let mut av = match &parent_arc {
                Some(p) => AnnotatedValue::scope(p.clone()),
                None => AnnotatedValue::new(Value::empty_object()),
            };
            av.set_meta_id(&key);
            if !io.send_item(av).await {
                break;
            }
            docs += 1;
        }
        io.ctx.add_phase_count(PhaseId::KeyScan, docs);
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

/// VALUES scan: emits each element of an evaluated array.
pub struct ValueScan {
    pub values: Expr,
}

#[async_trait]
impl Operator for ValueScan {
    fn name(&self) -> &'static str {
        "ValueScan"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        parent: Option<&AnnotatedValue>,
    ) -> bool {
        let item = match parent {
            Some(p) => p.clone(),
            None => AnnotatedValue::missing(),
        };
        let values = match self.values.evaluate(&item, io.ctx.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                io.ctx.error(Error::evaluation(e, "values"));
                return false;
            }
        };
        let list = match values {
            Value::Array(a) => a,
            v if v.kind() != ValueKind::Missing => vec![v],
            _ => Vec::new(),
        };
        let mut docs: u64 = 0;
        for v in list {
            if !io.send_item(AnnotatedValue::new(v)).await {
                break;
            }
            docs += 1;
        }
        io.ctx.add_phase_count(PhaseId::ValueScan, docs);
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

/// FROM-less SELECT: emits a single empty item.
pub struct DummyScan;

#[async_trait]
impl Operator for DummyScan {
    fn name(&self) -> &'static str {
        "DummyScan"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        parent: Option<&AnnotatedValue>,
    ) -> bool {
        let av = match parent {
            Some(p) => AnnotatedValue::scope(Arc::new(p.clone())),
            None => AnnotatedValue::new(Value::empty_object()),
        };
        io.send_item(av).await;
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

/// Correlated-subquery scan: emits the parent item itself.
pub struct ParentScan;

#[async_trait]
impl Operator for ParentScan {
    fn name(&self) -> &'static str {
        "ParentScan"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        parent: Option<&AnnotatedValue>,
    ) -> bool {
        if let Some(p) = parent {
            io.send_item(AnnotatedValue::scope(Arc::new(p.clone()))).await;
        }
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

/// COUNT(*) fast path: one row carrying the precomputed aggregate.
pub struct CountScan {
    pub term: KeyspaceRef,
}

#[async_trait]
impl Operator for CountScan {
    fn name(&self) -> &'static str {
        "CountScan"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        let keyspace = match io.ctx.keyspace(&self.term) {
            Ok(k) => k,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };
        io.timer.switch(Phase::Serv);
        let count = keyspace.count().await;
        io.timer.switch(Phase::Exec);
        match count {
            Ok(n) => {
                let (text, value) = crate::aggregates::count_star_of(n);
                let mut aggregates = Value::empty_object();
                aggregates.set_field(&text, value);
                let mut av = AnnotatedValue::new(Value::empty_object());
                av.set_attachment("aggregates", aggregates);
                io.send_item(av).await;
                io.ctx.add_phase_count(PhaseId::CountScan, 1);
            }
            Err(e) => io.ctx.error(e),
        }
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}
