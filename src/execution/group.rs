//! Grouping and aggregation.
//!
//! Three stages share one accumulator shape so aggregation composes
//! across parallel replicas: InitialGroup folds raw items into partials
//! inside each replica, IntermediateGroup merges partial streams, and
//! FinalGroup finalizes. Each emitted group row is a representative item
//! carrying an `aggregates` attachment keyed by aggregate text.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::aggregates;
use crate::errors::Error;
use crate::expression::{Aggregate, Expr};
use crate::value::{AnnotatedValue, Value};

use super::base::{Operator, OperatorIo};
use super::context::PhaseId;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum GroupStage {
    Initial,
    Intermediate,
    Final,
}

struct GroupEntry {
    representative: AnnotatedValue,
    parts: Vec<Value>,
}

pub struct Group {
    stage: GroupStage,
    keys: Vec<Expr>,
    aggregates: Vec<Aggregate>,
    groups: HashMap<String, GroupEntry>,
}

impl Group {
    pub fn new(stage: GroupStage, keys: Vec<Expr>, aggregates: Vec<Aggregate>) -> Self {
        Self {
            stage,
            keys,
            aggregates,
            groups: HashMap::new(),
        }
    }

    fn group_key(&self, item: &AnnotatedValue, io: &OperatorIo) -> Result<String, Error> {
        let mut parts = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let v = key.evaluate(item, io.ctx.as_ref())?;
            parts.push(v.canonical_string());
        }
        Ok(parts.join("\u{1}"))
    }

    fn defaults(&self) -> Vec<Value> {
        self.aggregates.iter().map(aggregates::default_value).collect()
    }
}

#[async_trait]
impl Operator for Group {
    fn name(&self) -> &'static str {
        match self.stage {
            GroupStage::Initial => "InitialGroup",
            GroupStage::Intermediate => "IntermediateGroup",
            GroupStage::Final => "FinalGroup",
        }
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let key = match self.group_key(&item, io) {
            Ok(k) => k,
            Err(e) => {
                io.ctx.error(Error::evaluation(e, "group key"));
                return true;
            }
        };

        let defaults = self.defaults();
        let entry = self.groups.entry(key).or_insert_with(|| GroupEntry {
            representative: item.clone(),
            parts: defaults,
        });

        for (i, agg) in self.aggregates.iter().enumerate() {
            let acc = std::mem::replace(&mut entry.parts[i], Value::Missing);
            let merged = match self.stage {
                GroupStage::Initial => {
                    aggregates::initial(agg, acc, &item, io.ctx.as_ref())
                }
                GroupStage::Intermediate | GroupStage::Final => {
                    // upstream partials arrive as attachments
                    let part = item
                        .attachment("aggregates")
                        .and_then(|a| a.field_ref(&agg.text()).cloned())
                        .unwrap_or_else(|| aggregates::default_value(agg));
                    aggregates::intermediate(agg, acc, part)
                }
            };
            match merged {
                Ok(v) => entry.parts[i] = v,
                Err(e) => {
                    io.ctx.error(Error::evaluation(e, "aggregate"));
                    return false;
                }
            }
        }
        true
    }

    async fn after_items(&mut self, io: &mut OperatorIo) {
        io.ctx
            .add_phase_count(PhaseId::Group, self.groups.len() as u64);

        // aggregates over an empty input still produce one row when
        // there is no GROUP BY
        if self.groups.is_empty() && self.keys.is_empty() && self.stage == GroupStage::Final {
            self.groups.insert(
                String::new(),
                GroupEntry {
                    representative: AnnotatedValue::new(Value::empty_object()),
                    parts: self.defaults(),
                },
            );
        }

        let groups = std::mem::take(&mut self.groups);
        for (_, entry) in groups {
            let mut attachment = Value::empty_object();
            for (i, agg) in self.aggregates.iter().enumerate() {
                let part = entry.parts[i].clone();
                let out = match self.stage {
                    GroupStage::Final => match aggregates::final_value(agg, part) {
                        Ok(v) => v,
                        Err(e) => {
                            io.ctx.error(Error::evaluation(e, "aggregate"));
                            return;
                        }
                    },
                    _ => part,
                };
                attachment.set_field(&agg.text(), out);
            }
            let mut out = entry.representative;
            out.set_attachment("aggregates", attachment);
            if !io.send_item(out).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::execution::base::{run_operator, OperatorIo, ValueInput};
    use crate::execution::context::{CollectorSink, Context};
    use crate::expression::AggKind;
    use crate::server::settings::Settings;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    fn test_ctx() -> Arc<Context> {
        let store = MemoryDatastore::new("t");
        let (sink, _rows) = CollectorSink::new();
        Context::new("req", store, Settings::default(), Box::new(sink))
    }

    fn item(doc: serde_json::Value) -> AnnotatedValue {
        let mut av = AnnotatedValue::new(Value::empty_object());
        av.set_field("k", Value::from(doc));
        av
    }

    async fn run_stage(
        op: Group,
        items: Vec<AnnotatedValue>,
    ) -> Vec<AnnotatedValue> {
        let ctx = test_ctx();
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let io = OperatorIo::new(ctx, Some(out_tx), stop_rx, None, 0);

        let task = tokio::spawn(run_operator(op, io, Some(ValueInput::Chan(in_rx)), None));
        for i in items {
            in_tx.send(i).await.unwrap();
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
    async fn test_group_by_key_partitions() {
        let sum = Aggregate::new(AggKind::Sum, Expr::path("k", "x"));
        let op = Group::new(
            GroupStage::Final,
            vec![Expr::path("k", "g")],
            vec![sum.clone()],
        );
        // Final over raw items happens when parallelism is 1 and the
        // intermediate stage saw partials; feed partial-shaped items via
        // an Initial stage first for realism.
        let initial = Group::new(
            GroupStage::Initial,
            vec![Expr::path("k", "g")],
            vec![sum.clone()],
        );
        let partials = run_stage(
            initial,
            vec![
                item(json!({"g": "a", "x": 1})),
                item(json!({"g": "b", "x": 10})),
                item(json!({"g": "a", "x": 2})),
            ],
        )
        .await;
        assert_eq!(partials.len(), 2);

        let finals = run_stage(op, partials).await;
        let mut sums: Vec<i64> = finals
            .iter()
            .map(|av| {
                av.attachment("aggregates")
                    .unwrap()
                    .field_ref(&sum.text())
                    .unwrap()
                    .as_i64()
                    .unwrap()
            })
            .collect();
        sums.sort();
        assert_eq!(sums, vec![3, 10]);
    }

    #[tokio::test]
    async fn test_empty_input_without_keys_emits_defaults() {
        let count = Aggregate::count_star();
        let op = Group::new(GroupStage::Final, vec![], vec![count.clone()]);
        let out = run_stage(op, vec![]).await;
        assert_eq!(out.len(), 1);
        let v = out[0]
            .attachment("aggregates")
            .unwrap()
            .field_ref(&count.text())
            .cloned()
            .unwrap();
        assert_eq!(v, Value::int(0));
    }

    #[tokio::test]
    async fn test_empty_input_with_keys_emits_nothing() {
        let count = Aggregate::count_star();
        let op = Group::new(GroupStage::Final, vec![Expr::path("k", "g")], vec![count]);
        let out = run_stage(op, vec![]).await;
        assert!(out.is_empty());
    }
}
