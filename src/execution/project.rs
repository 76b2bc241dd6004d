//! Projection.
//!
//! InitialProject evaluates the projection terms into a fresh object
//! scoped over the source item, so ORDER BY can still reach unprojected
//! fields. FinalProject strips the scope and emits the bare object. A
//! row whose every projected term is MISSING is suppressed.

use std::sync::Arc;

use async_trait::async_trait;

use crate::algebra::Projection;
use crate::errors::Error;
use crate::value::{AnnotatedValue, Value, ValueKind};

use super::base::{Operator, OperatorIo};
use super::context::PhaseId;

pub struct InitialProject {
    pub projection: Arc<Projection>,
}

#[async_trait]
impl Operator for InitialProject {
    fn name(&self) -> &'static str {
        "InitialProject"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let mut out = Value::empty_object();
        let mut any_present = false;
        let mut any_star = false;

        for (i, term) in self.projection.terms.iter().enumerate() {
            if term.star {
                any_star = true;
                if let Value::Object(fields) = item.value() {
                    for (k, v) in fields {
                        out.set_field(k, v.clone());
                    }
                }
                continue;
            }
            let Some(expr) = &term.expr else {
                continue;
            };
            let v = match expr.evaluate(&item, io.ctx.as_ref()) {
                Ok(v) => v,
                Err(e) => {
                    io.ctx.error(Error::evaluation(e, "projection"));
                    return true;
                }
            };
            if v.kind() != ValueKind::Missing {
                any_present = true;
            }
            out.set_field(&term.result_alias(i), v);
        }

        // a row that projects nothing but MISSING disappears
        if !any_star && !any_present && !self.projection.terms.is_empty() {
            return true;
        }

        io.ctx.add_phase_count(PhaseId::Project, 1);
        let projected = AnnotatedValue::projected(Arc::new(item), out);
        io.send_item(projected).await
    }
}

/// Strips scope and metadata: what remains is the result row.
pub struct FinalProject;

#[async_trait]
impl Operator for FinalProject {
    fn name(&self) -> &'static str {
        "FinalProject"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let out = AnnotatedValue::new(item.value().clone());
        io.send_item(out).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::ProjectionTerm;
    use crate::datastore::MemoryDatastore;
    use crate::execution::base::{run_operator, ValueInput};
    use crate::execution::context::{CollectorSink, Context};
    use crate::expression::Expr;
    use crate::server::settings::Settings;
    use serde_json::json;
    use tokio::sync::{mpsc, watch};

    fn test_ctx() -> Arc<Context> {
        let store = MemoryDatastore::new("t");
        let (sink, _rows) = CollectorSink::new();
        Context::new("req", store, Settings::default(), Box::new(sink))
    }

    fn item(doc: serde_json::Value) -> AnnotatedValue {
        let mut av = AnnotatedValue::new(Value::empty_object());
        av.set_field("k", Value::from(doc));
        av.set_meta_id("doc1");
        av
    }

    async fn project(projection: Projection, items: Vec<AnnotatedValue>) -> Vec<AnnotatedValue> {
        let ctx = test_ctx();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let io = OperatorIo::new(ctx, Some(out_tx), stop_rx, None, 0);

        let op = InitialProject {
            projection: Arc::new(projection),
        };
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
    async fn test_projects_aliased_fields() {
        let projection = Projection::new(vec![ProjectionTerm::new(Expr::path("k", "a"))]);
        let out = project(projection, vec![item(json!({"a": "A", "b": 1}))]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(
            serde_json::Value::from(out[0].value().clone()),
            json!({"a": "A"})
        );
        // the source is still reachable through the scope
        assert_eq!(out[0].field("k").0.field("b").0, Value::int(1));
        // and the primary key attachment survived
        assert_eq!(out[0].meta_id().as_deref(), Some("doc1"));
    }

    #[tokio::test]
    async fn test_all_missing_row_suppressed() {
        let projection = Projection::new(vec![ProjectionTerm::new(Expr::path("k", "a"))]);
        let out = project(
            projection,
            vec![item(json!({"a": 1})), item(json!({"b": 2}))],
        )
        .await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_star_merges_item_fields() {
        let projection = Projection::new(vec![ProjectionTerm::star()]);
        let out = project(projection, vec![item(json!({"a": 1}))]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(
            serde_json::Value::from(out[0].value().clone()),
            json!({"k": {"a": 1}})
        );
    }

    #[tokio::test]
    async fn test_final_project_strips_scope() {
        let ctx = test_ctx();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let io = OperatorIo::new(ctx, Some(out_tx), stop_rx, None, 0);

        let task = tokio::spawn(run_operator(
            FinalProject,
            io,
            Some(ValueInput::Chan(in_rx)),
            None,
        ));
        let source = Arc::new(item(json!({"hidden": true})));
        let projected =
            AnnotatedValue::projected(source, Value::from(json!({"a": 1})));
        in_tx.send(projected).await.unwrap();
        drop(in_tx);

        let out = out_rx.recv().await.unwrap();
        assert!(out.parent().is_none());
        assert_eq!(out.field("k").0, Value::Missing);
        task.await.unwrap();
    }
}
