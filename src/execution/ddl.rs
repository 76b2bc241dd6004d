//! Index DDL and EXPLAIN.

use std::sync::Arc;

use async_trait::async_trait;

use crate::algebra;
use crate::plan::PlanNode;
use crate::value::{AnnotatedValue, Value};

use super::base::{Operator, OperatorIo};

fn resolve_indexer(
    io: &OperatorIo,
    term: &algebra::KeyspaceTerm,
) -> Option<Arc<dyn crate::datastore::Indexer>> {
    let resolved = io
        .ctx
        .datastore()
        .namespace(&term.namespace)
        .and_then(|ns| ns.keyspace(&term.keyspace))
        .and_then(|ks| ks.indexer());
    match resolved {
        Ok(ix) => Some(ix),
        Err(e) => {
            io.ctx.error(e);
            None
        }
    }
}

pub struct CreateIndex {
    pub node: algebra::CreateIndex,
}

#[async_trait]
impl Operator for CreateIndex {
    fn name(&self) -> &'static str {
        "CreateIndex"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        if let Some(indexer) = resolve_indexer(io, &self.node.term) {
            if let Err(e) = indexer.create_index(
                &self.node.name,
                self.node.keys.clone(),
                self.node.where_clause.clone(),
                self.node.primary,
            ) {
                io.ctx.error(e);
            }
        }
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

pub struct DropIndex {
    pub node: algebra::DropIndex,
}

#[async_trait]
impl Operator for DropIndex {
    fn name(&self) -> &'static str {
        "DropIndex"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        if let Some(indexer) = resolve_indexer(io, &self.node.term) {
            if let Err(e) = indexer.drop_index(&self.node.name) {
                io.ctx.error(e);
            }
        }
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

pub struct AlterIndex {
    pub node: algebra::AlterIndex,
}

#[async_trait]
impl Operator for AlterIndex {
    fn name(&self) -> &'static str {
        "AlterIndex"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        if let Some(indexer) = resolve_indexer(io, &self.node.term) {
            if let Some(new_name) = &self.node.rename_to {
                if let Err(e) = indexer.rename_index(&self.node.name, new_name) {
                    io.ctx.error(e);
                }
            }
        }
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

/// Emits the child plan's JSON rendering as a single row; the child is
/// never executed.
pub struct Explain {
    pub child: Arc<PlanNode>,
}

#[async_trait]
impl Operator for Explain {
    fn name(&self) -> &'static str {
        "Explain"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        let rendered = Value::from(self.child.to_json());
        let mut out = Value::empty_object();
        out.set_field("plan", rendered);
        io.send_item(AnnotatedValue::new(out)).await;
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}
