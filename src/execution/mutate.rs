//! Mutation operators: Clone, Set, Unset, SendInsert, SendUpdate,
//! SendDelete, Merge.
//!
//! Update pipelines clone each item before touching it, apply SET/UNSET
//! to the aliased document, and batch mutations to the keyspace.
//! Mutation counts accrue on the context; mutated items flow on (a
//! terminal Discard swallows them).

use async_trait::async_trait;

use crate::algebra::{InsertValues, MergeDelete, MergeUpdate, SetTerm, UnsetTerm};
use crate::datastore::DocPair;
use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::KeyspaceRef;
use crate::value::{AnnotatedValue, Value, ValueKind};

use super::base::{Operator, OperatorIo, Phase};
use super::context::PhaseId;

fn set_path(doc: &mut Value, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        doc.set_field(first, value);
        return;
    }
    if let Value::Object(fields) = doc {
        let slot = fields
            .entry(first.clone())
            .or_insert_with(Value::empty_object);
        set_path(slot, rest, value);
    }
}

fn unset_path(doc: &mut Value, path: &[String]) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        doc.set_field(first, Value::Missing);
        return;
    }
    if let Value::Object(fields) = doc {
        if let Some(slot) = fields.get_mut(first) {
            unset_path(slot, rest);
        }
    }
}

fn apply_set(
    doc: &mut Value,
    terms: &[SetTerm],
    item: &AnnotatedValue,
    io: &OperatorIo,
) -> crate::errors::Result<()> {
    for term in terms {
        let v = term.value.evaluate(item, io.ctx.as_ref())?;
        set_path(doc, &term.path, v);
    }
    Ok(())
}

fn apply_unset(doc: &mut Value, terms: &[UnsetTerm]) {
    for term in terms {
        unset_path(doc, &term.path);
    }
}

/// Deep-copies the item so later SET/UNSET operate on a private value.
pub struct Clone_;

#[async_trait]
impl Operator for Clone_ {
    fn name(&self) -> &'static str {
        "Clone"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        io.send_item(item.clone()).await
    }
}

pub struct Set {
    pub alias: String,
    pub terms: Vec<SetTerm>,
}

#[async_trait]
impl Operator for Set {
    fn name(&self) -> &'static str {
        "Set"
    }

    async fn process_item(&mut self, mut item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let (mut doc, present) = item.field(&self.alias);
        if !present {
            return true;
        }
        if let Err(e) = apply_set(&mut doc, &self.terms, &item, io) {
            io.ctx.error(Error::evaluation(e, "set"));
            return true;
        }
        item.set_field(&self.alias, doc);
        io.send_item(item).await
    }
}

pub struct Unset {
    pub alias: String,
    pub terms: Vec<UnsetTerm>,
}

#[async_trait]
impl Operator for Unset {
    fn name(&self) -> &'static str {
        "Unset"
    }

    async fn process_item(&mut self, mut item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let (mut doc, present) = item.field(&self.alias);
        if !present {
            return true;
        }
        apply_unset(&mut doc, &self.terms);
        item.set_field(&self.alias, doc);
        io.send_item(item).await
    }
}

/// INSERT / UPSERT with literal key-value pairs; a producer.
pub struct SendInsert {
    pub term: KeyspaceRef,
    pub values: Vec<InsertValues>,
    pub upsert: bool,
}

#[async_trait]
impl Operator for SendInsert {
    fn name(&self) -> &'static str {
        "SendInsert"
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

        let item = AnnotatedValue::missing();
        let mut pairs = Vec::with_capacity(self.values.len());
        for iv in &self.values {
            let key = match iv.key.evaluate(&item, io.ctx.as_ref()) {
                Ok(v) => match v.as_str() {
                    Some(s) => s.to_string(),
                    None => {
                        io.ctx.error(Error::execution(format!(
                            "insert key must be a string, got {}",
                            v.kind().as_str()
                        )));
                        return false;
                    }
                },
                Err(e) => {
                    io.ctx.error(Error::evaluation(e, "insert key"));
                    return false;
                }
            };
            let value = match iv.value.evaluate(&item, io.ctx.as_ref()) {
                Ok(v) => v,
                Err(e) => {
                    io.ctx.error(Error::evaluation(e, "insert value"));
                    return false;
                }
            };
            pairs.push(DocPair { key, value });
        }

        io.timer.switch(Phase::Serv);
        let result = if self.upsert {
            keyspace.upsert(pairs).await
        } else {
            keyspace.insert(pairs).await
        };
        io.timer.switch(Phase::Exec);

        match result {
            Ok(n) => {
                io.ctx.add_mutation_count(n);
                io.ctx.add_phase_count(PhaseId::Insert, n);
            }
            Err(e) => io.ctx.error(e),
        }
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}

/// Writes updated documents back by primary key.
pub struct SendUpdate {
    pub term: KeyspaceRef,
    pub limit: Option<Expr>,
    remaining: i64,
    batch: Vec<AnnotatedValue>,
}

impl SendUpdate {
    pub fn new(term: KeyspaceRef, limit: Option<Expr>) -> Self {
        Self {
            term,
            limit,
            remaining: i64::MAX,
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
        let mut pairs = Vec::with_capacity(items.len());
        for item in &items {
            let Some(key) = item.meta_id() else {
                continue;
            };
            let (doc, present) = item.field(&self.term.alias);
            if !present || doc.kind() != ValueKind::Object {
                continue;
            }
            pairs.push(DocPair { key, value: doc });
        }

        io.timer.switch(Phase::Serv);
        let result = keyspace.update(pairs).await;
        io.timer.switch(Phase::Exec);

        match result {
            Ok(n) => {
                io.ctx.add_mutation_count(n);
                io.ctx.add_phase_count(PhaseId::Update, n);
            }
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        }
        for item in items {
            if !io.send_item(item).await {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl Operator for SendUpdate {
    fn name(&self) -> &'static str {
        "SendUpdate"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        if let Some(limit) = &self.limit {
            let item = AnnotatedValue::missing();
            if let Ok(v) = limit.evaluate(&item, io.ctx.as_ref()) {
                self.remaining = v.as_i64().unwrap_or(i64::MAX);
            }
        }
        true
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        if self.remaining <= 0 {
            return false;
        }
        self.remaining -= 1;
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

/// Deletes documents by primary key.
pub struct SendDelete {
    pub term: KeyspaceRef,
    pub limit: Option<Expr>,
    remaining: i64,
    batch: Vec<AnnotatedValue>,
}

impl SendDelete {
    pub fn new(term: KeyspaceRef, limit: Option<Expr>) -> Self {
        Self {
            term,
            limit,
            remaining: i64::MAX,
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
        let result = keyspace.delete(&keys).await;
        io.timer.switch(Phase::Exec);

        match result {
            Ok(n) => {
                io.ctx.add_mutation_count(n);
                io.ctx.add_phase_count(PhaseId::Delete, n);
            }
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        }
        for item in items {
            if !io.send_item(item).await {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl Operator for SendDelete {
    fn name(&self) -> &'static str {
        "SendDelete"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        if let Some(limit) = &self.limit {
            let item = AnnotatedValue::missing();
            if let Ok(v) = limit.evaluate(&item, io.ctx.as_ref()) {
                self.remaining = v.as_i64().unwrap_or(i64::MAX);
            }
        }
        true
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        if self.remaining <= 0 {
            return false;
        }
        self.remaining -= 1;
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

/// MERGE: per source item, derive the target key, then update, delete or
/// insert depending on whether the target document exists.
pub struct Merge {
    pub target: KeyspaceRef,
    pub key: Expr,
    pub update: Option<MergeUpdate>,
    pub delete: Option<MergeDelete>,
    pub insert: Option<Expr>,
}

impl Merge {
    /// Target document joined to the source item for WHEN clause
    /// evaluation.
    fn matched_item(&self, source: &AnnotatedValue, doc: Value) -> AnnotatedValue {
        let mut scoped = AnnotatedValue::scope(std::sync::Arc::new(source.clone()));
        scoped.set_field(&self.target.alias, doc);
        scoped
    }
}

#[async_trait]
impl Operator for Merge {
    fn name(&self) -> &'static str {
        "Merge"
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
        let keyspace = match io.ctx.keyspace(&self.target) {
            Ok(k) => k,
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };

        let key = match self.key.evaluate(&item, io.ctx.as_ref()) {
            Ok(v) => match v.as_str() {
                Some(s) => s.to_string(),
                None => return true,
            },
            Err(e) => {
                io.ctx.error(Error::evaluation(e, "merge key"));
                return true;
            }
        };

        io.timer.switch(Phase::Serv);
        let existing = keyspace.fetch(&[key.clone()]).await;
        io.timer.switch(Phase::Exec);

        let existing = match existing {
            Ok(mut docs) => docs.pop(),
            Err(e) => {
                io.ctx.error(e);
                return false;
            }
        };

        match existing {
            Some(pair) => {
                if let Some(update) = &self.update {
                    let merged = self.matched_item(&item, pair.value.clone());
                    let applies = match &update.where_clause {
                        Some(w) => match w.evaluate(&merged, io.ctx.as_ref()) {
                            Ok(v) => v.truth(),
                            Err(e) => {
                                io.ctx.error(Error::evaluation(e, "merge update"));
                                false
                            }
                        },
                        None => true,
                    };
                    if applies {
                        let mut doc = pair.value;
                        if let Err(e) = apply_set(&mut doc, &update.set, &merged, io) {
                            io.ctx.error(Error::evaluation(e, "merge set"));
                            return true;
                        }
                        apply_unset(&mut doc, &update.unset);
                        io.timer.switch(Phase::Serv);
                        let result = keyspace
                            .update(vec![DocPair { key, value: doc }])
                            .await;
                        io.timer.switch(Phase::Exec);
                        match result {
                            Ok(n) => {
                                io.ctx.add_mutation_count(n);
                                io.ctx.add_phase_count(PhaseId::Merge, n);
                            }
                            Err(e) => {
                                io.ctx.error(e);
                                return false;
                            }
                        }
                    }
                } else if let Some(delete) = &self.delete {
                    let merged = self.matched_item(&item, pair.value.clone());
                    let applies = match &delete.where_clause {
                        Some(w) => match w.evaluate(&merged, io.ctx.as_ref()) {
                            Ok(v) => v.truth(),
                            Err(e) => {
                                io.ctx.error(Error::evaluation(e, "merge delete"));
                                false
                            }
                        },
                        None => true,
                    };
                    if applies {
                        io.timer.switch(Phase::Serv);
                        let result = keyspace.delete(&[key]).await;
                        io.timer.switch(Phase::Exec);
                        match result {
                            Ok(n) => {
                                io.ctx.add_mutation_count(n);
                                io.ctx.add_phase_count(PhaseId::Merge, n);
                            }
                            Err(e) => {
                                io.ctx.error(e);
                                return false;
                            }
                        }
                    }
                }
            }
            None => {
                if let Some(insert) = &self.insert {
                    let value = match insert.evaluate(&item, io.ctx.as_ref()) {
                        Ok(v) => v,
                        Err(e) => {
                            io.ctx.error(Error::evaluation(e, "merge insert"));
                            return true;
                        }
                    };
                    io.timer.switch(Phase::Serv);
                    let result = keyspace.insert(vec![DocPair { key, value }]).await;
                    io.timer.switch(Phase::Exec);
                    match result {
                        Ok(n) => {
                            io.ctx.add_mutation_count(n);
                            io.ctx.add_phase_count(PhaseId::Merge, n);
                        }
                        Err(e) => {
                            io.ctx.error(e);
                            return false;
                        }
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_path_nested_creates_intermediate() {
        let mut doc = Value::from(json!({"a": 1}));
        set_path(
            &mut doc,
            &["b".to_string(), "c".to_string()],
            Value::int(2),
        );
        assert_eq!(
            serde_json::Value::from(doc),
            json!({"a": 1, "b": {"c": 2}})
        );
    }

    #[test]
    fn test_unset_path_removes_leaf() {
        let mut doc = Value::from(json!({"a": {"b": 1, "c": 2}}));
        unset_path(&mut doc, &["a".to_string(), "b".to_string()]);
        assert_eq!(serde_json::Value::from(doc), json!({"a": {"c": 2}}));
    }
}
