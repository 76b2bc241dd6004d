//! In-memory datastore.
//!
//! Backs embedded use and the test suites. Documents live in a BTreeMap
//! per keyspace; secondary indexes evaluate their key expressions lazily
//! at scan time, so index maintenance under DML is free.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::expression::{Expr, FoldContext};
use crate::value::{AnnotatedValue, Value, ValueKind};

use super::{
    Datastore, DocPair, Index, IndexConnection, IndexEntry, IndexProjection, Indexer, Keyspace,
    Namespace, ScanConsistency, Span2,
};

/// An in-memory datastore holding namespaces of keyspaces.
pub struct MemoryDatastore {
    id: String,
    namespaces: RwLock<HashMap<String, Arc<MemoryNamespace>>>,
}

impl MemoryDatastore {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            namespaces: RwLock::new(HashMap::new()),
        })
    }

    pub fn add_namespace(&self, name: impl Into<String>) -> Arc<MemoryNamespace> {
        let name = name.into();
        let ns = Arc::new(MemoryNamespace {
            name: name.clone(),
            keyspaces: RwLock::new(HashMap::new()),
        });
        self.namespaces.write().unwrap().insert(name, ns.clone());
        ns
    }
}

impl Datastore for MemoryDatastore {
    fn id(&self) -> &str {
        &self.id
    }

    fn namespace_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.namespaces.read().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn namespace(&self, name: &str) -> Result<Arc<dyn Namespace>> {
        self.namespaces
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .map(|ns| ns as Arc<dyn Namespace>)
            .ok_or_else(|| Error::datastore(format!("namespace {} not found", name)))
    }
}

pub struct MemoryNamespace {
    name: String,
    keyspaces: RwLock<HashMap<String, Arc<MemoryKeyspace>>>,
}

impl MemoryNamespace {
    pub fn add_keyspace(self: &Arc<Self>, name: impl Into<String>) -> Arc<MemoryKeyspace> {
        let name = name.into();
        let ks = MemoryKeyspace::new(&self.name, &name);
        self.keyspaces
            .write()
            .unwrap()
            .insert(name, ks.clone());
        ks
    }
}

impl Namespace for MemoryNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn keyspace_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.keyspaces.read().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn keyspace(&self, name: &str) -> Result<Arc<dyn Keyspace>> {
        self.keyspaces
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .map(|ks| ks as Arc<dyn Keyspace>)
            .ok_or_else(|| Error::datastore(format!("keyspace {} not found", name)))
    }
}

pub struct MemoryKeyspace {
    namespace: String,
    name: String,
    docs: RwLock<BTreeMap<String, Value>>,
    indexer: RwLock<Option<Arc<MemoryIndexer>>>,
}

impl MemoryKeyspace {
    fn new(namespace: &str, name: &str) -> Arc<Self> {
        let ks = Arc::new(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            docs: RwLock::new(BTreeMap::new()),
            indexer: RwLock::new(None),
        });
        let indexer = Arc::new(MemoryIndexer {
            keyspace: Arc::downgrade(&ks),
            indexes: RwLock::new(HashMap::new()),
        });
        indexer
            .indexes
            .write()
            .unwrap()
            .insert("#primary".to_string(), Arc::new(MemoryIndex::primary(&ks)));
        *ks.indexer.write().unwrap() = Some(indexer);
        ks
    }

    /// Test and embedding convenience: loads documents from JSON values.
    pub fn load(&self, docs: Vec<(&str, serde_json::Value)>) {
        let mut map = self.docs.write().unwrap();
        for (k, v) in docs {
            map.insert(k.to_string(), Value::from(v));
        }
    }

    fn snapshot(&self) -> Vec<(String, Value)> {
        self.docs
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl Keyspace for MemoryKeyspace {
    fn namespace_name(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.docs.read().unwrap().len() as u64)
    }

    fn indexer(&self) -> Result<Arc<dyn Indexer>> {
        let guard = self.indexer.read().unwrap();
        guard
            .clone()
            .map(|ix| ix as Arc<dyn Indexer>)
            .ok_or_else(|| Error::datastore("indexer not initialized"))
    }

    async fn fetch(&self, keys: &[String]) -> Result<Vec<DocPair>> {
        let docs = self.docs.read().unwrap();
        Ok(keys
            .iter()
            .filter_map(|k| {
                docs.get(k).map(|v| DocPair {
                    key: k.clone(),
                    value: v.clone(),
                })
            })
            .collect())
    }

    async fn insert(&self, pairs: Vec<DocPair>) -> Result<u64> {
        let mut docs = self.docs.write().unwrap();
        let mut n = 0;
        for pair in pairs {
            if docs.contains_key(&pair.key) {
                return Err(Error::datastore(format!(
                    "duplicate key {} in {}",
                    pair.key, self.name
                )));
            }
            docs.insert(pair.key, pair.value);
            n += 1;
        }
        Ok(n)
    }

    async fn update(&self, pairs: Vec<DocPair>) -> Result<u64> {
        let mut docs = self.docs.write().unwrap();
        let mut n = 0;
        for pair in pairs {
            if let Some(slot) = docs.get_mut(&pair.key) {
                *slot = pair.value;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn upsert(&self, pairs: Vec<DocPair>) -> Result<u64> {
        let mut docs = self.docs.write().unwrap();
        let n = pairs.len() as u64;
        for pair in pairs {
            docs.insert(pair.key, pair.value);
        }
        Ok(n)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut docs = self.docs.write().unwrap();
        let mut n = 0;
        for k in keys {
            if docs.remove(k).is_some() {
                n += 1;
            }
        }
        Ok(n)
    }
}

pub struct MemoryIndexer {
    keyspace: Weak<MemoryKeyspace>,
    indexes: RwLock<HashMap<String, Arc<MemoryIndex>>>,
}

impl Indexer for MemoryIndexer {
    fn indexes(&self) -> Result<Vec<Arc<dyn Index>>> {
        let mut list: Vec<Arc<MemoryIndex>> =
            self.indexes.read().unwrap().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list.into_iter().map(|ix| ix as Arc<dyn Index>).collect())
    }

    fn index_by_name(&self, name: &str) -> Result<Arc<dyn Index>> {
        self.indexes
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .map(|ix| ix as Arc<dyn Index>)
            .ok_or_else(|| Error::index(format!("index {} not found", name)))
    }

    fn primary_index(&self) -> Result<Arc<dyn Index>> {
        self.index_by_name("#primary")
    }

    fn create_index(
        &self,
        name: &str,
        keys: Vec<Expr>,
        condition: Option<Expr>,
        primary: bool,
    ) -> Result<Arc<dyn Index>> {
        let keyspace = self
            .keyspace
            .upgrade()
            .ok_or_else(|| Error::index("keyspace dropped"))?;
        let mut indexes = self.indexes.write().unwrap();
        if indexes.contains_key(name) {
            return Err(Error::index(format!("index {} already exists", name)));
        }
        let index = Arc::new(MemoryIndex {
            name: name.to_string(),
            primary,
            keys,
            condition,
            keyspace: Arc::downgrade(&keyspace),
        });
        indexes.insert(name.to_string(), index.clone());
        Ok(index)
    }

    fn drop_index(&self, name: &str) -> Result<()> {
        if name == "#primary" {
            return Err(Error::index("cannot drop the primary index"));
        }
        self.indexes
            .write()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::index(format!("index {} not found", name)))
    }

    fn rename_index(&self, name: &str, new_name: &str) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap();
        let old = indexes
            .remove(name)
            .ok_or_else(|| Error::index(format!("index {} not found", name)))?;
        let renamed = Arc::new(MemoryIndex {
            name: new_name.to_string(),
            primary: old.primary,
            keys: old.keys.clone(),
            condition: old.condition.clone(),
            keyspace: old.keyspace.clone(),
        });
        indexes.insert(new_name.to_string(), renamed);
        Ok(())
    }
}

pub struct MemoryIndex {
    name: String,
    primary: bool,
    keys: Vec<Expr>,
    condition: Option<Expr>,
    keyspace: Weak<MemoryKeyspace>,
}

impl MemoryIndex {
    fn primary(keyspace: &Arc<MemoryKeyspace>) -> Self {
        Self {
            name: "#primary".to_string(),
            primary: true,
            keys: Vec::new(),
            condition: None,
            keyspace: Arc::downgrade(keyspace),
        }
    }

    /// Evaluates this index's entry for one document, or None when the
    /// document is excluded (condition false, leading key missing).
    fn entry_for(&self, key: &str, doc: &Value) -> Option<Vec<Value>> {
        let item = AnnotatedValue::new(doc.clone());
        if let Some(cond) = &self.condition {
            match cond.evaluate(&item, &FoldContext) {
                Ok(v) if v.truth() => {}
                _ => return None,
            }
        }
        if self.primary {
            return Some(vec![Value::string(key)]);
        }
        let mut entry = Vec::with_capacity(self.keys.len());
        for k in &self.keys {
            entry.push(k.evaluate(&item, &FoldContext).unwrap_or(Value::Null));
        }
        if entry
            .first()
            .map_or(true, |v| v.kind() == ValueKind::Missing)
        {
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl Index for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_primary(&self) -> bool {
        self.primary
    }

    fn keys(&self) -> &[Expr] {
        &self.keys
    }

    fn condition(&self) -> Option<&Expr> {
        self.condition.as_ref()
    }

    async fn scan2(
        &self,
        _request_id: &str,
        spans: &[Span2],
        reverse: bool,
        distinct: bool,
        _ordered: bool,
        projection: Option<&IndexProjection>,
        offset: i64,
        limit: i64,
        _consistency: ScanConsistency,
        mut conn: IndexConnection,
    ) -> Result<()> {
        let keyspace = self
            .keyspace
            .upgrade()
            .ok_or_else(|| Error::index("keyspace dropped"))?;

        let mut matches: Vec<IndexEntry> = Vec::new();
        for (key, doc) in keyspace.snapshot() {
            let Some(entry_key) = self.entry_for(&key, &doc) else {
                continue;
            };
            if !spans.iter().any(|s| s.matches(&entry_key)) {
                continue;
            }
            matches.push(IndexEntry {
                primary_key: key,
                entry_key,
            });
        }

        matches.sort_by(|a, b| {
            let mut ord = std::cmp::Ordering::Equal;
            for (x, y) in a.entry_key.iter().zip(b.entry_key.iter()) {
                ord = x.collate(y);
                if ord != std::cmp::Ordering::Equal {
                    break;
                }
            }
            ord.then_with(|| a.primary_key.cmp(&b.primary_key))
        });
        if reverse {
            matches.reverse();
        }

        if distinct {
            let mut seen = HashSet::new();
            matches.retain(|e| {
                let fingerprint = e
                    .entry_key
                    .iter()
                    .map(|v| v.canonical_string())
                    .collect::<Vec<_>>()
                    .join("\u{1}");
                seen.insert(fingerprint)
            });
        }

        let skip = offset.max(0) as usize;
        let take = if limit < 0 { usize::MAX } else { limit as usize };

        for mut entry in matches.into_iter().skip(skip).take(take) {
            if let Some(proj) = projection {
                let projected = proj
                    .entry_keys
                    .iter()
                    .filter_map(|&i| entry.entry_key.get(i).cloned())
                    .collect();
                entry.entry_key = projected;
            }
            if !conn.send_entry(entry).await {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{Inclusion, Range2};
    use serde_json::json;

    fn keyspace_with_docs() -> Arc<MemoryKeyspace> {
        let store = MemoryDatastore::new("test");
        let ns = store.add_namespace("default");
        let ks = ns.add_keyspace("k");
        ks.load(vec![
            ("a", json!({"x": 1, "y": 2})),
            ("b", json!({"x": 1, "y": 3})),
            ("c", json!({"x": 2, "y": 2})),
            ("d", json!({"y": 9})),
        ]);
        ks
    }

    async fn scan_all(index: Arc<dyn Index>, spans: &[Span2]) -> Vec<IndexEntry> {
        let (conn, mut rx, _stop) = IndexConnection::new(16);
        index
            .scan2("req", spans, false, false, true, None, 0, -1, ScanConsistency::Unbounded, conn)
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_primary_scan_emits_all_keys_in_order() {
        let ks = keyspace_with_docs();
        let primary = ks.indexer().unwrap().primary_index().unwrap();
        let entries = scan_all(primary, &[Span2::whole()]).await;
        let keys: Vec<&str> = entries.iter().map(|e| e.primary_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_secondary_scan_with_span() {
        let ks = keyspace_with_docs();
        let indexer = ks.indexer().unwrap();
        let ix = indexer
            .create_index("ix_x", vec![Expr::ident("x")], None, false)
            .unwrap();

        let span = Span2 {
            seek: None,
            ranges: vec![Range2 {
                low: Some(Value::int(1)),
                high: Some(Value::int(1)),
                inclusion: Inclusion::Both,
            }],
        };
        let entries = scan_all(ix, &[span]).await;
        let keys: Vec<&str> = entries.iter().map(|e| e.primary_key.as_str()).collect();
        // doc "d" has no x, so it is not in the index at all
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_partial_index_condition_excludes() {
        let ks = keyspace_with_docs();
        let indexer = ks.indexer().unwrap();
        let cond = Expr::eq(Expr::ident("y"), Expr::constant(2));
        let ix = indexer
            .create_index("ix_partial", vec![Expr::ident("x")], Some(cond), false)
            .unwrap();
        let entries = scan_all(ix, &[Span2::whole()]).await;
        let keys: Vec<&str> = entries.iter().map(|e| e.primary_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_dml_round_trip() {
        let ks = keyspace_with_docs();
        assert_eq!(ks.count().await.unwrap(), 4);
        ks.delete(&["a".to_string()]).await.unwrap();
        assert_eq!(ks.count().await.unwrap(), 3);
        let inserted = ks
            .insert(vec![DocPair {
                key: "e".into(),
                value: Value::from(json!({"x": 9})),
            }])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        let err = ks
            .insert(vec![DocPair {
                key: "e".into(),
                value: Value::from(json!({})),
            }])
            .await;
        assert!(err.is_err());
    }
}
