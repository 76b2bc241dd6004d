//! Datastore capability.
//!
//! The engine reaches storage only through these traits: a `Datastore`
//! resolves namespaces, a `Namespace` resolves keyspaces, a `Keyspace`
//! fetches and mutates documents and exposes an `Indexer` of `Index`es.
//! Index scans stream entries through an [`IndexConnection`], which also
//! carries cancellation back to the index.

mod memory;

pub use memory::{MemoryDatastore, MemoryKeyspace, MemoryNamespace};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::errors::Result;
use crate::expression::Expr;
use crate::value::Value;

/// One index entry: the indexed key values plus the primary key of the
/// document they came from.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub primary_key: String,
    pub entry_key: Vec<Value>,
}

/// Which positions of the index key an entry should carry, and whether
/// the primary key is wanted.
#[derive(Debug, Clone)]
pub struct IndexProjection {
    pub entry_keys: Vec<usize>,
    pub primary_key: bool,
}

/// Span bound inclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    Neither,
    Low,
    High,
    Both,
}

impl Inclusion {
    pub fn includes_low(&self) -> bool {
        matches!(self, Inclusion::Low | Inclusion::Both)
    }

    pub fn includes_high(&self) -> bool {
        matches!(self, Inclusion::High | Inclusion::Both)
    }
}

/// A range over one index key position.
#[derive(Debug, Clone)]
pub struct Range2 {
    pub low: Option<Value>,
    pub high: Option<Value>,
    pub inclusion: Inclusion,
}

impl Range2 {
    /// Whether `v` falls inside this range.
    pub fn contains(&self, v: &Value) -> bool {
        if let Some(low) = &self.low {
            let ord = low.collate(v);
            if ord.is_gt() || (ord.is_eq() && !self.inclusion.includes_low()) {
                return false;
            }
        }
        if let Some(high) = &self.high {
            let ord = v.collate(high);
            if ord.is_gt() || (ord.is_eq() && !self.inclusion.includes_high()) {
                return false;
            }
        }
        true
    }
}

/// An index range query: one range per leading key position, plus an
/// optional seek point.
#[derive(Debug, Clone)]
pub struct Span2 {
    pub seek: Option<Vec<Value>>,
    pub ranges: Vec<Range2>,
}

impl Span2 {
    /// Full-index span.
    pub fn whole() -> Self {
        Self {
            seek: None,
            ranges: vec![Range2 {
                low: None,
                high: None,
                inclusion: Inclusion::Both,
            }],
        }
    }

    pub fn matches(&self, entry_key: &[Value]) -> bool {
        self.ranges.iter().enumerate().all(|(i, range)| {
            let v = entry_key.get(i).unwrap_or(&Value::Missing);
            range.contains(v)
        })
    }
}

/// Read consistency of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanConsistency {
    #[default]
    Unbounded,
    RequestPlus,
}

/// Producer half of an index scan: the index pushes entries in, and
/// observes the stop signal the consumer raises.
pub struct IndexConnection {
    tx: mpsc::Sender<IndexEntry>,
    stop: watch::Receiver<bool>,
}

impl IndexConnection {
    /// Creates a connection with the given channel capacity. Returns the
    /// connection (for the index), the entry receiver and the stop handle
    /// (for the scan operator).
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<IndexEntry>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            Self { tx, stop: stop_rx },
            rx,
            stop_tx,
        )
    }

    /// Sends one entry. Returns false when the scan has been stopped or
    /// the consumer is gone; the index should end the scan.
    pub async fn send_entry(&mut self, entry: IndexEntry) -> bool {
        if *self.stop.borrow() {
            return false;
        }
        tokio::select! {
            res = self.tx.send(entry) => res.is_ok(),
            _ = self.stop.wait_for(|s| *s) => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

/// A fetched or mutated document pair.
#[derive(Debug, Clone)]
pub struct DocPair {
    pub key: String,
    pub value: Value,
}

/// Top-level datastore: a set of namespaces.
pub trait Datastore: Send + Sync {
    fn id(&self) -> &str;
    fn namespace_names(&self) -> Result<Vec<String>>;
    fn namespace(&self, name: &str) -> Result<Arc<dyn Namespace>>;
}

/// A namespace: a set of keyspaces.
pub trait Namespace: Send + Sync {
    fn name(&self) -> &str;
    fn keyspace_names(&self) -> Result<Vec<String>>;
    fn keyspace(&self, name: &str) -> Result<Arc<dyn Keyspace>>;
}

/// A keyspace: documents addressable by primary key.
#[async_trait]
pub trait Keyspace: Send + Sync {
    fn namespace_name(&self) -> &str;
    fn name(&self) -> &str;

    async fn count(&self) -> Result<u64>;

    fn indexer(&self) -> Result<Arc<dyn Indexer>>;

    /// Fetches documents by primary key. Unknown keys are omitted from
    /// the result, preserving request order otherwise.
    async fn fetch(&self, keys: &[String]) -> Result<Vec<DocPair>>;

    /// Inserts new documents; keys that already exist are errors.
    async fn insert(&self, pairs: Vec<DocPair>) -> Result<u64>;

    /// Replaces existing documents; unknown keys are ignored.
    async fn update(&self, pairs: Vec<DocPair>) -> Result<u64>;

    /// Inserts or replaces.
    async fn upsert(&self, pairs: Vec<DocPair>) -> Result<u64>;

    /// Deletes by primary key; unknown keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<u64>;
}

/// Index catalog of one keyspace.
pub trait Indexer: Send + Sync {
    fn indexes(&self) -> Result<Vec<Arc<dyn Index>>>;
    fn index_by_name(&self, name: &str) -> Result<Arc<dyn Index>>;
    fn primary_index(&self) -> Result<Arc<dyn Index>>;

    fn create_index(
        &self,
        name: &str,
        keys: Vec<Expr>,
        condition: Option<Expr>,
        primary: bool,
    ) -> Result<Arc<dyn Index>>;

    fn drop_index(&self, name: &str) -> Result<()>;

    fn rename_index(&self, name: &str, new_name: &str) -> Result<()>;
}

/// A secondary or primary index.
///
/// Key expressions are written against the document root (`x`, `a.b`),
/// not against any query alias; the planner qualifies them per term. The
/// condition, when present, makes this a partial index.
#[async_trait]
pub trait Index: Send + Sync {
    fn name(&self) -> &str;
    fn is_primary(&self) -> bool;
    fn keys(&self) -> &[Expr];
    fn condition(&self) -> Option<&Expr>;

    /// Whether scans preserve key order.
    fn ordered(&self) -> bool {
        true
    }

    /// Streams matching entries into `conn`, then returns. Cancellation
    /// arrives through the connection's stop signal. `limit < 0` means
    /// unlimited.
    #[allow(clippy::too_many_arguments)]
    async fn scan2(
        &self,
        request_id: &str,
        spans: &[Span2],
        reverse: bool,
        distinct: bool,
        ordered: bool,
        projection: Option<&IndexProjection>,
        offset: i64,
        limit: i64,
        consistency: ScanConsistency,
        conn: IndexConnection,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_inclusion() {
        let r = Range2 {
            low: Some(Value::int(1)),
            high: Some(Value::int(5)),
            inclusion: Inclusion::Low,
        };
        assert!(r.contains(&Value::int(1)));
        assert!(r.contains(&Value::int(3)));
        assert!(!r.contains(&Value::int(5)));
        assert!(!r.contains(&Value::int(0)));
    }

    #[test]
    fn test_whole_span_matches_everything_valued() {
        let s = Span2::whole();
        assert!(s.matches(&[Value::int(1)]));
        assert!(s.matches(&[Value::string("z")]));
        // missing leading key still inside an unbounded range
        assert!(s.matches(&[Value::Missing]));
    }

    #[tokio::test]
    async fn test_connection_stop_breaks_send() {
        let (mut conn, _rx, stop) = IndexConnection::new(1);
        stop.send(true).unwrap();
        let sent = conn
            .send_entry(IndexEntry {
                primary_key: "k".into(),
                entry_key: vec![],
            })
            .await;
        assert!(!sent);
    }
}
