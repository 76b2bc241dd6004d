//! Request auditing.
//!
//! Every finished request can be submitted as an [`Auditable`]; the
//! auditor derives the numeric event id from the statement type, builds
//! a flat record and hands it to a queue worker so the submitting
//! request never blocks on the transport. The transport itself is a
//! trait; deployments plug their own.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{Error, Result};

/// The fields a request exposes for auditing.
pub trait Auditable: Send {
    /// Final status: "success", "errors" or "stopped".
    fn event_status(&self) -> String;
    fn statement(&self) -> String;
    /// Statement type: "SELECT", "UPDATE", "CREATE_INDEX", ...
    fn event_type(&self) -> String;
    fn event_users(&self) -> Vec<String>;
    fn user_agent(&self) -> String;
    fn event_node_name(&self) -> String;
    fn event_named_args(&self) -> Vec<(String, String)>;
    fn event_positional_args(&self) -> Vec<String>;
    fn client_context_id(&self) -> String;
    fn is_ad_hoc(&self) -> bool;
    fn elapsed_time(&self) -> Duration;
    fn execution_time(&self) -> Duration;
    fn event_result_count(&self) -> u64;
    fn event_result_size(&self) -> u64;
    fn mutation_count(&self) -> u64;
    fn sort_count(&self) -> u64;
    fn event_error_count(&self) -> usize;
    fn event_warning_count(&self) -> usize;
}

/// Fixed statement-type to event-id table. Unknown types map to the
/// generic id.
pub fn event_id(event_type: &str) -> u32 {
    match event_type {
        "SELECT" => 28672,
        "EXPLAIN" => 28673,
        "PREPARE" => 28674,
        "INSERT" => 28676,
        "UPSERT" => 28677,
        "DELETE" => 28678,
        "UPDATE" => 28679,
        "MERGE" => 28680,
        "CREATE_INDEX" => 28681,
        "DROP_INDEX" => 28682,
        "ALTER_INDEX" => 28683,
        _ => 28687,
    }
}

/// One audit record, flattened for the transport.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_id: u32,
    pub event_type: String,
    pub status: String,
    pub statement: String,
    pub users: Vec<String>,
    pub user_agent: String,
    pub node_name: String,
    pub named_args: Vec<(String, String)>,
    pub positional_args: Vec<String>,
    pub client_context_id: String,
    pub ad_hoc: bool,
    pub elapsed_time: Duration,
    pub execution_time: Duration,
    pub result_count: u64,
    pub result_size: u64,
    pub mutation_count: u64,
    pub sort_count: u64,
    pub error_count: usize,
    pub warning_count: usize,
}

impl AuditRecord {
    fn from_auditable(auditable: &dyn Auditable) -> Self {
        let event_type = auditable.event_type();
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_id: event_id(&event_type),
            event_type,
            status: auditable.event_status(),
            statement: auditable.statement(),
            users: auditable.event_users(),
            user_agent: auditable.user_agent(),
            node_name: auditable.event_node_name(),
            named_args: auditable.event_named_args(),
            positional_args: auditable.event_positional_args(),
            client_context_id: auditable.client_context_id(),
            ad_hoc: auditable.is_ad_hoc(),
            elapsed_time: auditable.elapsed_time(),
            execution_time: auditable.execution_time(),
            result_count: auditable.event_result_count(),
            result_size: auditable.event_result_size(),
            mutation_count: auditable.mutation_count(),
            sort_count: auditable.sort_count(),
            error_count: auditable.event_error_count(),
            warning_count: auditable.event_warning_count(),
        }
    }
}

/// The audit transport. External; deployments provide their own.
pub trait AuditSink: Send + Sync {
    fn submit(&self, record: AuditRecord);
}

/// Keeps records in memory; tests and embedded use.
#[derive(Default)]
pub struct MemorySink {
    records: std::sync::Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl AuditSink for MemorySink {
    fn submit(&self, record: AuditRecord) {
        self.records.lock().unwrap().push(record);
    }
}

/// Append-only JSON-lines audit file. Writes are synced per record so a
/// crash never loses an acknowledged event.
pub struct FileSink {
    writer: Mutex<BufWriter<std::fs::File>>,
}

impl FileSink {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::admin(format!("cannot open audit log: {}", e)))?;
        Ok(Arc::new(Self {
            writer: Mutex::new(BufWriter::new(file)),
        }))
    }
}

impl AuditSink for FileSink {
    fn submit(&self, record: AuditRecord) {
        let line = serde_json::json!({
            "id": record.id.to_string(),
            "timestamp": record.timestamp.to_rfc3339(),
            "event_id": record.event_id,
            "event_type": record.event_type,
            "status": record.status,
            "statement": record.statement,
            "users": record.users,
            "client_context_id": record.client_context_id,
            "result_count": record.result_count,
            "mutation_count": record.mutation_count,
            "error_count": record.error_count,
        });
        let mut writer = self.writer.lock().unwrap();
        let _ = writeln!(writer, "{}", line);
        let _ = writer.flush();
    }
}

/// Asynchronous auditor: submissions enqueue, a worker drains to the
/// sink.
pub struct Auditor {
    enabled: bool,
    queue: Option<mpsc::UnboundedSender<AuditRecord>>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                sink.submit(record);
            }
        });
        Self {
            enabled: true,
            queue: Some(tx),
            worker: Some(worker),
        }
    }

    /// An auditor that drops everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            queue: None,
            worker: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Queues one auditable; never blocks the caller.
    pub fn submit(&self, auditable: &dyn Auditable) {
        if !self.enabled {
            return;
        }
        if let Some(queue) = &self.queue {
            let _ = queue.send(AuditRecord::from_auditable(auditable));
        }
    }

    /// Closes the queue and waits for the worker to drain it.
    pub async fn shutdown(mut self) {
        self.queue = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fixed auditable used to exercise the queue.
    struct SimpleAuditable {
        status: String,
        statement: String,
        event_type: String,
    }

    impl Auditable for SimpleAuditable {
        fn event_status(&self) -> String {
            self.status.clone()
        }
        fn statement(&self) -> String {
            self.statement.clone()
        }
        fn event_type(&self) -> String {
            self.event_type.clone()
        }
        fn event_users(&self) -> Vec<String> {
            vec!["local:alice".to_string()]
        }
        fn user_agent(&self) -> String {
            "test-agent".to_string()
        }
        fn event_node_name(&self) -> String {
            "node-1".to_string()
        }
        fn event_named_args(&self) -> Vec<(String, String)> {
            vec![]
        }
        fn event_positional_args(&self) -> Vec<String> {
            vec![]
        }
        fn client_context_id(&self) -> String {
            "ctx-1".to_string()
        }
        fn is_ad_hoc(&self) -> bool {
            true
        }
        fn elapsed_time(&self) -> Duration {
            Duration::from_millis(12)
        }
        fn execution_time(&self) -> Duration {
            Duration::from_millis(10)
        }
        fn event_result_count(&self) -> u64 {
            3
        }
        fn event_result_size(&self) -> u64 {
            64
        }
        fn mutation_count(&self) -> u64 {
            0
        }
        fn sort_count(&self) -> u64 {
            0
        }
        fn event_error_count(&self) -> usize {
            0
        }
        fn event_warning_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_event_id_table_is_fixed() {
        assert_eq!(event_id("SELECT"), 28672);
        assert_eq!(event_id("UPDATE"), 28679);
        assert_eq!(event_id("CREATE_INDEX"), 28681);
        // unknown types get the generic id
        assert_eq!(event_id("SOMETHING_ELSE"), 28687);
    }

    #[tokio::test]
    async fn test_submitted_records_reach_the_sink() {
        let sink = MemorySink::new();
        let auditor = Auditor::new(sink.clone());
        auditor.submit(&SimpleAuditable {
            status: "success".to_string(),
            statement: "SELECT a FROM k".to_string(),
            event_type: "SELECT".to_string(),
        });
        auditor.shutdown().await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_id, 28672);
        assert_eq!(records[0].status, "success");
        assert_eq!(records[0].users, vec!["local:alice"]);
    }

    #[tokio::test]
    async fn test_file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = FileSink::open(&path).unwrap();
        let auditor = Auditor::new(sink);
        auditor.submit(&SimpleAuditable {
            status: "success".to_string(),
            statement: "SELECT 1".to_string(),
            event_type: "SELECT".to_string(),
        });
        auditor.shutdown().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["event_id"], 28672);
        assert_eq!(parsed["status"], "success");
    }

    #[tokio::test]
    async fn test_disabled_auditor_drops_everything() {
        let auditor = Auditor::disabled();
        auditor.submit(&SimpleAuditable {
            status: "success".to_string(),
            statement: "SELECT 1".to_string(),
            event_type: "SELECT".to_string(),
        });
        assert!(!auditor.is_enabled());
    }
}
