//! Execution context.
//!
//! One per request: read-mostly configuration plus the serialized result
//! sink, error sinks, and phase accounting shared by every operator of
//! the pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::algebra::Select;
use crate::datastore::{Datastore, ScanConsistency};
use crate::errors::{Error, Result};
use crate::expression::EvalContext;
use crate::server::settings::Settings;
use crate::value::{AnnotatedValue, Value};

/// Work attribution buckets for phase accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseId {
    Authorize,
    Plan,
    PrimaryScan,
    IndexScan,
    CountScan,
    KeyScan,
    ValueScan,
    Fetch,
    Join,
    NlJoin,
    NlNest,
    Unnest,
    Filter,
    Group,
    Project,
    Order,
    Distinct,
    Insert,
    Update,
    Delete,
    Merge,
    Stream,
}

impl PhaseId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Authorize => "authorize",
            PhaseId::Plan => "plan",
            PhaseId::PrimaryScan => "primaryScan",
            PhaseId::IndexScan => "indexScan",
            PhaseId::CountScan => "countScan",
            PhaseId::KeyScan => "keyScan",
            PhaseId::ValueScan => "valueScan",
            PhaseId::Fetch => "fetch",
            PhaseId::Join => "join",
            PhaseId::NlJoin => "nestedLoopJoin",
            PhaseId::NlNest => "nestedLoopNest",
            PhaseId::Unnest => "unnest",
            PhaseId::Filter => "filter",
            PhaseId::Group => "group",
            PhaseId::Project => "project",
            PhaseId::Order => "order",
            PhaseId::Distinct => "distinct",
            PhaseId::Insert => "insert",
            PhaseId::Update => "update",
            PhaseId::Delete => "delete",
            PhaseId::Merge => "merge",
            PhaseId::Stream => "stream",
        }
    }
}

/// Where result rows go. Implementations must be cheap per call; the
/// Stream operator serializes access so a sink sees one writer.
pub trait ResultSink: Send {
    /// Returns false when the client is gone and the pipeline should
    /// stop.
    fn result(&mut self, item: &AnnotatedValue) -> bool;
    fn close(&mut self);
}

/// Collects results in memory; the embedded/request path.
#[derive(Default)]
pub struct CollectorSink {
    rows: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl CollectorSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<serde_json::Value>>>) {
        let rows = Arc::new(Mutex::new(Vec::new()));
        (Self { rows: rows.clone() }, rows)
    }
}

impl ResultSink for CollectorSink {
    fn result(&mut self, item: &AnnotatedValue) -> bool {
        self.rows
            .lock()
            .unwrap()
            .push(serde_json::Value::from(item.value().clone()));
        true
    }

    fn close(&mut self) {}
}

/// Per-request execution context.
pub struct Context {
    request_id: String,
    datastore: Arc<dyn Datastore>,
    settings: Settings,
    consistency: ScanConsistency,
    named_args: HashMap<String, Value>,
    positional_args: Vec<Value>,
    /// Statement-fixed clock: now_utc() is stable for the whole request.
    now: DateTime<Utc>,
    rng: Mutex<u64>,
    sink: Mutex<Option<Box<dyn ResultSink>>>,
    errors: Mutex<Vec<Error>>,
    warnings: Mutex<Vec<Error>>,
    stopped: AtomicBool,
    fatal: AtomicBool,
    result_count: AtomicU64,
    result_size: AtomicU64,
    mutation_count: AtomicU64,
    sort_count: AtomicU64,
    phase_counts: Mutex<HashMap<PhaseId, u64>>,
    phase_times: Mutex<HashMap<PhaseId, Duration>>,
}

impl Context {
    pub fn new(
        request_id: impl Into<String>,
        datastore: Arc<dyn Datastore>,
        settings: Settings,
        sink: Box<dyn ResultSink>,
    ) -> Arc<Self> {
        let request_id = request_id.into();
        // deterministic per-request seed for random()
        let seed = request_id
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
                (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
            });
        Arc::new(Self {
            request_id,
            datastore,
            settings,
            consistency: ScanConsistency::Unbounded,
            named_args: HashMap::new(),
            positional_args: Vec::new(),
            now: Utc::now(),
            rng: Mutex::new(seed | 1),
            sink: Mutex::new(Some(sink)),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            result_count: AtomicU64::new(0),
            result_size: AtomicU64::new(0),
            mutation_count: AtomicU64::new(0),
            sort_count: AtomicU64::new(0),
            phase_counts: Mutex::new(HashMap::new()),
            phase_times: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_args(
        mut self: Arc<Self>,
        named: HashMap<String, Value>,
        positional: Vec<Value>,
    ) -> Arc<Self> {
        let ctx = Arc::get_mut(&mut self).expect("context not yet shared");
        ctx.named_args = named;
        ctx.positional_args = positional;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    /// Resolves a plan-time keyspace reference against the datastore.
    pub fn keyspace(
        &self,
        term: &crate::plan::KeyspaceRef,
    ) -> Result<Arc<dyn crate::datastore::Keyspace>> {
        let namespace = self.datastore.namespace(&term.namespace)?;
        namespace.keyspace(&term.keyspace)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn scan_consistency(&self) -> ScanConsistency {
        self.consistency
    }

    pub fn pipeline_batch(&self) -> usize {
        self.settings.pipeline_batch
    }

    pub fn scan_cap(&self) -> usize {
        self.settings.scan_cap
    }

    pub fn max_parallelism(&self) -> usize {
        self.settings.effective_parallelism()
    }

    /// Forwards one row to the sink. False stops the pipeline.
    pub fn result(&self, item: &AnnotatedValue) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.sink.lock().unwrap();
        match guard.as_mut() {
            Some(sink) => {
                let ok = sink.result(item);
                if ok {
                    self.result_count.fetch_add(1, Ordering::Relaxed);
                    self.result_size.fetch_add(
                        item.value().canonical_string().len() as u64,
                        Ordering::Relaxed,
                    );
                }
                ok
            }
            None => false,
        }
    }

    pub fn close_results(&self) {
        let mut guard = self.sink.lock().unwrap();
        if let Some(sink) = guard.as_mut() {
            sink.close();
        }
        *guard = None;
    }

    /// Publishes an error. Fatal errors also stop the request.
    pub fn error(&self, e: Error) {
        if e.is_fatal() {
            self.fatal.store(true, Ordering::Release);
            self.stopped.store(true, Ordering::Release);
        }
        self.errors.lock().unwrap().push(e);
    }

    pub fn warning(&self, e: Error) {
        self.warnings.lock().unwrap().push(e);
    }

    /// Verifies a runtime invariant; a failure is an internal error.
    pub fn assert(&self, cond: bool, msg: &str) -> bool {
        if !cond {
            self.error(Error::execution_internal(msg.to_string()));
        }
        cond
    }

    /// Converts a recovered panic payload into an internal error.
    pub fn recover(&self, panic: Box<dyn std::any::Any + Send>) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        self.error(Error::execution_internal(format!(
            "recovered panic: {}",
            msg
        )));
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn had_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub fn take_errors(&self) -> Vec<Error> {
        std::mem::take(&mut self.errors.lock().unwrap())
    }

    pub fn take_warnings(&self) -> Vec<Error> {
        std::mem::take(&mut self.warnings.lock().unwrap())
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn add_mutation_count(&self, n: u64) {
        self.mutation_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_sort_count(&self, n: u64) {
        self.sort_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn result_count(&self) -> u64 {
        self.result_count.load(Ordering::Relaxed)
    }

    pub fn result_size(&self) -> u64 {
        self.result_size.load(Ordering::Relaxed)
    }

    pub fn mutation_count(&self) -> u64 {
        self.mutation_count.load(Ordering::Relaxed)
    }

    pub fn sort_count(&self) -> u64 {
        self.sort_count.load(Ordering::Relaxed)
    }

    pub fn add_phase_count(&self, phase: PhaseId, n: u64) {
        *self.phase_counts.lock().unwrap().entry(phase).or_insert(0) += n;
    }

    pub fn add_phase_time(&self, phase: PhaseId, d: Duration) {
        *self
            .phase_times
            .lock()
            .unwrap()
            .entry(phase)
            .or_insert(Duration::ZERO) += d;
    }

    pub fn phase_count(&self, phase: PhaseId) -> u64 {
        self.phase_counts
            .lock()
            .unwrap()
            .get(&phase)
            .copied()
            .unwrap_or(0)
    }

    pub fn phase_times_json(&self) -> serde_json::Value {
        let times = self.phase_times.lock().unwrap();
        let mut obj = serde_json::Map::new();
        let mut entries: Vec<(&PhaseId, &Duration)> = times.iter().collect();
        entries.sort_by_key(|(p, _)| p.as_str());
        for (phase, d) in entries {
            obj.insert(
                phase.as_str().to_string(),
                serde_json::json!(format!("{:?}", d)),
            );
        }
        serde_json::Value::Object(obj)
    }
}

impl EvalContext for Context {
    fn now_utc(&self) -> Result<Value> {
        Ok(Value::string(self.now.to_rfc3339()))
    }

    fn random(&self) -> Result<Value> {
        let mut state = self.rng.lock().unwrap();
        // xorshift64
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *state = x;
        Ok(Value::float((x >> 11) as f64 / (1u64 << 53) as f64))
    }

    fn named_arg(&self, name: &str) -> Result<Value> {
        self.named_args
            .get(name)
            .cloned()
            .ok_or_else(|| Error::evaluation_message(format!("no named argument ${}", name)))
    }

    fn positional_arg(&self, pos: usize) -> Result<Value> {
        self.positional_args
            .get(pos)
            .cloned()
            .ok_or_else(|| Error::evaluation_message(format!("no positional argument ${}", pos)))
    }

    /// Runs a nested select to completion and returns its rows as an
    /// array. Correlated references resolve through the parent item's
    /// scope. Blocking on the nested pipeline requires the
    /// multi-threaded runtime.
    fn evaluate_subquery(&self, select: &Arc<Select>, item: &AnnotatedValue) -> Result<Value> {
        let statement = crate::algebra::Statement::Select(select.clone());
        let plan = crate::planner::build_with(&statement, &self.datastore, &self.settings)?;

        let (sink, rows) = CollectorSink::new();
        let child = Context::new(
            format!("{}:subquery", self.request_id),
            self.datastore.clone(),
            self.settings.clone(),
            Box::new(sink),
        )
        .with_args(self.named_args.clone(), self.positional_args.clone());

        let parent = item.clone();
        let outcome = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let mut pipeline = crate::execution::spawn_plan(&plan, &child, Some(parent))?;
                if let Some(mut output) = pipeline.take_output() {
                    while output.recv().await.is_some() {}
                }
                pipeline.join().await;
                let mut errors = child.take_errors();
                match errors.pop() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            })
        });
        outcome?;

        let collected = std::mem::take(&mut *rows.lock().unwrap());
        Ok(Value::Array(
            collected.into_iter().map(Value::from).collect(),
        ))
    }
}
