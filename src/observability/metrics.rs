//! Engine counters.
//!
//! Monotonic counters only, atomic increments, reset on process start.
//! Relaxed ordering: metrics tolerate eventual consistency.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters for the query engine.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Requests admitted for execution
    requests_admitted: AtomicU64,
    /// Requests rejected by the admission layer
    requests_rejected: AtomicU64,
    /// Requests that completed with status success
    requests_completed: AtomicU64,
    /// Requests that finished with errors
    requests_errored: AtomicU64,
    /// Requests stopped by cancellation or timeout
    requests_stopped: AtomicU64,
    /// Result rows streamed to clients
    results_streamed: AtomicU64,
    /// Documents mutated by DML
    mutations: AtomicU64,
    /// Prepared-statement cache hits
    prepared_hits: AtomicU64,
    /// Prepared-statement cache misses
    prepared_misses: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_admitted(&self) {
        self.requests_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_errored(&self) {
        self.requests_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stopped(&self) {
        self.requests_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_results(&self, n: u64) {
        self.results_streamed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_mutations(&self, n: u64) {
        self.mutations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_prepared_hits(&self) {
        self.prepared_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_prepared_misses(&self) {
        self.prepared_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admitted(&self) -> u64 {
        self.requests_admitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.requests_completed.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> u64 {
        self.requests_errored.load(Ordering::Relaxed)
    }

    pub fn stopped(&self) -> u64 {
        self.requests_stopped.load(Ordering::Relaxed)
    }

    pub fn results(&self) -> u64 {
        self.results_streamed.load(Ordering::Relaxed)
    }

    /// Snapshot as a JSON object, keys sorted.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "mutations": self.mutations.load(Ordering::Relaxed),
            "prepared_hits": self.prepared_hits.load(Ordering::Relaxed),
            "prepared_misses": self.prepared_misses.load(Ordering::Relaxed),
            "requests_admitted": self.admitted(),
            "requests_completed": self.completed(),
            "requests_errored": self.errored(),
            "requests_rejected": self.rejected(),
            "requests_stopped": self.stopped(),
            "results_streamed": self.results(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotonic() {
        let m = MetricsRegistry::new();
        m.increment_admitted();
        m.increment_admitted();
        m.add_results(5);
        assert_eq!(m.admitted(), 2);
        assert_eq!(m.results(), 5);
    }

    #[test]
    fn test_json_snapshot() {
        let m = MetricsRegistry::new();
        m.increment_completed();
        let j = m.to_json();
        assert_eq!(j["requests_completed"], 1);
        assert_eq!(j["requests_rejected"], 0);
    }
}
