//! Engine settings.
//!
//! A process-wide bundle loaded once at startup and snapshotted into each
//! request's context; execution never reads mutable global state.

use serde::Deserialize;

use crate::errors::{Error, Result};

fn default_servicers() -> usize {
    4 * num_cpus()
}

fn default_scan_cap() -> usize {
    512
}

fn default_pipeline_batch() -> usize {
    16
}

fn default_pipeline_cap() -> usize {
    512
}

fn default_max_parallelism() -> usize {
    num_cpus()
}

fn default_timeout_ms() -> u64 {
    75_000
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Feature controls: bit flags disabling engine behaviors.
pub mod feat {
    /// Disable covering-index scans.
    pub const NO_COVERING: u64 = 1 << 0;
    /// Disable union scans derived from OR predicates.
    pub const NO_UNION_SCAN: u64 = 1 << 1;
    /// Disable intra-query parallelism.
    pub const NO_PARALLELISM: u64 = 1 << 2;
}

/// The settings bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum concurrently admitted requests.
    pub servicers: usize,
    /// Index-connection channel capacity.
    pub scan_cap: usize,
    /// Operator channel capacity.
    pub pipeline_batch: usize,
    /// Upper bound on items buffered by blocking operators before they
    /// are considered runaway.
    pub pipeline_cap: usize,
    /// Replica count for Parallel operators.
    pub max_parallelism: usize,
    /// Request timeout in milliseconds; 0 disables the watcher.
    pub timeout_ms: u64,
    /// Feature-control bit mask; see [`feat`].
    pub feature_controls: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            servicers: default_servicers(),
            scan_cap: default_scan_cap(),
            pipeline_batch: default_pipeline_batch(),
            pipeline_cap: default_pipeline_cap(),
            max_parallelism: default_max_parallelism(),
            timeout_ms: default_timeout_ms(),
            feature_controls: 0,
        }
    }
}

impl Settings {
    /// Validates invariants that would otherwise surface as hangs.
    pub fn validate(&self) -> Result<()> {
        if self.servicers == 0 {
            return Err(Error::admin("servicers must be positive"));
        }
        if self.pipeline_batch == 0 {
            return Err(Error::admin("pipeline_batch must be positive"));
        }
        if self.max_parallelism == 0 {
            return Err(Error::admin("max_parallelism must be positive"));
        }
        if self.scan_cap == 0 {
            return Err(Error::admin("scan_cap must be positive"));
        }
        Ok(())
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(raw)
            .map_err(|e| Error::admin(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn feature_disabled(&self, bit: u64) -> bool {
        self.feature_controls & bit != 0
    }

    pub fn effective_parallelism(&self) -> usize {
        if self.feature_disabled(feat::NO_PARALLELISM) {
            1
        } else {
            self.max_parallelism
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_from_json_partial_override() {
        let s = Settings::from_json(r#"{"pipeline_batch": 32, "timeout_ms": 100}"#).unwrap();
        assert_eq!(s.pipeline_batch, 32);
        assert_eq!(s.timeout_ms, 100);
        assert_eq!(s.scan_cap, 512);
    }

    #[test]
    fn test_zero_servicers_rejected() {
        let err = Settings::from_json(r#"{"servicers": 0}"#).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Admin);
    }

    #[test]
    fn test_feature_controls() {
        let s = Settings::from_json(r#"{"feature_controls": 4}"#).unwrap();
        assert!(s.feature_disabled(feat::NO_PARALLELISM));
        assert_eq!(s.effective_parallelism(), 1);
    }
}
