//! Configuration for a destination sync run.
//!
//! Loading (files, environment, CLI flags) happens outside this crate; the
//! struct derives `Deserialize` with `#[serde(default)]` so any loader can
//! fill in a subset of fields.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DestError;

/// Configuration for a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestConfig {
    /// Total memory available to the process, in bytes.
    pub total_memory_bytes: u64,

    /// Fraction of `total_memory_bytes` reserved for queued records.
    pub queue_memory_ratio: f64,

    /// Multiplier applied to each record's size before reserving memory,
    /// accounting for per-entry queue overhead. Must be `>= 1.0`.
    pub record_overhead_ratio: f64,

    /// Target size of each spool file in bytes.
    pub bytes_per_spool_file: u64,

    /// Directory for spool files (`None` = system temp dir).
    pub spool_dir: Option<PathBuf>,

    /// Maximum time a partially filled spool chunk waits for more records
    /// before it is cut. `0` disables the window.
    pub spill_window_ms: u64,

    /// Upper bound on checkpoint acknowledgement latency. When no checkpoint
    /// has been flushed for this long, partial chunks are force-spilled.
    pub checkpoint_flush_cadence_ms: u64,

    /// How often the periodic flush task calls `flush_ready`.
    pub flush_check_interval_ms: u64,

    /// Maximum re-entrant `process_batch` calls per batch. `0` = unbounded.
    pub max_batch_iterations: u32,

    /// Maximum process tasks running at once across all streams.
    pub max_concurrent_process_tasks: usize,
}

impl Default for DestConfig {
    fn default() -> Self {
        Self {
            total_memory_bytes: 2 * 1024 * 1024 * 1024,
            queue_memory_ratio: 0.2,
            record_overhead_ratio: 1.1,
            bytes_per_spool_file: 200 * 1024 * 1024,
            spool_dir: None,
            spill_window_ms: 0,
            checkpoint_flush_cadence_ms: 15 * 60 * 1000,
            flush_check_interval_ms: 1000,
            max_batch_iterations: 1024,
            max_concurrent_process_tasks: 16,
        }
    }
}

impl DestConfig {
    /// Spill window as a `Duration`, `None` when disabled.
    #[must_use]
    pub fn spill_window(&self) -> Option<Duration> {
        (self.spill_window_ms > 0).then(|| Duration::from_millis(self.spill_window_ms))
    }

    /// Checkpoint flush cadence.
    #[must_use]
    pub fn checkpoint_flush_cadence(&self) -> Duration {
        Duration::from_millis(self.checkpoint_flush_cadence_ms)
    }

    /// Interval between periodic flush task firings.
    #[must_use]
    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_check_interval_ms)
    }

    /// Resolved spool directory.
    #[must_use]
    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("laminar-dest-spool"))
    }

    /// Validates field ranges.
    ///
    /// # Errors
    ///
    /// Returns `DestError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<(), DestError> {
        if !(self.queue_memory_ratio > 0.0 && self.queue_memory_ratio <= 1.0) {
            return Err(DestError::Config(format!(
                "queue_memory_ratio must be in (0, 1], got {}",
                self.queue_memory_ratio
            )));
        }
        if !(self.record_overhead_ratio >= 1.0 && self.record_overhead_ratio.is_finite()) {
            return Err(DestError::Config(format!(
                "record_overhead_ratio must be >= 1.0, got {}",
                self.record_overhead_ratio
            )));
        }
        if self.total_memory_bytes == 0 {
            return Err(DestError::Config("total_memory_bytes must be > 0".into()));
        }
        if self.bytes_per_spool_file == 0 {
            return Err(DestError::Config("bytes_per_spool_file must be > 0".into()));
        }
        if self.flush_check_interval_ms == 0 {
            return Err(DestError::Config(
                "flush_check_interval_ms must be > 0".into(),
            ));
        }
        if self.checkpoint_flush_cadence_ms < self.flush_check_interval_ms {
            return Err(DestError::Config(format!(
                "checkpoint_flush_cadence_ms ({}) must be >= flush_check_interval_ms ({})",
                self.checkpoint_flush_cadence_ms, self.flush_check_interval_ms
            )));
        }
        if self.max_concurrent_process_tasks == 0 {
            return Err(DestError::Config(
                "max_concurrent_process_tasks must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        DestConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let cfg: DestConfig =
            serde_json::from_str(r#"{"bytes_per_spool_file": 4096, "spill_window_ms": 50}"#)
                .unwrap();
        assert_eq!(cfg.bytes_per_spool_file, 4096);
        assert_eq!(cfg.spill_window(), Some(Duration::from_millis(50)));
        assert!((cfg.queue_memory_ratio - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let cfg = DestConfig {
            record_overhead_ratio: 0.5,
            ..DestConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("record_overhead_ratio"));

        let cfg = DestConfig {
            queue_memory_ratio: 0.0,
            ..DestConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cadence_must_cover_check_interval() {
        let cfg = DestConfig {
            checkpoint_flush_cadence_ms: 10,
            flush_check_interval_ms: 100,
            ..DestConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_spill_window_disabled_by_default() {
        assert_eq!(DestConfig::default().spill_window(), None);
    }
}
