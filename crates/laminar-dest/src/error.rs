//! Error types for the destination write core.

use crate::stream::StreamKey;

/// Errors raised by queues, the checkpoint ledger, the spool and the
/// task orchestrator.
///
/// Variants fall into three groups that the orchestrator treats differently:
/// invariant violations (always fatal for the whole run, see
/// [`DestError::is_invariant_violation`]), destination/I/O failures (scoped to
/// the stream whose task raised them) and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum DestError {
    /// A persisted range did not chain from the previous one for its stream.
    #[error("non-contiguous range for stream {stream}: expected lower bound {expected}, got {actual}")]
    NonContiguousRange {
        /// Stream whose ranges broke.
        stream: StreamKey,
        /// Lower bound that would have chained.
        expected: u64,
        /// Lower bound that was observed.
        actual: u64,
    },

    /// A persisted range overlapped records already persisted or pending.
    #[error("overlapping range [{first}, {last}] for stream {stream}")]
    OverlappingRange {
        /// Stream whose ranges overlapped.
        stream: StreamKey,
        /// First index of the offending range.
        first: u64,
        /// Last index of the offending range.
        last: u64,
    },

    /// A persisted count would drive outstanding record counts below zero.
    #[error("persisted count {persisted} for stream {stream} exceeds {outstanding} outstanding records")]
    CountUnderflow {
        /// Stream being decremented.
        stream: StreamKey,
        /// Records reported as persisted.
        persisted: u64,
        /// Records still outstanding across all open tokens.
        outstanding: u64,
    },

    /// Global and per-stream checkpoints were mixed within one run.
    #[error("checkpoint scope conflict: run already uses {existing} checkpoints, got {incoming}")]
    ScopeConflict {
        /// Scope first seen in this run.
        existing: &'static str,
        /// Scope of the rejected checkpoint.
        incoming: &'static str,
    },

    /// `send` on a queue that has been closed.
    #[error("queue for stream {0} is closed")]
    QueueClosed(StreamKey),

    /// More bytes were released than are currently held.
    #[error("memory budget release of {released} bytes exceeds {held} bytes held")]
    ReleaseUnderflow {
        /// Bytes being released.
        released: u64,
        /// Bytes held at the time.
        held: u64,
    },

    /// A single reservation can never fit under the budget ceiling.
    #[error("reservation of {requested} bytes exceeds budget ceiling of {max} bytes")]
    ReservationTooLarge {
        /// Bytes requested.
        requested: u64,
        /// Fixed ceiling.
        max: u64,
    },

    /// A stream was referenced that was not declared for this run.
    #[error("stream {0} is not declared in this sync")]
    UnknownStream(StreamKey),

    /// Catch-all invariant violation.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Failure reported by the destination record processor or hooks.
    #[error("destination error: {0}")]
    Destination(String),

    /// The destination kept returning non-terminal batches.
    #[error("batch for stream {stream} not persisted after {iterations} processing iterations")]
    BatchIterationLimit {
        /// Stream whose batch looped.
        stream: StreamKey,
        /// Iterations performed.
        iterations: u32,
    },

    /// Spool file I/O error.
    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record payload (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration validation error.
    #[error("config error: {0}")]
    Config(String),

    /// A task panicked or its join handle failed.
    #[error("task failed: {0}")]
    TaskJoin(String),

    /// The operation was cancelled because the stream or run failed.
    #[error("cancelled")]
    Cancelled,
}

impl DestError {
    /// Shorthand for a destination-side failure.
    #[must_use]
    pub fn destination(msg: impl Into<String>) -> Self {
        Self::Destination(msg.into())
    }

    /// Whether this error signals a programming error in range or count
    /// accounting. These abort the whole run and are never retried.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::NonContiguousRange { .. }
                | Self::OverlappingRange { .. }
                | Self::CountUnderflow { .. }
                | Self::ScopeConflict { .. }
                | Self::QueueClosed(_)
                | Self::ReleaseUnderflow { .. }
                | Self::UnknownStream(_)
                | Self::Invariant(_)
        )
    }
}

impl From<tokio::task::JoinError> for DestError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::TaskJoin(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_classification() {
        let stream = StreamKey::new("orders");
        assert!(DestError::QueueClosed(stream.clone()).is_invariant_violation());
        assert!(DestError::NonContiguousRange {
            stream,
            expected: 10,
            actual: 12,
        }
        .is_invariant_violation());
        assert!(!DestError::destination("copy failed").is_invariant_violation());
        assert!(!DestError::Cancelled.is_invariant_violation());
    }

    #[test]
    fn test_display_includes_stream() {
        let err = DestError::CountUnderflow {
            stream: StreamKey::with_namespace("public", "users"),
            persisted: 5,
            outstanding: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("public.users"), "{msg}");
        assert!(msg.contains("exceeds 3"), "{msg}");
    }
}
