//! Checkpoint accounting.
//!
//! A checkpoint may only be acknowledged upstream once every record that
//! preceded it on its stream(s) has been durably persisted. The
//! [`CheckpointLedger`] tracks how many of those records are still in flight
//! and releases checkpoints in arrival order as their counts drain. The
//! [`RangeTracker`] sits in front of it, turning out-of-order persisted
//! batches into a contiguous sequence of ranges per stream.

pub mod ledger;
pub mod range;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stream::StreamKey;

pub use ledger::CheckpointLedger;
pub use range::RangeTracker;

/// Checkpoint granularity. A run uses exactly one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointScope {
    /// Checkpoints cover a single stream.
    Stream,
    /// Checkpoints cover a set of streams at once.
    Global,
}

impl CheckpointScope {
    /// Lowercase name used in logs and errors.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for CheckpointScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier assigned by the ledger in arrival order, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub u64);

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a checkpoint covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum CheckpointKind {
    /// One stream.
    Stream {
        /// Stream covered.
        stream: StreamKey,
    },
    /// Several streams. An empty list covers every declared stream.
    Global {
        /// Streams covered.
        streams: Vec<StreamKey>,
    },
}

impl CheckpointKind {
    /// Scope of this kind.
    #[must_use]
    pub fn scope(&self) -> CheckpointScope {
        match self {
            Self::Stream { .. } => CheckpointScope::Stream,
            Self::Global { .. } => CheckpointScope::Global,
        }
    }
}

/// A source checkpoint travelling through the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Assigned when the ledger starts tracking the checkpoint.
    pub id: Option<CheckpointId>,
    /// Covered stream(s).
    pub kind: CheckpointKind,
    /// Opaque source state, returned unchanged on emission.
    pub payload: serde_json::Value,
    /// Records the source says it emitted before this checkpoint.
    pub source_record_count: Option<u64>,
    /// Records persisted for this checkpoint; set on emission.
    pub destination_record_count: Option<u64>,
}

impl CheckpointRecord {
    /// Stream-scoped checkpoint.
    #[must_use]
    pub fn stream(stream: StreamKey, payload: serde_json::Value) -> Self {
        Self::with_kind(CheckpointKind::Stream { stream }, payload)
    }

    /// Global checkpoint over `streams` (empty = all declared streams).
    #[must_use]
    pub fn global(streams: Vec<StreamKey>, payload: serde_json::Value) -> Self {
        Self::with_kind(CheckpointKind::Global { streams }, payload)
    }

    fn with_kind(kind: CheckpointKind, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            kind,
            payload,
            source_record_count: None,
            destination_record_count: None,
        }
    }

    /// Scope of the checkpoint.
    #[must_use]
    pub fn scope(&self) -> CheckpointScope {
        self.kind.scope()
    }

    /// Attaches the source's record count.
    #[must_use]
    pub fn with_source_record_count(mut self, count: u64) -> Self {
        self.source_record_count = Some(count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_serializes_with_scope_tag() {
        let record = CheckpointRecord::stream(StreamKey::new("users"), json!({"lsn": 42}));
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["kind"]["scope"], "stream");
        assert_eq!(v["kind"]["stream"]["name"], "users");
        assert_eq!(v["payload"]["lsn"], 42);

        let back: CheckpointRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_scope() {
        assert_eq!(
            CheckpointRecord::global(vec![], json!(null)).scope(),
            CheckpointScope::Global
        );
        assert_eq!(CheckpointScope::Stream.to_string(), "stream");
    }
}
