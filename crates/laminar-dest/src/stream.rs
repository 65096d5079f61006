//! Stream identifiers and the records that flow through stream queues.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a logical stream within a sync.
///
/// Streams are independently ordered sequences of records. The key is used
/// as a map key by the queues, the checkpoint ledger and the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    /// Optional namespace (schema, dataset, ...).
    pub namespace: Option<String>,
    /// Stream name.
    pub name: String,
}

impl StreamKey {
    /// Stream without a namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Stream qualified by a namespace.
    #[must_use]
    pub fn with_namespace(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl From<&str> for StreamKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A record tagged with its stream and per-stream sequence index.
#[derive(Debug, Clone, PartialEq)]
pub struct WrappedRecord {
    /// Stream the record belongs to.
    pub stream: StreamKey,
    /// Strictly increasing per stream, starting at 0.
    pub index: u64,
    /// Serialized size as reported by the router.
    pub size_bytes: u64,
    /// Record body.
    pub payload: serde_json::Value,
}

/// An entry popped from a stream queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    /// A data record.
    Record(WrappedRecord),
    /// Terminal marker. `final_index` is the number of records published
    /// to the stream, i.e. one past the last record index.
    EndOfStream {
        /// Stream that ended.
        stream: StreamKey,
        /// One past the last published index.
        final_index: u64,
    },
}

impl QueueMessage {
    /// Bytes this entry counts against a chunk budget.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Record(r) => r.size_bytes,
            Self::EndOfStream { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(StreamKey::new("users").to_string(), "users");
        assert_eq!(
            StreamKey::with_namespace("public", "users").to_string(),
            "public.users"
        );
    }

    #[test]
    fn test_namespace_distinguishes_keys() {
        let a = StreamKey::with_namespace("a", "users");
        let b = StreamKey::with_namespace("b", "users");
        assert_ne!(a, b);
        assert_ne!(a, StreamKey::new("users"));
    }

    #[test]
    fn test_end_of_stream_has_no_size() {
        let eos = QueueMessage::EndOfStream {
            stream: "s".into(),
            final_index: 7,
        };
        assert_eq!(eos.size_bytes(), 0);
    }
}
