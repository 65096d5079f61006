//! Batch lifecycle model.
//!
//! A [`Batch`] describes a unit of records at some stage of being written:
//!
//! ```text
//! Spooled ──► Local ──► Persisted ──► Complete
//!    (spill)   (destination-defined steps)
//! ```
//!
//! The orchestrator only inspects [`BatchState`] and the covered
//! [`IndexRange`]; what a destination keeps inside a batch (staged file
//! names, upload handles, ...) is an opaque payload.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DestError;
use crate::spool::SpoolFile;
use crate::stream::StreamKey;

/// Closed interval of per-stream record indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawIndexRange")]
pub struct IndexRange {
    first: u64,
    last: u64,
}

#[derive(Deserialize)]
struct RawIndexRange {
    first: u64,
    last: u64,
}

impl TryFrom<RawIndexRange> for IndexRange {
    type Error = DestError;

    fn try_from(raw: RawIndexRange) -> Result<Self, Self::Error> {
        Self::try_new(raw.first, raw.last)
    }
}

impl IndexRange {
    /// Range `[first, last]`.
    ///
    /// # Panics
    ///
    /// Panics if `first > last`.
    #[must_use]
    pub fn new(first: u64, last: u64) -> Self {
        assert!(first <= last, "invalid range [{first}, {last}]");
        Self { first, last }
    }

    /// Range `[first, last]`, rejecting an inverted pair.
    ///
    /// # Errors
    ///
    /// Returns `DestError::Invariant` if `first > last`.
    pub fn try_new(first: u64, last: u64) -> Result<Self, DestError> {
        if first > last {
            return Err(DestError::Invariant(format!(
                "invalid range [{first}, {last}]"
            )));
        }
        Ok(Self { first, last })
    }

    /// Range covering a single index.
    #[must_use]
    pub fn single(index: u64) -> Self {
        Self {
            first: index,
            last: index,
        }
    }

    /// Lower bound (inclusive).
    #[must_use]
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Upper bound (inclusive).
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Number of indices covered.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Always false; a range covers at least one index.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `self` starts exactly one past `prev`.
    #[must_use]
    pub fn chains_after(&self, prev: &IndexRange) -> bool {
        prev.last.checked_add(1) == Some(self.first)
    }

    /// Whether the two ranges share any index.
    #[must_use]
    pub fn overlaps(&self, other: &IndexRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    /// Grows the upper bound to include `index`.
    pub(crate) fn extend_to(&mut self, index: u64) {
        self.last = self.last.max(index);
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

/// Lifecycle stage of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BatchState {
    /// Records written to a local spool file.
    Spooled,
    /// Converted to the destination's native representation, not yet durable.
    Local,
    /// Durably written; records count towards checkpoint acknowledgement.
    Persisted,
    /// Fully finalized; nothing further will happen to the batch.
    Complete,
}

impl BatchState {
    /// `Persisted` or `Complete`: no further processing is required before
    /// the batch counts towards checkpoints.
    #[must_use]
    pub fn is_persisted(self) -> bool {
        matches!(self, Self::Persisted | Self::Complete)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spooled => write!(f, "Spooled"),
            Self::Local => write!(f, "Local"),
            Self::Persisted => write!(f, "Persisted"),
            Self::Complete => write!(f, "Complete"),
        }
    }
}

/// An immutable batch value.
///
/// Builder-style methods consume the batch and return a new one, so a
/// destination advances state with e.g. `batch.with_state(BatchState::Persisted)`.
#[derive(Clone)]
pub struct Batch {
    state: BatchState,
    covered_range: Option<IndexRange>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl Batch {
    /// Batch in `state` with no range and no payload.
    #[must_use]
    pub fn new(state: BatchState) -> Self {
        Self {
            state,
            covered_range: None,
            payload: None,
        }
    }

    /// Shorthand for a `Local` batch.
    #[must_use]
    pub fn local() -> Self {
        Self::new(BatchState::Local)
    }

    /// Shorthand for a `Persisted` batch.
    #[must_use]
    pub fn persisted() -> Self {
        Self::new(BatchState::Persisted)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Record indices this batch represents, if known.
    ///
    /// Destinations usually leave this unset; the orchestrator then carries
    /// over the range of the batch it handed to the destination.
    #[must_use]
    pub fn covered_range(&self) -> Option<IndexRange> {
        self.covered_range
    }

    /// Same batch in a new state.
    #[must_use]
    pub fn with_state(mut self, state: BatchState) -> Self {
        self.state = state;
        self
    }

    /// Same batch covering `range`.
    #[must_use]
    pub fn with_range(mut self, range: IndexRange) -> Self {
        self.covered_range = Some(range);
        self
    }

    /// Same batch carrying a destination-defined payload.
    #[must_use]
    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// The payload, if one of type `T` is attached.
    #[must_use]
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("state", &self.state)
            .field("covered_range", &self.covered_range)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// A batch in flight through the orchestrator, with the bookkeeping the
/// destination never sees.
#[derive(Debug)]
pub struct BatchEnvelope {
    /// Stream the batch belongs to.
    pub stream: StreamKey,
    /// Per-stream sequence number of the spool chunk that produced it.
    pub seq: u64,
    /// Current batch value.
    pub batch: Batch,
    /// Whether the chunk that produced this batch ended the stream.
    pub end_of_stream: bool,
    /// Processing calls made so far (records + batch).
    pub iterations: u32,
    spooled_range: IndexRange,
    pub(crate) spool: Option<SpoolFile>,
}

impl BatchEnvelope {
    pub(crate) fn spooled(stream: StreamKey, seq: u64, spool: SpoolFile, end_of_stream: bool) -> Self {
        let spooled_range = spool.range();
        let batch = Batch::new(BatchState::Spooled).with_range(spooled_range);
        Self {
            stream,
            seq,
            batch,
            end_of_stream,
            iterations: 0,
            spooled_range,
            spool: Some(spool),
        }
    }

    /// Range covered by the current batch.
    #[must_use]
    pub fn range(&self) -> Option<IndexRange> {
        self.batch.covered_range()
    }

    /// Records that were written to the spool file for this batch.
    #[must_use]
    pub fn spooled_range(&self) -> IndexRange {
        self.spooled_range
    }

    /// The range the destination reported, if it differs from
    /// [`spooled_range`](Self::spooled_range).
    #[must_use]
    pub fn misreported_range(&self) -> Option<IndexRange> {
        self.range().filter(|r| *r != self.spooled_range)
    }

    /// Replaces the batch with one returned by the destination, carrying
    /// over the previous range when the destination left it unset.
    pub(crate) fn advance(&mut self, next: Batch) {
        let next = match (next.covered_range(), self.batch.covered_range()) {
            (None, Some(prev)) => next.with_range(prev),
            _ => next,
        };
        self.batch = next;
        self.iterations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_len_and_chain() {
        let a = IndexRange::new(0, 9);
        let b = IndexRange::new(10, 14);
        assert_eq!(a.len(), 10);
        assert!(b.chains_after(&a));
        assert!(!a.chains_after(&b));
        assert!(!IndexRange::new(11, 12).chains_after(&a));
        assert_eq!(IndexRange::single(3).len(), 1);
    }

    #[test]
    fn test_range_overlap() {
        let a = IndexRange::new(5, 10);
        assert!(a.overlaps(&IndexRange::new(10, 12)));
        assert!(a.overlaps(&IndexRange::new(0, 5)));
        assert!(!a.overlaps(&IndexRange::new(11, 20)));
    }

    #[test]
    #[should_panic(expected = "invalid range")]
    fn test_inverted_range_panics() {
        let _ = IndexRange::new(3, 2);
    }

    #[test]
    fn test_try_new_rejects_inverted_range() {
        assert_eq!(IndexRange::try_new(2, 5).unwrap(), IndexRange::new(2, 5));
        let err = IndexRange::try_new(3, 2).unwrap_err();
        assert!(err.is_invariant_violation(), "{err}");
    }

    #[test]
    fn test_deserialize_validates_bounds() {
        let ok: IndexRange = serde_json::from_str(r#"{"first":1,"last":4}"#).unwrap();
        assert_eq!(ok.len(), 4);
        assert!(serde_json::from_str::<IndexRange>(r#"{"first":4,"last":1}"#).is_err());
    }

    #[test]
    fn test_state_ordering() {
        assert!(BatchState::Spooled < BatchState::Local);
        assert!(BatchState::Local < BatchState::Persisted);
        assert!(!BatchState::Local.is_persisted());
        assert!(BatchState::Persisted.is_persisted());
        assert!(BatchState::Complete.is_persisted());
    }

    #[test]
    fn test_payload_downcast() {
        #[derive(Debug, PartialEq)]
        struct Staged(&'static str);

        let batch = Batch::local().with_payload(Staged("s3://bucket/part-0"));
        assert_eq!(batch.payload::<Staged>(), Some(&Staged("s3://bucket/part-0")));
        assert!(batch.payload::<String>().is_none());

        let next = batch.clone().with_state(BatchState::Persisted);
        assert_eq!(next.state(), BatchState::Persisted);
        assert!(next.payload::<Staged>().is_some());
        assert_eq!(batch.state(), BatchState::Local);
    }
}
