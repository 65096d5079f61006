//! Per-stream reordering of persisted ranges.

use std::collections::BTreeMap;

use crate::batch::IndexRange;
use crate::error::DestError;
use crate::stream::StreamKey;

/// Buffers persisted ranges that arrive ahead of their predecessors and
/// releases them as one contiguous range once the gap closes.
///
/// Ranges must never overlap each other or anything already released.
#[derive(Debug)]
pub struct RangeTracker {
    stream: StreamKey,
    next_expected: u64,
    pending: BTreeMap<u64, IndexRange>,
}

impl RangeTracker {
    /// Tracker expecting index 0 first.
    #[must_use]
    pub fn new(stream: StreamKey) -> Self {
        Self {
            stream,
            next_expected: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Lowest index not yet released.
    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Whether no out-of-order ranges are buffered.
    #[must_use]
    pub fn is_caught_up(&self) -> bool {
        self.pending.is_empty()
    }

    /// Records a persisted range.
    ///
    /// Returns the contiguous run that became releasable, if any.
    ///
    /// # Errors
    ///
    /// Returns `DestError::OverlappingRange` if `range` overlaps a released
    /// or buffered range.
    pub fn insert(&mut self, range: IndexRange) -> Result<Option<IndexRange>, DestError> {
        let overlaps_buffered = self
            .pending
            .range(..=range.first())
            .next_back()
            .is_some_and(|(_, r)| r.overlaps(&range))
            || self
                .pending
                .range(range.first()..)
                .next()
                .is_some_and(|(_, r)| r.overlaps(&range));
        if range.first() < self.next_expected || overlaps_buffered {
            return Err(DestError::OverlappingRange {
                stream: self.stream.clone(),
                first: range.first(),
                last: range.last(),
            });
        }
        self.pending.insert(range.first(), range);

        let mut released: Option<IndexRange> = None;
        while let Some(next) = self.pending.remove(&self.next_expected) {
            released = Some(match released {
                Some(run) => IndexRange::new(run.first(), next.last()),
                None => next,
            });
            self.next_expected = next.last() + 1;
        }
        if released.is_none() {
            tracing::debug!(
                stream = %self.stream,
                range = %range,
                next_expected = self.next_expected,
                "Buffered out-of-order persisted range"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RangeTracker {
        RangeTracker::new(StreamKey::new("s"))
    }

    #[test]
    fn test_in_order_passes_through() {
        let mut t = tracker();
        assert_eq!(
            t.insert(IndexRange::new(0, 9)).unwrap(),
            Some(IndexRange::new(0, 9))
        );
        assert_eq!(
            t.insert(IndexRange::new(10, 10)).unwrap(),
            Some(IndexRange::new(10, 10))
        );
        assert_eq!(t.next_expected(), 11);
        assert!(t.is_caught_up());
    }

    #[test]
    fn test_out_of_order_released_merged() {
        let mut t = tracker();
        assert_eq!(t.insert(IndexRange::new(20, 29)).unwrap(), None);
        assert_eq!(t.insert(IndexRange::new(10, 19)).unwrap(), None);
        assert!(!t.is_caught_up());
        assert_eq!(
            t.insert(IndexRange::new(0, 9)).unwrap(),
            Some(IndexRange::new(0, 29))
        );
        assert!(t.is_caught_up());
        assert_eq!(t.next_expected(), 30);
    }

    #[test]
    fn test_partial_release_keeps_later_gap() {
        let mut t = tracker();
        assert_eq!(t.insert(IndexRange::new(5, 5)).unwrap(), None);
        assert_eq!(t.insert(IndexRange::new(8, 9)).unwrap(), None);
        assert_eq!(
            t.insert(IndexRange::new(0, 4)).unwrap(),
            Some(IndexRange::new(0, 5))
        );
        assert!(!t.is_caught_up());
        assert_eq!(
            t.insert(IndexRange::new(6, 7)).unwrap(),
            Some(IndexRange::new(6, 9))
        );
    }

    #[test]
    fn test_overlap_with_released_is_fatal() {
        let mut t = tracker();
        t.insert(IndexRange::new(0, 9)).unwrap();
        let err = t.insert(IndexRange::new(9, 12)).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_overlap_with_buffered_is_fatal() {
        let mut t = tracker();
        t.insert(IndexRange::new(10, 19)).unwrap();
        assert!(t.insert(IndexRange::new(15, 25)).is_err());
        assert!(t.insert(IndexRange::new(5, 10)).is_err());
        assert!(t.insert(IndexRange::new(10, 10)).is_err());
    }
}
