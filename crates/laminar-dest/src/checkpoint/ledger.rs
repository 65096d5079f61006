//! In-flight record accounting per checkpoint.
//!
//! Each stream has a FIFO of *windows*. A window collects the records
//! admitted between two checkpoints and is identified by a token. When a
//! checkpoint arrives it claims the current window of each stream it covers;
//! later records open a fresh window. Persisted counts drain windows oldest
//! first, and a checkpoint becomes emittable once every window up to and
//! including the ones it claimed has drained to zero.
//!
//! ```text
//!  stream s:  [t1: 10 admitted, 0 left] [t2: 4 admitted, 3 left] [t3: open]
//!                   ▲ ckpt #1 ready          ▲ ckpt #2 waiting
//! ```
//!
//! Emission order is arrival order per stream (stream scope) or globally
//! (global scope).

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use super::{CheckpointId, CheckpointKind, CheckpointRecord, CheckpointScope};
use crate::batch::IndexRange;
use crate::error::DestError;
use crate::stream::StreamKey;

#[derive(Debug)]
struct Window {
    token: u64,
    admitted: u64,
    remaining: u64,
    claimed: bool,
}

#[derive(Debug)]
struct Pending {
    record: CheckpointRecord,
    components: Vec<(StreamKey, u64)>,
}

#[derive(Debug, Default)]
struct LedgerState {
    scope: Option<CheckpointScope>,
    next_token: u64,
    next_id: u64,
    windows: HashMap<StreamKey, VecDeque<Window>>,
    next_expected: HashMap<StreamKey, u64>,
    pending: VecDeque<Pending>,
    emitted: u64,
}

impl LedgerState {
    fn windows_mut(&mut self, stream: &StreamKey) -> Result<&mut VecDeque<Window>, DestError> {
        self.windows
            .get_mut(stream)
            .ok_or_else(|| DestError::UnknownStream(stream.clone()))
    }

    fn current_window(&mut self, stream: &StreamKey) -> Result<&mut Window, DestError> {
        let token = self.next_token;
        let windows = self
            .windows
            .get_mut(stream)
            .ok_or_else(|| DestError::UnknownStream(stream.clone()))?;
        let reuse = windows.back().is_some_and(|w| !w.claimed);
        if !reuse {
            windows.push_back(Window {
                token,
                admitted: 0,
                remaining: 0,
                claimed: false,
            });
            self.next_token += 1;
        }
        windows
            .back_mut()
            .ok_or_else(|| DestError::Invariant(format!("no open window for stream {stream}")))
    }

    fn drained_through(&self, stream: &StreamKey, token: u64) -> bool {
        self.windows.get(stream).is_some_and(|windows| {
            windows
                .iter()
                .take_while(|w| w.token <= token)
                .all(|w| w.remaining == 0)
        })
    }

    /// Removes windows up to `token`, returning their admitted total.
    fn retire_through(&mut self, stream: &StreamKey, token: u64) -> u64 {
        let Some(windows) = self.windows.get_mut(stream) else {
            return 0;
        };
        let mut admitted = 0;
        while windows.front().is_some_and(|w| w.token <= token) {
            if let Some(w) = windows.pop_front() {
                admitted += w.admitted;
            }
        }
        admitted
    }
}

/// Tracks in-flight records per checkpoint and emits checkpoints once safe.
///
/// Internally synchronized: `record_admitted`, `track_checkpoint`,
/// `notify_persisted` and `flush_ready` may be called from different tasks.
#[derive(Debug)]
pub struct CheckpointLedger {
    streams: Vec<StreamKey>,
    state: Mutex<LedgerState>,
    // Serializes collect-and-emit so concurrent flushes cannot reorder output.
    flush_lock: Mutex<()>,
}

impl CheckpointLedger {
    /// Ledger for the declared streams of one run.
    #[must_use]
    pub fn new(streams: impl IntoIterator<Item = StreamKey>) -> Self {
        let streams: Vec<StreamKey> = streams.into_iter().collect();
        let state = LedgerState {
            next_token: 1,
            next_id: 1,
            windows: streams
                .iter()
                .map(|s| (s.clone(), VecDeque::new()))
                .collect(),
            next_expected: streams.iter().map(|s| (s.clone(), 0)).collect(),
            ..LedgerState::default()
        };
        Self {
            streams,
            state: Mutex::new(state),
            flush_lock: Mutex::new(()),
        }
    }

    /// Declared streams.
    #[must_use]
    pub fn streams(&self) -> &[StreamKey] {
        &self.streams
    }

    /// Token of the stream's current window.
    ///
    /// Returns the same token until a checkpoint claims it.
    ///
    /// # Errors
    ///
    /// Returns `DestError::UnknownStream` for undeclared streams.
    pub fn issue_token(&self, stream: &StreamKey) -> Result<u64, DestError> {
        Ok(self.state.lock().current_window(stream)?.token)
    }

    /// Counts one admitted record against the stream's current window.
    ///
    /// # Errors
    ///
    /// Returns `DestError::UnknownStream` for undeclared streams.
    pub fn record_admitted(&self, stream: &StreamKey) -> Result<u64, DestError> {
        let mut state = self.state.lock();
        let window = state.current_window(stream)?;
        window.admitted += 1;
        window.remaining += 1;
        Ok(window.token)
    }

    /// Starts tracking a checkpoint, claiming the current window of every
    /// stream it covers.
    ///
    /// # Errors
    ///
    /// - `DestError::ScopeConflict` if the run already saw the other scope.
    /// - `DestError::UnknownStream` if a covered stream is not declared.
    pub fn track_checkpoint(
        &self,
        mut record: CheckpointRecord,
        declared_source_count: Option<u64>,
    ) -> Result<CheckpointId, DestError> {
        let mut state = self.state.lock();

        let incoming = record.scope();
        match state.scope {
            Some(existing) if existing != incoming => {
                return Err(DestError::ScopeConflict {
                    existing: existing.as_str(),
                    incoming: incoming.as_str(),
                });
            }
            _ => {}
        }

        let covered: Vec<StreamKey> = match &record.kind {
            CheckpointKind::Stream { stream } => vec![stream.clone()],
            CheckpointKind::Global { streams } if streams.is_empty() => self.streams.clone(),
            CheckpointKind::Global { streams } => streams.clone(),
        };
        if let Some(unknown) = covered.iter().find(|s| !state.windows.contains_key(*s)) {
            return Err(DestError::UnknownStream(unknown.clone()));
        }
        state.scope = Some(incoming);

        let mut components = Vec::with_capacity(covered.len());
        for stream in covered {
            let window = state.current_window(&stream)?;
            window.claimed = true;
            components.push((stream, window.token));
        }

        let id = CheckpointId(state.next_id);
        state.next_id += 1;
        record.id = Some(id);
        if declared_source_count.is_some() {
            record.source_record_count = declared_source_count;
        }

        tracing::debug!(
            checkpoint = %id,
            scope = %incoming,
            streams = components.len(),
            "Tracking checkpoint"
        );
        state.pending.push_back(Pending { record, components });
        Ok(id)
    }

    /// Drains `count` persisted records from the stream's oldest windows.
    ///
    /// # Errors
    ///
    /// - `DestError::CountUnderflow` if `count` exceeds the records in flight.
    /// - `DestError::UnknownStream` for undeclared streams.
    pub fn notify_persisted(&self, stream: &StreamKey, count: u64) -> Result<(), DestError> {
        let mut state = self.state.lock();
        let windows = state.windows_mut(stream)?;
        let outstanding: u64 = windows.iter().map(|w| w.remaining).sum();
        if count > outstanding {
            return Err(DestError::CountUnderflow {
                stream: stream.clone(),
                persisted: count,
                outstanding,
            });
        }
        let mut left = count;
        for window in windows.iter_mut() {
            if left == 0 {
                break;
            }
            let take = left.min(window.remaining);
            window.remaining -= take;
            left -= take;
        }
        Ok(())
    }

    /// Drains a persisted range, which must start right after the previous
    /// one for the stream (the first at index 0).
    ///
    /// # Errors
    ///
    /// - `DestError::NonContiguousRange` if `range` does not chain.
    /// - Any error from [`notify_persisted`](Self::notify_persisted).
    pub fn notify_persisted_range(
        &self,
        stream: &StreamKey,
        range: IndexRange,
    ) -> Result<(), DestError> {
        {
            let mut state = self.state.lock();
            let expected = state
                .next_expected
                .get_mut(stream)
                .ok_or_else(|| DestError::UnknownStream(stream.clone()))?;
            if range.first() != *expected {
                return Err(DestError::NonContiguousRange {
                    stream: stream.clone(),
                    expected: *expected,
                    actual: range.first(),
                });
            }
            *expected = range.last() + 1;
        }
        self.notify_persisted(stream, range.len())
    }

    /// Emits every checkpoint that has become safe, in arrival order.
    ///
    /// A not-yet-drained checkpoint holds back later checkpoints on the same
    /// stream (stream scope) or all later checkpoints (global scope).
    /// `emit` is invoked outside the state lock. Returns the number emitted.
    pub fn flush_ready(&self, mut emit: impl FnMut(CheckpointRecord)) -> usize {
        let _flush = self.flush_lock.lock();
        let ready = self.collect_ready();
        let n = ready.len();
        for record in ready {
            emit(record);
        }
        n
    }

    fn collect_ready(&self) -> Vec<CheckpointRecord> {
        let mut state = self.state.lock();
        let mut ready = Vec::new();
        let mut blocked: HashSet<StreamKey> = HashSet::new();
        let mut stalled = false;
        let pending = std::mem::take(&mut state.pending);
        let mut kept = VecDeque::with_capacity(pending.len());

        for entry in pending {
            let is_global = entry.record.scope() == CheckpointScope::Global;
            let drained = !stalled
                && entry
                    .components
                    .iter()
                    .all(|(s, t)| !blocked.contains(s) && state.drained_through(s, *t));
            if !drained {
                if is_global {
                    stalled = true;
                } else {
                    blocked.extend(entry.components.iter().map(|(s, _)| s.clone()));
                }
                kept.push_back(entry);
                continue;
            }

            let Pending {
                mut record,
                components,
            } = entry;
            let count: u64 = components
                .iter()
                .map(|(s, t)| state.retire_through(s, *t))
                .sum();
            record.destination_record_count = Some(count);
            if let Some(source) = record.source_record_count {
                if source != count {
                    tracing::warn!(
                        checkpoint = ?record.id,
                        source_records = source,
                        destination_records = count,
                        "Checkpoint record count mismatch between source and destination"
                    );
                }
            }
            tracing::debug!(checkpoint = ?record.id, records = count, "Checkpoint ready");
            ready.push(record);
        }

        state.pending = kept;
        state.emitted += ready.len() as u64;
        ready
    }

    /// Checkpoints emitted so far.
    #[must_use]
    pub fn emitted_count(&self) -> u64 {
        self.state.lock().emitted
    }

    /// Checkpoints tracked but not yet emitted.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Records admitted on `stream` and not yet persisted.
    #[must_use]
    pub fn outstanding(&self, stream: &StreamKey) -> u64 {
        self.state
            .lock()
            .windows
            .get(stream)
            .map_or(0, |w| w.iter().map(|w| w.remaining).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn s(name: &str) -> StreamKey {
        StreamKey::new(name)
    }

    fn admit(ledger: &CheckpointLedger, stream: &StreamKey, n: u64) {
        for _ in 0..n {
            ledger.record_admitted(stream).unwrap();
        }
    }

    fn flush(ledger: &CheckpointLedger) -> Vec<CheckpointRecord> {
        let mut out = Vec::new();
        ledger.flush_ready(|r| out.push(r));
        out
    }

    #[test]
    fn test_single_stream_checkpoint_emitted_after_drain() {
        let ledger = CheckpointLedger::new([s("a")]);
        admit(&ledger, &s("a"), 10);
        ledger
            .track_checkpoint(CheckpointRecord::stream(s("a"), json!({"pos": 10})), Some(10))
            .unwrap();

        assert!(flush(&ledger).is_empty());
        ledger.notify_persisted(&s("a"), 10).unwrap();

        let out = flush(&ledger);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination_record_count, Some(10));
        assert_eq!(out[0].source_record_count, Some(10));
        assert_eq!(out[0].payload, json!({"pos": 10}));
        assert_eq!(out[0].id, Some(CheckpointId(1)));
        assert!(flush(&ledger).is_empty());
        assert_eq!(ledger.emitted_count(), 1);
    }

    #[test]
    fn test_global_waits_for_every_stream() {
        let ledger = CheckpointLedger::new([s("a"), s("b")]);
        admit(&ledger, &s("a"), 10);
        admit(&ledger, &s("b"), 10);
        ledger
            .track_checkpoint(CheckpointRecord::global(vec![s("a"), s("b")], json!(1)), None)
            .unwrap();

        ledger.notify_persisted(&s("a"), 10).unwrap();
        assert!(flush(&ledger).is_empty());

        ledger.notify_persisted(&s("b"), 10).unwrap();
        let out = flush(&ledger);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination_record_count, Some(20));
    }

    #[test]
    fn test_empty_checkpoint_emitted_immediately() {
        let ledger = CheckpointLedger::new([s("a")]);
        ledger
            .track_checkpoint(CheckpointRecord::stream(s("a"), json!(null)), None)
            .unwrap();
        let out = flush(&ledger);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination_record_count, Some(0));
    }

    #[test]
    fn test_mixed_scopes_rejected() {
        let ledger = CheckpointLedger::new([s("a")]);
        ledger
            .track_checkpoint(CheckpointRecord::global(vec![], json!(null)), None)
            .unwrap();
        let err = ledger
            .track_checkpoint(CheckpointRecord::stream(s("a"), json!(null)), None)
            .unwrap_err();
        assert!(matches!(
            err,
            DestError::ScopeConflict {
                existing: "global",
                incoming: "stream"
            }
        ));
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_stream_checkpoints_flush_in_arrival_order() {
        let ledger = CheckpointLedger::new([s("a"), s("b")]);
        admit(&ledger, &s("a"), 5);
        ledger
            .track_checkpoint(CheckpointRecord::stream(s("a"), json!("a1")), None)
            .unwrap();
        ledger
            .track_checkpoint(CheckpointRecord::stream(s("a"), json!("a2")), None)
            .unwrap();
        admit(&ledger, &s("b"), 1);
        ledger
            .track_checkpoint(CheckpointRecord::stream(s("b"), json!("b1")), None)
            .unwrap();

        // a2 covers no records of its own but must wait for a1.
        ledger.notify_persisted(&s("b"), 1).unwrap();
        let out = flush(&ledger);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, json!("b1"));

        ledger.notify_persisted(&s("a"), 5).unwrap();
        let payloads: Vec<_> = flush(&ledger).into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![json!("a1"), json!("a2")]);
    }

    #[test]
    fn test_global_checkpoints_flush_in_arrival_order() {
        let ledger = CheckpointLedger::new([s("a"), s("b")]);
        admit(&ledger, &s("a"), 3);
        ledger
            .track_checkpoint(CheckpointRecord::global(vec![s("a")], json!(1)), None)
            .unwrap();
        admit(&ledger, &s("b"), 2);
        ledger
            .track_checkpoint(CheckpointRecord::global(vec![s("b")], json!(2)), None)
            .unwrap();

        ledger.notify_persisted(&s("b"), 2).unwrap();
        assert!(flush(&ledger).is_empty(), "second must wait for the first");

        ledger.notify_persisted(&s("a"), 3).unwrap();
        let counts: Vec<_> = flush(&ledger)
            .into_iter()
            .map(|r| r.destination_record_count)
            .collect();
        assert_eq!(counts, vec![Some(3), Some(2)]);
    }

    #[test]
    fn test_decrement_spans_windows_fifo() {
        let ledger = CheckpointLedger::new([s("a")]);
        admit(&ledger, &s("a"), 4);
        ledger
            .track_checkpoint(CheckpointRecord::stream(s("a"), json!(1)), None)
            .unwrap();
        admit(&ledger, &s("a"), 6);
        ledger
            .track_checkpoint(CheckpointRecord::stream(s("a"), json!(2)), None)
            .unwrap();

        ledger.notify_persisted(&s("a"), 7).unwrap();
        let out = flush(&ledger);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination_record_count, Some(4));
        assert_eq!(ledger.outstanding(&s("a")), 3);

        ledger.notify_persisted(&s("a"), 3).unwrap();
        let out = flush(&ledger);
        assert_eq!(out[0].destination_record_count, Some(6));
    }

    #[test]
    fn test_conservation_of_counts() {
        let ledger = CheckpointLedger::new([s("a")]);
        let mut admitted = 0;
        for batch in [3u64, 0, 7, 1, 12] {
            admit(&ledger, &s("a"), batch);
            admitted += batch;
            ledger
                .track_checkpoint(CheckpointRecord::stream(s("a"), json!(batch)), None)
                .unwrap();
        }
        ledger.notify_persisted(&s("a"), admitted).unwrap();
        let total: u64 = flush(&ledger)
            .iter()
            .filter_map(|r| r.destination_record_count)
            .sum();
        assert_eq!(total, admitted);
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn test_issue_token_idempotent_until_claimed() {
        let ledger = CheckpointLedger::new([s("a")]);
        let t1 = ledger.issue_token(&s("a")).unwrap();
        assert_eq!(ledger.issue_token(&s("a")).unwrap(), t1);
        assert_eq!(ledger.record_admitted(&s("a")).unwrap(), t1);

        ledger
            .track_checkpoint(CheckpointRecord::stream(s("a"), json!(null)), None)
            .unwrap();
        let t2 = ledger.issue_token(&s("a")).unwrap();
        assert_ne!(t1, t2);
        assert_eq!(ledger.issue_token(&s("a")).unwrap(), t2);
    }

    #[test]
    fn test_persisting_more_than_outstanding_is_fatal() {
        let ledger = CheckpointLedger::new([s("a")]);
        admit(&ledger, &s("a"), 2);
        let err = ledger.notify_persisted(&s("a"), 3).unwrap_err();
        assert!(matches!(
            err,
            DestError::CountUnderflow {
                persisted: 3,
                outstanding: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_non_contiguous_range_is_fatal() {
        let ledger = CheckpointLedger::new([s("a")]);
        admit(&ledger, &s("a"), 20);
        ledger
            .notify_persisted_range(&s("a"), IndexRange::new(0, 9))
            .unwrap();
        let err = ledger
            .notify_persisted_range(&s("a"), IndexRange::new(11, 19))
            .unwrap_err();
        assert!(matches!(
            err,
            DestError::NonContiguousRange {
                expected: 10,
                actual: 11,
                ..
            }
        ));
        let err = ledger
            .notify_persisted_range(&s("a"), IndexRange::new(1, 5))
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_first_range_must_start_at_zero() {
        let ledger = CheckpointLedger::new([s("a")]);
        admit(&ledger, &s("a"), 5);
        assert!(ledger
            .notify_persisted_range(&s("a"), IndexRange::new(1, 4))
            .is_err());
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let ledger = CheckpointLedger::new([s("a")]);
        assert!(matches!(
            ledger.record_admitted(&s("zzz")),
            Err(DestError::UnknownStream(_))
        ));
        assert!(ledger
            .track_checkpoint(CheckpointRecord::stream(s("zzz"), json!(null)), None)
            .is_err());
    }

    #[test]
    fn test_concurrent_persist_and_flush() {
        use std::sync::Arc;

        let ledger = Arc::new(CheckpointLedger::new([s("a"), s("b")]));
        for stream in [s("a"), s("b")] {
            for i in 0..50u64 {
                admit(&ledger, &stream, 2);
                ledger
                    .track_checkpoint(CheckpointRecord::stream(stream.clone(), json!(i)), None)
                    .unwrap();
            }
        }

        let emitted = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = [s("a"), s("b")]
            .into_iter()
            .map(|stream| {
                let ledger = Arc::clone(&ledger);
                let emitted = Arc::clone(&emitted);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        ledger.notify_persisted(&stream, 2).unwrap();
                        ledger.flush_ready(|r| emitted.lock().push(r));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        ledger.flush_ready(|r| emitted.lock().push(r));

        let emitted = emitted.lock();
        assert_eq!(emitted.len(), 100);
        for stream in [s("a"), s("b")] {
            let order: Vec<u64> = emitted
                .iter()
                .filter(|r| r.kind == CheckpointKind::Stream { stream: stream.clone() })
                .filter_map(|r| r.payload.as_u64())
                .collect();
            assert_eq!(order, (0..50).collect::<Vec<_>>());
        }
    }
}
