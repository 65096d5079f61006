//! Byte-accounted per-stream record queue.
//!
//! Capacity is unbounded in entries; admission is bounded by the shared
//! [`MemoryBudget`]. Each record reserves `ceil(size_bytes × overhead_ratio)`
//! bytes before it is pushed, and the reservation travels with the record
//! into the [`Chunk`] that pops it. The spill task releases the chunk's
//! memory only after the chunk has been durably written to disk.
//!
//! A partially filled chunk is cut early when any of these hold:
//! - a publisher is blocked on the memory budget,
//! - [`StreamQueue::request_flush`] was called,
//! - the optional spill window elapsed since the chunk's first record.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::batch::IndexRange;
use crate::error::DestError;
use crate::memory::{MemoryBudget, MemoryReservation};
use crate::stream::{QueueMessage, StreamKey, WrappedRecord};

struct Entry {
    message: QueueMessage,
    reservation: Option<MemoryReservation>,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    queued_bytes: u64,
    end_sent: bool,
    closed: bool,
    aborted: bool,
    flush_requested: bool,
}

/// Records popped from a [`StreamQueue`] in one `receive_chunk` call.
#[derive(Debug)]
pub struct Chunk {
    /// Stream the records belong to.
    pub stream: StreamKey,
    /// Records in index order.
    pub records: Vec<WrappedRecord>,
    /// Sum of the records' `size_bytes`.
    pub bytes: u64,
    /// Set when the chunk ended with the terminal marker.
    pub end_of_stream: Option<u64>,
    reservation: Option<MemoryReservation>,
}

impl Chunk {
    fn new(stream: StreamKey) -> Self {
        Self {
            stream,
            records: Vec::new(),
            bytes: 0,
            end_of_stream: None,
            reservation: None,
        }
    }

    /// Whether the chunk carries no records (it may still carry the marker).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Index range of the records, `None` when empty.
    #[must_use]
    pub fn range(&self) -> Option<IndexRange> {
        let first = self.records.first()?.index;
        let last = self.records.last()?.index;
        Some(IndexRange::new(first, last))
    }

    /// Budget bytes still held by the chunk.
    #[must_use]
    pub fn reserved_bytes(&self) -> u64 {
        self.reservation.as_ref().map_or(0, MemoryReservation::bytes)
    }

    /// Releases the chunk's memory back to the budget.
    ///
    /// Call after the records have been durably spooled.
    pub fn release_memory(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            reservation.release();
        }
    }

    fn take_reservation(&mut self, reservation: Option<MemoryReservation>) {
        match (&mut self.reservation, reservation) {
            (Some(held), Some(r)) => held.merge(r),
            (held @ None, r) => *held = r,
            (Some(_), None) => {}
        }
    }
}

/// FIFO of records for one stream, gated by a shared memory budget.
pub struct StreamQueue {
    stream: StreamKey,
    budget: MemoryBudget,
    overhead_ratio: f64,
    state: Mutex<QueueState>,
    available: Notify,
}

impl std::fmt::Debug for StreamQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamQueue")
            .field("stream", &self.stream)
            .field("len", &state.entries.len())
            .field("queued_bytes", &state.queued_bytes)
            .field("closed", &state.closed)
            .field("aborted", &state.aborted)
            .finish_non_exhaustive()
    }
}

impl StreamQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(stream: StreamKey, budget: MemoryBudget, overhead_ratio: f64) -> Self {
        Self {
            stream,
            budget,
            overhead_ratio,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    /// Stream this queue carries.
    #[must_use]
    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }

    /// Enqueues a record, waiting for memory budget first.
    ///
    /// On an aborted queue the record is dropped and `Ok` returned.
    ///
    /// # Errors
    ///
    /// Returns `DestError::QueueClosed` if the terminal marker was already
    /// sent or read.
    pub async fn send(&self, record: WrappedRecord) -> Result<(), DestError> {
        self.send_admitted(record, || Ok(())).await.map(|_| ())
    }

    /// Like [`send`](Self::send), but runs `admit` under the queue lock right
    /// before the record becomes visible to the consumer. `admit` is skipped
    /// when the record is dropped, so accounting done there stays exact even
    /// if the caller is cancelled while waiting for memory.
    ///
    /// Returns whether the record was enqueued.
    ///
    /// # Errors
    ///
    /// Returns `DestError::QueueClosed` as `send` does, or the error from
    /// `admit` (the record is then dropped).
    pub async fn send_admitted(
        &self,
        record: WrappedRecord,
        admit: impl FnOnce() -> Result<(), DestError>,
    ) -> Result<bool, DestError> {
        {
            let state = self.state.lock();
            if state.aborted {
                return Ok(false);
            }
            if state.end_sent || state.closed {
                return Err(DestError::QueueClosed(self.stream.clone()));
            }
        }

        let reserve = self.reservation_size(record.size_bytes);
        let reservation = self.budget.acquire(reserve).await?;

        let mut state = self.state.lock();
        if state.aborted {
            return Ok(false);
        }
        if state.end_sent || state.closed {
            return Err(DestError::QueueClosed(self.stream.clone()));
        }
        admit()?;
        state.queued_bytes += record.size_bytes;
        state.entries.push_back(Entry {
            message: QueueMessage::Record(record),
            reservation: Some(reservation),
        });
        drop(state);
        self.available.notify_one();
        Ok(true)
    }

    /// Enqueues the terminal marker. `final_index` is the number of records
    /// published to the stream.
    ///
    /// # Errors
    ///
    /// Returns `DestError::QueueClosed` if a marker was already sent.
    pub fn send_end_of_stream(&self, final_index: u64) -> Result<(), DestError> {
        let mut state = self.state.lock();
        if state.aborted {
            return Ok(());
        }
        if state.end_sent || state.closed {
            return Err(DestError::QueueClosed(self.stream.clone()));
        }
        state.end_sent = true;
        state.entries.push_back(Entry {
            message: QueueMessage::EndOfStream {
                stream: self.stream.clone(),
                final_index,
            },
            reservation: None,
        });
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Pops entries until the next record would push the chunk past
    /// `max_bytes`, or the terminal marker is popped.
    ///
    /// The first record is always taken even if it alone exceeds `max_bytes`.
    /// Waits while the queue is empty, and while a partial chunk has room
    /// unless one of the early-cut conditions holds.
    ///
    /// # Errors
    ///
    /// Returns `DestError::Cancelled` if the queue is aborted while waiting.
    pub async fn receive_chunk(
        &self,
        max_bytes: u64,
        window: Option<Duration>,
    ) -> Result<Chunk, DestError> {
        let mut chunk = Chunk::new(self.stream.clone());
        let mut deadline: Option<Instant> = None;

        loop {
            // Registered before inspecting `has_waiters` so a publisher that
            // blocks right after the check still wakes us.
            let pressure = self.budget.pressure_notified();
            tokio::pin!(pressure);
            pressure.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.aborted {
                    return Err(DestError::Cancelled);
                }

                while let Some(front) = state.entries.front() {
                    let size = front.message.size_bytes();
                    if !chunk.records.is_empty() && chunk.bytes + size > max_bytes {
                        return Ok(chunk);
                    }
                    let Some(entry) = state.entries.pop_front() else {
                        break;
                    };
                    state.queued_bytes -= size;
                    chunk.take_reservation(entry.reservation);
                    match entry.message {
                        QueueMessage::Record(record) => {
                            chunk.bytes += size;
                            chunk.records.push(record);
                        }
                        QueueMessage::EndOfStream { final_index, .. } => {
                            state.closed = true;
                            chunk.end_of_stream = Some(final_index);
                            return Ok(chunk);
                        }
                    }
                }

                let flush = std::mem::take(&mut state.flush_requested);
                if !chunk.records.is_empty()
                    && (chunk.bytes >= max_bytes || flush || self.budget.has_waiters())
                {
                    return Ok(chunk);
                }
            }

            let partial = !chunk.records.is_empty();
            if partial && deadline.is_none() {
                deadline = window.map(|w| Instant::now() + w);
            }
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = self.available.notified() => {}
                () = &mut pressure, if partial => {}
                () = timer, if partial => {
                    tracing::trace!(stream = %self.stream, records = chunk.records.len(), "Spill window elapsed");
                    return Ok(chunk);
                }
            }
        }
    }

    /// Asks the consumer to cut its current partial chunk.
    pub fn request_flush(&self) {
        self.state.lock().flush_requested = true;
        self.available.notify_one();
    }

    /// Rejects further sends without discarding queued entries.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Discards queued entries, releasing their memory, and turns later
    /// sends into no-ops. Wakes a consumer blocked in `receive_chunk`.
    pub fn abort(&self) {
        let drained = {
            let mut state = self.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.queued_bytes = 0;
            std::mem::take(&mut state.entries)
        };
        if !drained.is_empty() {
            tracing::debug!(stream = %self.stream, discarded = drained.len(), "Aborted stream queue");
        }
        drop(drained);
        self.available.notify_one();
    }

    /// Whether sends are rejected.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed || state.end_sent
    }

    /// Whether the queue was aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Sum of `size_bytes` of queued records.
    #[must_use]
    pub fn queued_bytes(&self) -> u64 {
        self.state.lock().queued_bytes
    }

    /// Queued entries, including a pending terminal marker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    fn reservation_size(&self, size_bytes: u64) -> u64 {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let inflated = (size_bytes as f64 * self.overhead_ratio).ceil() as u64;
        let max = self.budget.max_bytes();
        if inflated > max {
            tracing::warn!(
                stream = %self.stream,
                size_bytes,
                max_bytes = max,
                "Record larger than the queue memory budget, reserving the whole budget"
            );
            return max;
        }
        inflated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn record(index: u64, size_bytes: u64) -> WrappedRecord {
        WrappedRecord {
            stream: StreamKey::new("s"),
            index,
            size_bytes,
            payload: json!({ "i": index }),
        }
    }

    fn queue(max: u64, ratio: f64) -> (Arc<StreamQueue>, MemoryBudget) {
        let budget = MemoryBudget::new(max);
        let q = Arc::new(StreamQueue::new(StreamKey::new("s"), budget.clone(), ratio));
        (q, budget)
    }

    #[tokio::test]
    async fn test_send_reserves_inflated_size() {
        let (q, budget) = queue(1000, 1.1);
        q.send(record(0, 10)).await.unwrap();
        assert_eq!(budget.used_bytes(), 11);
        assert_eq!(q.queued_bytes(), 10);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_holds_memory_until_released() {
        let (q, budget) = queue(1000, 1.0);
        for i in 0..3 {
            q.send(record(i, 10)).await.unwrap();
        }
        q.send_end_of_stream(3).unwrap();

        let mut chunk = q.receive_chunk(1000, None).await.unwrap();
        assert_eq!(chunk.records.len(), 3);
        assert_eq!(chunk.end_of_stream, Some(3));
        assert_eq!(chunk.range(), Some(IndexRange::new(0, 2)));
        assert_eq!(budget.used_bytes(), 30);
        assert_eq!(chunk.reserved_bytes(), 30);

        chunk.release_memory();
        assert_eq!(budget.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_chunk_stops_before_exceeding_max() {
        let (q, _budget) = queue(1000, 1.0);
        for i in 0..5 {
            q.send(record(i, 10)).await.unwrap();
        }
        q.send_end_of_stream(5).unwrap();

        let first = q.receive_chunk(25, None).await.unwrap();
        assert_eq!(first.range(), Some(IndexRange::new(0, 1)));
        assert_eq!(first.end_of_stream, None);

        let second = q.receive_chunk(25, None).await.unwrap();
        assert_eq!(second.range(), Some(IndexRange::new(2, 3)));

        let last = q.receive_chunk(25, None).await.unwrap();
        assert_eq!(last.range(), Some(IndexRange::new(4, 4)));
        assert_eq!(last.end_of_stream, Some(5));
    }

    #[tokio::test]
    async fn test_first_record_always_taken() {
        let (q, _budget) = queue(1000, 1.0);
        q.send(record(0, 500)).await.unwrap();
        q.send(record(1, 1)).await.unwrap();
        let chunk = q.receive_chunk(100, None).await.unwrap();
        assert_eq!(chunk.records.len(), 1);
        assert_eq!(chunk.bytes, 500);
    }

    #[tokio::test]
    async fn test_end_of_stream_only_chunk() {
        let (q, _budget) = queue(1000, 1.0);
        q.send_end_of_stream(0).unwrap();
        let chunk = q.receive_chunk(100, None).await.unwrap();
        assert!(chunk.is_empty());
        assert_eq!(chunk.range(), None);
        assert_eq!(chunk.end_of_stream, Some(0));
    }

    #[tokio::test]
    async fn test_send_after_end_is_error() {
        let (q, _budget) = queue(1000, 1.0);
        q.send_end_of_stream(0).unwrap();
        let err = q.send(record(0, 1)).await.unwrap_err();
        assert!(matches!(err, DestError::QueueClosed(_)));
        assert!(q.send_end_of_stream(0).is_err());

        let _ = q.receive_chunk(100, None).await.unwrap();
        assert!(q.is_closed());
        assert!(q.send(record(0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_request_flush_cuts_partial_chunk() {
        let (q, _budget) = queue(1000, 1.0);
        q.send(record(0, 10)).await.unwrap();
        q.request_flush();
        let chunk = tokio::time::timeout(Duration::from_secs(5), q.receive_chunk(1000, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spill_window_cuts_partial_chunk() {
        let (q, _budget) = queue(1000, 1.0);
        q.send(record(0, 10)).await.unwrap();
        let chunk = q
            .receive_chunk(1000, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(chunk.records.len(), 1);
        assert_eq!(chunk.end_of_stream, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocked_publisher_cuts_partial_chunk() {
        let (q, budget) = queue(100, 1.0);
        q.send(record(0, 60)).await.unwrap();

        let publisher = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.send(record(1, 60)).await })
        };

        let mut chunk = tokio::time::timeout(Duration::from_secs(5), q.receive_chunk(1000, None))
            .await
            .expect("partial chunk must be cut while the publisher waits")
            .unwrap();
        assert_eq!(chunk.records.len(), 1);
        assert!(budget.used_bytes() <= budget.max_bytes());

        chunk.release_memory();
        publisher.await.unwrap().unwrap();
        assert_eq!(q.queued_bytes(), 60);
    }

    #[tokio::test]
    async fn test_abort_releases_memory_and_wakes_consumer() {
        let (q, budget) = queue(1000, 1.0);
        q.send(record(0, 10)).await.unwrap();
        q.send(record(1, 10)).await.unwrap();

        q.abort();
        assert_eq!(budget.used_bytes(), 0);
        assert!(q.is_empty());
        assert!(matches!(
            q.receive_chunk(100, None).await,
            Err(DestError::Cancelled)
        ));
        q.send(record(2, 10)).await.unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_abort_wakes_waiting_consumer() {
        let (q, _budget) = queue(1000, 1.0);
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.receive_chunk(100, None).await })
        };
        tokio::task::yield_now().await;
        q.abort();
        let res = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(DestError::Cancelled)));
    }

    #[tokio::test]
    async fn test_admit_runs_only_for_enqueued_records() {
        let (q, _budget) = queue(1000, 1.0);
        let mut admitted = 0;
        assert!(q
            .send_admitted(record(0, 1), || {
                admitted += 1;
                Ok(())
            })
            .await
            .unwrap());
        q.abort();
        assert!(!q
            .send_admitted(record(1, 1), || {
                admitted += 1;
                Ok(())
            })
            .await
            .unwrap());
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_oversized_record_clamped_to_budget() {
        let (q, budget) = queue(50, 1.1);
        q.send(record(0, 100)).await.unwrap();
        assert_eq!(budget.used_bytes(), 50);
    }
}
