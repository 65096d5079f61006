//! Publisher side of a sync run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::checkpoint::{CheckpointId, CheckpointLedger, CheckpointRecord};
use crate::error::DestError;
use crate::processor::{MessageRouter, RoutedMessage};
use crate::queue::StreamQueue;
use crate::stream::{StreamKey, WrappedRecord};

use super::metrics::StreamMetrics;

/// Feeds records and checkpoints into a running sync.
///
/// There is exactly one `SyncInput` per run and every method takes
/// `&mut self`, so record indices are assigned by a single writer and are
/// strictly increasing per stream. `send_record` suspends while the memory
/// budget is exhausted.
#[derive(Debug)]
pub struct SyncInput {
    ledger: Arc<CheckpointLedger>,
    queues: HashMap<StreamKey, Arc<StreamQueue>>,
    metrics: HashMap<StreamKey, Arc<StreamMetrics>>,
    next_index: HashMap<StreamKey, u64>,
    ended: HashSet<StreamKey>,
}

impl SyncInput {
    pub(crate) fn new(
        ledger: Arc<CheckpointLedger>,
        queues: HashMap<StreamKey, Arc<StreamQueue>>,
        metrics: HashMap<StreamKey, Arc<StreamMetrics>>,
    ) -> Self {
        let next_index = queues.keys().map(|k| (k.clone(), 0)).collect();
        Self {
            ledger,
            queues,
            metrics,
            next_index,
            ended: HashSet::new(),
        }
    }

    /// Publishes a record and returns the index it was assigned.
    ///
    /// Records sent to a stream that already failed are dropped; the index
    /// is still returned.
    ///
    /// # Errors
    ///
    /// - `DestError::UnknownStream` if the stream was not declared.
    /// - `DestError::QueueClosed` if the stream was already ended.
    pub async fn send_record(
        &mut self,
        stream: &StreamKey,
        payload: serde_json::Value,
        size_bytes: u64,
    ) -> Result<u64, DestError> {
        let queue = self
            .queues
            .get(stream)
            .ok_or_else(|| DestError::UnknownStream(stream.clone()))?;
        if self.ended.contains(stream) {
            return Err(DestError::QueueClosed(stream.clone()));
        }
        let index = self.next_index.get(stream).copied().unwrap_or(0);

        let record = WrappedRecord {
            stream: stream.clone(),
            index,
            size_bytes,
            payload,
        };
        let ledger = &self.ledger;
        let enqueued = queue
            .send_admitted(record, || ledger.record_admitted(stream).map(|_| ()))
            .await?;

        self.next_index.insert(stream.clone(), index + 1);
        if enqueued {
            if let Some(m) = self.metrics.get(stream) {
                m.record_queued(size_bytes);
            }
        }
        Ok(index)
    }

    /// Starts tracking a source checkpoint. Records published before this
    /// call count towards it.
    ///
    /// # Errors
    ///
    /// Returns the ledger's scope-conflict or unknown-stream errors.
    pub fn send_checkpoint(
        &mut self,
        record: CheckpointRecord,
        source_record_count: Option<u64>,
    ) -> Result<CheckpointId, DestError> {
        self.ledger.track_checkpoint(record, source_record_count)
    }

    /// Ends one stream. Further records for it are rejected; ending it again
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DestError::UnknownStream` if the stream was not declared.
    pub fn end_stream(&mut self, stream: &StreamKey) -> Result<(), DestError> {
        let queue = self
            .queues
            .get(stream)
            .ok_or_else(|| DestError::UnknownStream(stream.clone()))?;
        if !self.ended.insert(stream.clone()) {
            return Ok(());
        }
        let final_index = self.next_index.get(stream).copied().unwrap_or(0);
        tracing::debug!(stream = %stream, final_index, "Stream input ended");
        queue.send_end_of_stream(final_index)
    }

    /// Ends every stream that is still open.
    ///
    /// # Errors
    ///
    /// Returns the first error from ending a stream.
    pub fn finish(mut self) -> Result<(), DestError> {
        let open: Vec<StreamKey> = self
            .queues
            .keys()
            .filter(|k| !self.ended.contains(*k))
            .cloned()
            .collect();
        for stream in &open {
            self.end_stream(stream)?;
        }
        Ok(())
    }

    /// Classifies a raw message with `router` and publishes it.
    ///
    /// # Errors
    ///
    /// Returns classification errors and the errors of the method the
    /// message was routed to.
    pub async fn route<R: MessageRouter>(
        &mut self,
        router: &R,
        raw: R::Raw,
    ) -> Result<(), DestError> {
        match router.classify(raw)? {
            RoutedMessage::Record {
                stream,
                payload,
                size_bytes,
            } => self.send_record(&stream, payload, size_bytes).await.map(|_| ()),
            RoutedMessage::Checkpoint(record) => {
                let declared = record.source_record_count;
                self.send_checkpoint(record, declared).map(|_| ())
            }
            RoutedMessage::StreamComplete(stream) => self.end_stream(&stream),
            RoutedMessage::Other => {
                tracing::trace!("Ignoring non-record message");
                Ok(())
            }
        }
    }

    /// Records published to `stream` so far.
    #[must_use]
    pub fn published(&self, stream: &StreamKey) -> u64 {
        self.next_index.get(stream).copied().unwrap_or(0)
    }
}
