//! Interfaces to the collaborators around the write core.
//!
//! The concrete destination, the inbound wire protocol and the upstream
//! acknowledgement channel live outside this crate and plug in through
//! these traits.

use std::fmt;

use async_trait::async_trait;

use crate::batch::Batch;
use crate::checkpoint::CheckpointRecord;
use crate::error::DestError;
use crate::spool::SpoolReader;
use crate::stream::StreamKey;

/// Partial outcome handed to [`RecordProcessor::close`] when a stream did
/// not finish cleanly.
#[derive(Debug, Clone)]
pub struct StreamFailure {
    /// Stream being closed.
    pub stream: StreamKey,
    /// First error observed for the stream (or the run).
    pub cause: String,
    /// Records of the stream persisted before the failure.
    pub persisted_records: u64,
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream {} failed after {} persisted records: {}",
            self.stream, self.persisted_records, self.cause
        )
    }
}

/// Partial outcome handed to [`DestinationHooks::teardown`] when the run
/// failed.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    /// First fatal error of the run.
    pub cause: String,
    /// Streams that did not close cleanly.
    pub failed_streams: Vec<StreamKey>,
}

/// Destination-specific record handling.
///
/// One processor serves every stream of the run; calls for different
/// streams run concurrently, calls for batches of one stream may too.
#[async_trait]
pub trait RecordProcessor: Send + Sync + 'static {
    /// Prepares per-stream destination state (staging tables, writers).
    async fn open(&self, _stream: &StreamKey) -> Result<(), DestError> {
        Ok(())
    }

    /// Converts a spooled chunk into a destination batch.
    ///
    /// `records` lazily yields the spooled payloads in index order;
    /// `total_bytes` is the spool file size.
    async fn process_records(
        &self,
        stream: &StreamKey,
        records: SpoolReader,
        total_bytes: u64,
    ) -> Result<Batch, DestError>;

    /// Advances a batch that is neither `Persisted` nor `Complete`.
    async fn process_batch(&self, stream: &StreamKey, batch: Batch) -> Result<Batch, DestError>;

    /// Finalizes the stream. `failure` is set when the stream closes with a
    /// partial result.
    async fn close(
        &self,
        stream: &StreamKey,
        failure: Option<&StreamFailure>,
    ) -> Result<(), DestError>;
}

/// Run-level setup and teardown.
#[async_trait]
pub trait DestinationHooks: Send + Sync + 'static {
    /// Runs once before any stream is opened.
    async fn setup(&self) -> Result<(), DestError> {
        Ok(())
    }

    /// Runs once after every stream closed, or after a run failure.
    async fn teardown(&self, _failure: Option<&SyncFailure>) -> Result<(), DestError> {
        Ok(())
    }
}

/// [`DestinationHooks`] that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl DestinationHooks for NoopHooks {}

/// Receives checkpoints once they are safe to acknowledge upstream.
///
/// Called from the orchestrator's flush tasks; must not block for long.
pub trait CheckpointEmitter: Send + Sync + 'static {
    /// Forwards a checkpoint upstream.
    fn emit(&self, record: CheckpointRecord);
}

impl<F> CheckpointEmitter for F
where
    F: Fn(CheckpointRecord) + Send + Sync + 'static,
{
    fn emit(&self, record: CheckpointRecord) {
        self(record);
    }
}

/// Outcome of classifying one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedMessage {
    /// A data record.
    Record {
        /// Target stream.
        stream: StreamKey,
        /// Record body.
        payload: serde_json::Value,
        /// Serialized size used for memory accounting.
        size_bytes: u64,
    },
    /// A source checkpoint.
    Checkpoint(CheckpointRecord),
    /// The source finished one stream.
    StreamComplete(StreamKey),
    /// Anything the write core ignores (logs, traces, ...).
    Other,
}

/// Decides what an inbound message is.
pub trait MessageRouter: Send + Sync {
    /// Raw message type produced by the transport.
    type Raw;

    /// Classifies one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be decoded.
    fn classify(&self, raw: Self::Raw) -> Result<RoutedMessage, DestError>;
}

/// Router for transports that already deliver decoded messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRouter;

impl MessageRouter for PassthroughRouter {
    type Raw = RoutedMessage;

    fn classify(&self, raw: RoutedMessage) -> Result<RoutedMessage, DestError> {
        Ok(raw)
    }
}
