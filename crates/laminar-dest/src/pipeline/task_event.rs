//! Completion events sent from running tasks back to the orchestrator.

use crate::batch::BatchEnvelope;
use crate::error::DestError;
use crate::stream::StreamKey;

use super::task::TaskKind;

/// An event sent from a task to the orchestrator loop.
#[derive(Debug)]
pub enum TaskEvent {
    /// Setup hook finished.
    SetupComplete,
    /// `open` finished for a stream.
    StreamOpened(StreamKey),
    /// The spill task wrote a batch. Sent while spilling continues.
    BatchSpooled(BatchEnvelope),
    /// The spill task observed end of stream.
    SpillComplete {
        /// Stream that finished spilling.
        stream: StreamKey,
        /// Records published to the stream.
        final_index: u64,
    },
    /// A process call returned.
    BatchProcessed(BatchEnvelope),
    /// `close` finished for a stream.
    StreamClosed(StreamKey),
    /// Teardown hook finished.
    TeardownComplete,
    /// A flush task fired.
    CheckpointsFlushed {
        /// Checkpoints emitted by this firing.
        emitted: usize,
    },
    /// A `FailStream` task finished.
    StreamFailureHandled(StreamKey),
    /// The `FailSync` task finished.
    SyncFailureHandled,
    /// A task returned an error.
    TaskFailed {
        /// Kind of the failed task.
        kind: TaskKind,
        /// Stream of the failed task, if stream-scoped.
        stream: Option<StreamKey>,
        /// The error.
        error: DestError,
    },
}
