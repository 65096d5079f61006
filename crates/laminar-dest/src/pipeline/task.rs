//! Units of work scheduled by the orchestrator, and the state machines
//! they drive.

use std::fmt;
use std::time::Duration;

use crate::batch::BatchEnvelope;
use crate::processor::{StreamFailure, SyncFailure};
use crate::stream::StreamKey;

/// A unit of work. Produced only by the orchestrator, never retried.
#[derive(Debug)]
pub enum Task {
    /// Run the destination setup hook.
    Setup,
    /// Open one stream in the destination.
    OpenStream(StreamKey),
    /// Drain a stream queue into spool files until end of stream.
    SpillToDisk(StreamKey),
    /// Hand a spooled batch to the record processor.
    ProcessRecords(BatchEnvelope),
    /// Advance a batch that is not yet persisted.
    ProcessBatch(BatchEnvelope),
    /// Close a fully persisted stream.
    CloseStream(StreamKey),
    /// Final checkpoint flush and the destination teardown hook.
    Teardown {
        /// Set when some streams failed.
        failure: Option<SyncFailure>,
    },
    /// Wait, then emit drained checkpoints.
    FlushCheckpoints {
        /// Time to wait before flushing.
        delay: Duration,
    },
    /// Close one failed stream with a partial result.
    FailStream {
        /// The failure being handled.
        failure: StreamFailure,
        /// Whether the processor still needs a `close` call.
        close: bool,
    },
    /// Close every open stream with a partial result and tear down.
    FailSync {
        /// The failure being handled.
        failure: SyncFailure,
        /// Streams to close.
        streams: Vec<StreamFailure>,
        /// Whether the teardown hook still has to run.
        run_teardown: bool,
    },
    /// Stop the orchestrator.
    Done,
}

impl Task {
    /// Variant without its data.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Setup => TaskKind::Setup,
            Self::OpenStream(_) => TaskKind::OpenStream,
            Self::SpillToDisk(_) => TaskKind::SpillToDisk,
            Self::ProcessRecords(_) => TaskKind::ProcessRecords,
            Self::ProcessBatch(_) => TaskKind::ProcessBatch,
            Self::CloseStream(_) => TaskKind::CloseStream,
            Self::Teardown { .. } => TaskKind::Teardown,
            Self::FlushCheckpoints { .. } => TaskKind::FlushCheckpoints,
            Self::FailStream { .. } => TaskKind::FailStream,
            Self::FailSync { .. } => TaskKind::FailSync,
            Self::Done => TaskKind::Done,
        }
    }

    /// Stream the task belongs to, `None` for run-level tasks.
    #[must_use]
    pub fn stream(&self) -> Option<&StreamKey> {
        match self {
            Self::OpenStream(s) | Self::SpillToDisk(s) | Self::CloseStream(s) => Some(s),
            Self::ProcessRecords(env) | Self::ProcessBatch(env) => Some(&env.stream),
            Self::FailStream { failure, .. } => Some(&failure.stream),
            Self::Setup
            | Self::Teardown { .. }
            | Self::FlushCheckpoints { .. }
            | Self::FailSync { .. }
            | Self::Done => None,
        }
    }
}

/// [`Task`] discriminant, used in events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// [`Task::Setup`].
    Setup,
    /// [`Task::OpenStream`].
    OpenStream,
    /// [`Task::SpillToDisk`].
    SpillToDisk,
    /// [`Task::ProcessRecords`].
    ProcessRecords,
    /// [`Task::ProcessBatch`].
    ProcessBatch,
    /// [`Task::CloseStream`].
    CloseStream,
    /// [`Task::Teardown`].
    Teardown,
    /// [`Task::FlushCheckpoints`].
    FlushCheckpoints,
    /// [`Task::FailStream`].
    FailStream,
    /// [`Task::FailSync`].
    FailSync,
    /// [`Task::Done`].
    Done,
}

impl TaskKind {
    /// Whether a failure of this task fails the whole run rather than
    /// the task's stream.
    #[must_use]
    pub fn is_run_scoped(self) -> bool {
        matches!(
            self,
            Self::Setup | Self::Teardown | Self::FlushCheckpoints | Self::FailSync | Self::Done
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-stream lifecycle.
///
/// ```text
/// Uninitialized ─► Opening ─► Spilling ─► (ProcessingRecords ⇄ ProcessingBatch)* ─► Closing ─► Closed
///                                  any non-terminal stage ─► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStage {
    /// Declared, not yet opened.
    Uninitialized,
    /// `open` in progress.
    Opening,
    /// Spill task running; batches may be in flight.
    Spilling,
    /// Spill finished; a `process_records` call is the latest in flight.
    ProcessingRecords,
    /// Spill finished; a `process_batch` call is the latest in flight.
    ProcessingBatch,
    /// `close` in progress.
    Closing,
    /// Closed cleanly.
    Closed,
    /// Closed with a partial result.
    Failed,
}

impl StreamStage {
    /// `Closed` or `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Run lifecycle. `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Setup hook in progress.
    SettingUp,
    /// Streams are being written.
    Running,
    /// Teardown hook in progress.
    TearingDown,
    /// Finished.
    Done,
    /// A run-scoped failure occurred.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_stream() {
        let task = Task::OpenStream(StreamKey::new("a"));
        assert_eq!(task.kind(), TaskKind::OpenStream);
        assert_eq!(task.stream(), Some(&StreamKey::new("a")));
        assert_eq!(Task::Setup.stream(), None);
        assert_eq!(
            Task::FlushCheckpoints {
                delay: Duration::ZERO
            }
            .kind()
            .to_string(),
            "FlushCheckpoints"
        );
    }

    #[test]
    fn test_run_scoped_kinds() {
        assert!(TaskKind::Setup.is_run_scoped());
        assert!(TaskKind::Teardown.is_run_scoped());
        assert!(!TaskKind::ProcessBatch.is_run_scoped());
        assert!(!TaskKind::OpenStream.is_run_scoped());
    }

    #[test]
    fn test_terminal_stages() {
        assert!(StreamStage::Closed.is_terminal());
        assert!(StreamStage::Failed.is_terminal());
        assert!(!StreamStage::Closing.is_terminal());
    }
}
