//! # `LaminarDB` Destination Core
//!
//! Write-side core for destination connectors: moves records from an
//! extraction process into a destination while acknowledging source
//! checkpoints only after every record that preceded them is durably
//! persisted.
//!
//! - [`memory::MemoryBudget`] bounds queued record bytes and applies
//!   backpressure to the publisher.
//! - [`queue::StreamQueue`] buffers each stream and hands out size-bounded
//!   chunks that are spilled to disk ([`spool`]).
//! - [`checkpoint::CheckpointLedger`] counts in-flight records per checkpoint
//!   and emits checkpoints in order once they drain.
//! - [`pipeline::TaskOrchestrator`] drives every stream through
//!   open → spill → process → close with fail-fast cancellation.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use laminar_dest::{DestConfig, StreamKey, TaskOrchestrator, RecordProcessor, CheckpointRecord};
//! # async fn demo(processor: Arc<dyn RecordProcessor>) -> Result<(), laminar_dest::DestError> {
//! let users = StreamKey::new("users");
//! let emitter = Arc::new(|ckpt: CheckpointRecord| println!("ack {:?}", ckpt.id));
//! let (orchestrator, mut input) =
//!     TaskOrchestrator::new(DestConfig::default(), vec![users.clone()], processor, emitter)?;
//! let run = tokio::spawn(orchestrator.run());
//!
//! input.send_record(&users, serde_json::json!({"id": 1}), 16).await?;
//! input.send_checkpoint(CheckpointRecord::stream(users, serde_json::json!({"lsn": 1})), Some(1))?;
//! input.finish()?;
//!
//! let summary = run.await??;
//! println!("{} checkpoints emitted", summary.checkpoints_emitted);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Batch values and their lifecycle states
pub mod batch;

/// Checkpoint records, ledger and range reordering
pub mod checkpoint;

/// Run configuration
pub mod config;

/// Error types
pub mod error;

/// Shared memory budget for queued records
pub mod memory;

/// Per-run task orchestration
pub mod pipeline;

/// Interfaces to the destination, router and upstream acknowledger
pub mod processor;

/// Per-stream record queues
pub mod queue;

/// On-disk spool files
pub mod spool;

/// Stream identifiers and queued records
pub mod stream;

pub use batch::{Batch, BatchState, IndexRange};
pub use checkpoint::{CheckpointId, CheckpointKind, CheckpointLedger, CheckpointRecord, CheckpointScope};
pub use config::DestConfig;
pub use error::DestError;
pub use memory::{MemoryBudget, MemoryReservation};
pub use pipeline::{SyncInput, SyncSummary, TaskOrchestrator};
pub use processor::{
    CheckpointEmitter, DestinationHooks, MessageRouter, NoopHooks, PassthroughRouter,
    RecordProcessor, RoutedMessage, StreamFailure, SyncFailure,
};
pub use spool::SpoolReader;
pub use stream::StreamKey;
