//! Per-run task orchestration.
//!
//! # Architecture
//!
//! ```text
//!  SyncInput ──send_record──► StreamQueue (per stream, memory-gated)
//!      │                           │ receive_chunk
//!      │ send_checkpoint           ▼
//!      ▼                      SpillToDisk ──BatchSpooled──┐
//!  CheckpointLedger                                       ▼
//!      ▲                                       ┌──────────────────┐
//!      │ notify_persisted_range                │ TaskOrchestrator │  single loop
//!      └───────────── BatchProcessed ◄─────────┤  task queue +    │
//!                     (Persisted)              │  event channel   │
//!                                              └──────────────────┘
//!                         ProcessRecords / ProcessBatch spawned per batch
//! ```
//!
//! Streams progress independently; a periodic `FlushCheckpoints` task emits
//! checkpoints as the ledger drains.

pub mod coordinator;
pub mod input;
pub mod metrics;
mod runner;
pub mod task;
pub mod task_event;

pub use coordinator::{SyncSummary, TaskOrchestrator};
pub use input::SyncInput;
pub use metrics::{StreamMetrics, StreamMetricsSnapshot};
pub use task::{RunState, StreamStage, Task, TaskKind};
pub use task_event::TaskEvent;
