//! Event-driven task orchestrator for one sync run.
//!
//! A single loop owns all scheduling decisions:
//! - **Task queue**: an unbounded `mpsc` of [`Task`]s. Each dequeued task is
//!   spawned into a `JoinSet` without being awaited.
//! - **Event channel**: tasks report completion as [`TaskEvent`]s; the loop
//!   reacts by updating stream/run state and enqueueing follow-up tasks.
//! - **Failure domains**: each stream has a `CancellationToken` that is a
//!   child of the run's token, so a stream failure stops that stream's work
//!   and a run failure stops everything.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchEnvelope;
use crate::checkpoint::{CheckpointLedger, RangeTracker};
use crate::config::DestConfig;
use crate::error::DestError;
use crate::memory::MemoryBudget;
use crate::processor::{
    CheckpointEmitter, DestinationHooks, NoopHooks, RecordProcessor, StreamFailure, SyncFailure,
};
use crate::queue::StreamQueue;
use crate::stream::StreamKey;

use super::input::SyncInput;
use super::metrics::{StreamMetrics, StreamMetricsSnapshot};
use super::runner::{run_task, RunContext};
use super::task::{RunState, StreamStage, Task, TaskKind};
use super::task_event::TaskEvent;

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    /// Final metrics per stream.
    pub streams: BTreeMap<StreamKey, StreamMetricsSnapshot>,
    /// Checkpoints emitted upstream.
    pub checkpoints_emitted: u64,
    /// Highest queue memory usage observed.
    pub peak_memory_bytes: u64,
}

struct StreamSlot {
    stage: StreamStage,
    spill_final: Option<u64>,
    inflight: usize,
    tracker: RangeTracker,
    cancel: CancellationToken,
    close_attempted: bool,
}

/// Drives every stream of a run through open, spill, process and close.
pub struct TaskOrchestrator {
    ctx: Arc<RunContext>,
    streams: Vec<StreamKey>,
    slots: HashMap<StreamKey, StreamSlot>,
    run_state: RunState,
    run_cancel: CancellationToken,
    task_tx: mpsc::UnboundedSender<Task>,
    task_rx: mpsc::UnboundedReceiver<Task>,
    event_tx: mpsc::UnboundedSender<TaskEvent>,
    event_rx: mpsc::UnboundedReceiver<TaskEvent>,
    tasks: JoinSet<()>,
    run_error: Option<DestError>,
    stream_error: Option<DestError>,
    failed_streams: Vec<StreamKey>,
    closing_failed: HashSet<StreamKey>,
    teardown_attempted: bool,
    last_flush: Instant,
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("streams", &self.streams)
            .field("run_state", &self.run_state)
            .field("running_tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl TaskOrchestrator {
    /// Creates an orchestrator with no-op setup/teardown hooks.
    ///
    /// # Errors
    ///
    /// See [`with_hooks`](Self::with_hooks).
    pub fn new(
        config: DestConfig,
        streams: Vec<StreamKey>,
        processor: Arc<dyn RecordProcessor>,
        emitter: Arc<dyn CheckpointEmitter>,
    ) -> Result<(Self, SyncInput), DestError> {
        Self::with_hooks(config, streams, processor, emitter, Arc::new(NoopHooks))
    }

    /// Creates an orchestrator and the [`SyncInput`] that feeds it.
    ///
    /// # Errors
    ///
    /// Returns `DestError::Config` if the config is invalid or a stream is
    /// declared twice.
    pub fn with_hooks(
        config: DestConfig,
        streams: Vec<StreamKey>,
        processor: Arc<dyn RecordProcessor>,
        emitter: Arc<dyn CheckpointEmitter>,
        hooks: Arc<dyn DestinationHooks>,
    ) -> Result<(Self, SyncInput), DestError> {
        config.validate()?;
        let mut seen = HashSet::new();
        if let Some(dup) = streams.iter().find(|s| !seen.insert(*s)) {
            return Err(DestError::Config(format!("stream {dup} declared twice")));
        }

        let budget = MemoryBudget::reserve(config.total_memory_bytes, config.queue_memory_ratio)?;
        let ledger = Arc::new(CheckpointLedger::new(streams.iter().cloned()));
        let queues: HashMap<StreamKey, Arc<StreamQueue>> = streams
            .iter()
            .map(|s| {
                let q = StreamQueue::new(s.clone(), budget.clone(), config.record_overhead_ratio);
                (s.clone(), Arc::new(q))
            })
            .collect();
        let metrics: HashMap<StreamKey, Arc<StreamMetrics>> = streams
            .iter()
            .map(|s| (s.clone(), Arc::new(StreamMetrics::default())))
            .collect();

        let run_cancel = CancellationToken::new();
        let slots = streams
            .iter()
            .map(|s| {
                let slot = StreamSlot {
                    stage: StreamStage::Uninitialized,
                    spill_final: None,
                    inflight: 0,
                    tracker: RangeTracker::new(s.clone()),
                    cancel: run_cancel.child_token(),
                    close_attempted: false,
                };
                (s.clone(), slot)
            })
            .collect();

        let input = SyncInput::new(Arc::clone(&ledger), queues.clone(), metrics.clone());
        let ctx = RunContext {
            spool_dir: config.spool_dir(),
            process_permits: Arc::new(Semaphore::new(config.max_concurrent_process_tasks)),
            config,
            budget,
            ledger,
            queues,
            metrics,
            processor,
            hooks,
            emitter,
        };

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            ctx: Arc::new(ctx),
            streams,
            slots,
            run_state: RunState::SettingUp,
            run_cancel,
            task_tx,
            task_rx,
            event_tx,
            event_rx,
            tasks: JoinSet::new(),
            run_error: None,
            stream_error: None,
            failed_streams: Vec::new(),
            closing_failed: HashSet::new(),
            teardown_attempted: false,
            last_flush: Instant::now(),
        };
        Ok((orchestrator, input))
    }

    /// Current run state.
    #[must_use]
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Runs the sync to completion.
    ///
    /// Returns once every stream has been closed and teardown finished, or
    /// once a failure has been handled.
    ///
    /// # Errors
    ///
    /// Returns the first run-scoped error, or if there was none, the first
    /// stream failure. Checkpoints emitted before the failure stay valid.
    pub async fn run(mut self) -> Result<SyncSummary, DestError> {
        tracing::info!(
            streams = self.streams.len(),
            queue_memory_bytes = self.ctx.budget.max_bytes(),
            spool_dir = %self.ctx.spool_dir.display(),
            "Sync started"
        );
        self.enqueue(Task::Setup);

        loop {
            tokio::select! {
                biased;

                Some(event) = self.event_rx.recv() => self.handle_event(event),

                Some(task) = self.task_rx.recv() => {
                    if self.dispatch(task) {
                        break;
                    }
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_join(joined);
                }
            }
        }

        // Stop the flush timer and any stray work, then let close calls finish.
        self.run_cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!(error = %e, "Task panicked during shutdown");
                }
            }
        }

        let summary = SyncSummary {
            streams: self
                .ctx
                .metrics
                .iter()
                .map(|(k, m)| (k.clone(), m.snapshot()))
                .collect(),
            checkpoints_emitted: self.ctx.ledger.emitted_count(),
            peak_memory_bytes: self.ctx.budget.peak_bytes(),
        };

        if let Some(error) = self.run_error.take().or_else(|| self.stream_error.take()) {
            tracing::error!(
                error = %error,
                failed_streams = self.failed_streams.len(),
                checkpoints_emitted = summary.checkpoints_emitted,
                "Sync failed"
            );
            return Err(error);
        }
        tracing::info!(
            checkpoints_emitted = summary.checkpoints_emitted,
            peak_memory_bytes = summary.peak_memory_bytes,
            "Sync finished"
        );
        Ok(summary)
    }

    fn enqueue(&self, task: Task) {
        // The receiver lives in `self`, so this cannot fail while we run.
        let _ = self.task_tx.send(task);
    }

    /// Spawns `task`. Returns `true` when the loop should stop.
    fn dispatch(&mut self, task: Task) -> bool {
        if matches!(task, Task::Done) {
            return true;
        }
        let failure_handling = matches!(task, Task::FailStream { .. } | Task::FailSync { .. });
        if self.run_state == RunState::Failed && !failure_handling {
            tracing::debug!(task = %task.kind(), "Discarding task after run failure");
            return false;
        }

        if matches!(task, Task::Teardown { .. }) {
            self.teardown_attempted = true;
        }

        let cancel = match task.stream() {
            Some(stream) => match self.slots.get(stream) {
                Some(slot) if slot.stage == StreamStage::Failed && !failure_handling => {
                    tracing::debug!(stream = %stream, task = %task.kind(), "Discarding task for failed stream");
                    return false;
                }
                Some(slot) => slot.cancel.clone(),
                None => self.run_cancel.clone(),
            },
            None => self.run_cancel.clone(),
        };

        tracing::trace!(task = %task.kind(), stream = ?task.stream(), "Dispatching task");
        self.tasks.spawn(run_task(
            task,
            Arc::clone(&self.ctx),
            self.event_tx.clone(),
            cancel,
        ));
        false
    }

    fn handle_join(&mut self, joined: Result<(), JoinError>) {
        let Err(e) = joined else {
            return;
        };
        if !e.is_panic() {
            return;
        }
        if self.run_state == RunState::Failed {
            // The panicking task may be the failure handler itself. `FailSync`
            // is already queued ahead of this, and shutdown waits for it.
            tracing::error!(error = %e, "Task panicked after run failure, stopping");
            self.enqueue(Task::Done);
            return;
        }
        self.fail_sync(DestError::from(e));
    }

    fn handle_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::SetupComplete => self.on_setup_complete(),
            TaskEvent::StreamOpened(stream) => {
                if let Some(slot) = self.live_slot(&stream) {
                    slot.stage = StreamStage::Spilling;
                    self.enqueue(Task::SpillToDisk(stream));
                }
            }
            TaskEvent::BatchSpooled(env) => {
                if let Some(slot) = self.live_slot(&env.stream) {
                    slot.inflight += 1;
                    self.enqueue(Task::ProcessRecords(env));
                }
            }
            TaskEvent::SpillComplete {
                stream,
                final_index,
            } => {
                if let Some(slot) = self.live_slot(&stream) {
                    slot.spill_final = Some(final_index);
                    if slot.inflight > 0 {
                        slot.stage = StreamStage::ProcessingRecords;
                    }
                    self.maybe_close(&stream);
                }
            }
            TaskEvent::BatchProcessed(env) => self.on_batch_processed(env),
            TaskEvent::StreamClosed(stream) => {
                if let Some(slot) = self.live_slot(&stream) {
                    slot.stage = StreamStage::Closed;
                    tracing::info!(stream = %stream, "Stream closed");
                    self.check_complete();
                }
            }
            TaskEvent::TeardownComplete => {
                if self.run_state == RunState::TearingDown {
                    self.run_state = RunState::Done;
                    self.enqueue(Task::Done);
                }
            }
            TaskEvent::CheckpointsFlushed { emitted } => self.on_checkpoints_flushed(emitted),
            TaskEvent::StreamFailureHandled(stream) => {
                self.closing_failed.remove(&stream);
                self.check_complete();
            }
            TaskEvent::SyncFailureHandled => self.enqueue(Task::Done),
            TaskEvent::TaskFailed {
                kind,
                stream,
                error,
            } => self.on_task_failed(kind, stream, error),
        }
    }

    /// Slot of a stream whose events still matter.
    fn live_slot(&mut self, stream: &StreamKey) -> Option<&mut StreamSlot> {
        if self.run_state == RunState::Failed {
            return None;
        }
        self.slots
            .get_mut(stream)
            .filter(|slot| !slot.stage.is_terminal())
    }

    fn on_setup_complete(&mut self) {
        if self.run_state != RunState::SettingUp {
            return;
        }
        self.run_state = RunState::Running;
        tracing::info!(streams = self.streams.len(), "Setup complete, opening streams");
        for stream in &self.streams {
            if let Some(slot) = self.slots.get_mut(stream) {
                slot.stage = StreamStage::Opening;
            }
            self.enqueue(Task::OpenStream(stream.clone()));
        }
        self.last_flush = Instant::now();
        self.enqueue(Task::FlushCheckpoints {
            delay: self.ctx.config.flush_check_interval(),
        });
        self.check_complete();
    }

    fn on_batch_processed(&mut self, env: BatchEnvelope) {
        let max_iterations = self.ctx.config.max_batch_iterations;
        let stream = env.stream.clone();
        if self.live_slot(&stream).is_none() {
            return;
        }
        // Only the spooled range is known to have reached the destination.
        if let Some(reported) = env.misreported_range() {
            self.fail_sync(DestError::Invariant(format!(
                "batch {} of stream {stream} spooled {} but the destination reported {reported}",
                env.seq,
                env.spooled_range()
            )));
            return;
        }
        let Some(slot) = self.live_slot(&stream) else {
            return;
        };

        if !env.batch.state().is_persisted() {
            if max_iterations > 0 && env.iterations >= max_iterations {
                let error = DestError::BatchIterationLimit {
                    stream: stream.clone(),
                    iterations: env.iterations,
                };
                self.fail_stream(&stream, TaskKind::ProcessBatch, error);
                return;
            }
            if slot.spill_final.is_some() {
                slot.stage = StreamStage::ProcessingBatch;
            }
            tracing::trace!(stream = %stream, seq = env.seq, state = %env.batch.state(), "Batch not yet persisted");
            self.enqueue(Task::ProcessBatch(env));
            return;
        }

        slot.inflight = slot.inflight.saturating_sub(1);
        let range = env.spooled_range();
        let released = match slot.tracker.insert(range) {
            Ok(released) => released,
            Err(e) => {
                self.fail_sync(e);
                return;
            }
        };
        if let Some(run) = released {
            if let Err(e) = self.ctx.ledger.notify_persisted_range(&stream, run) {
                self.fail_sync(e);
                return;
            }
        }
        if let Some(m) = self.ctx.metrics.get(&stream) {
            m.record_persisted(range.len());
        }
        tracing::debug!(
            stream = %stream,
            seq = env.seq,
            range = %range,
            state = %env.batch.state(),
            iterations = env.iterations,
            "Batch persisted"
        );
        self.maybe_close(&stream);
    }

    fn maybe_close(&mut self, stream: &StreamKey) {
        let Some(slot) = self.slots.get_mut(stream) else {
            return;
        };
        if slot.stage.is_terminal() || slot.stage == StreamStage::Closing {
            return;
        }
        let Some(final_index) = slot.spill_final else {
            return;
        };
        if slot.inflight > 0 {
            return;
        }
        if slot.tracker.next_expected() != final_index || !slot.tracker.is_caught_up() {
            let error = DestError::Invariant(format!(
                "stream {stream} published {final_index} records but persisted ranges end at {}",
                slot.tracker.next_expected()
            ));
            self.fail_sync(error);
            return;
        }
        slot.stage = StreamStage::Closing;
        slot.close_attempted = true;
        tracing::debug!(stream = %stream, records = final_index, "All batches persisted, closing stream");
        self.enqueue(Task::CloseStream(stream.clone()));
    }

    fn check_complete(&mut self) {
        if self.run_state != RunState::Running || !self.closing_failed.is_empty() {
            return;
        }
        if !self.slots.values().all(|s| s.stage.is_terminal()) {
            return;
        }
        self.run_state = RunState::TearingDown;
        let failure = self.stream_error.as_ref().map(|e| SyncFailure {
            cause: e.to_string(),
            failed_streams: self.failed_streams.clone(),
        });
        tracing::info!(failed_streams = self.failed_streams.len(), "All streams finished, tearing down");
        self.enqueue(Task::Teardown { failure });
    }

    fn on_checkpoints_flushed(&mut self, emitted: usize) {
        if emitted > 0 {
            self.last_flush = Instant::now();
            tracing::debug!(emitted, "Checkpoints flushed");
        }
        if self.run_state != RunState::Running {
            return;
        }

        let interval = self.ctx.config.flush_check_interval();
        let cadence = self.ctx.config.checkpoint_flush_cadence();
        if self.ctx.ledger.pending_count() == 0 {
            self.last_flush = Instant::now();
        }
        let elapsed = self.last_flush.elapsed();
        let delay = if elapsed >= cadence {
            tracing::info!(
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                pending = self.ctx.ledger.pending_count(),
                "Checkpoint flush cadence elapsed, forcing spill of buffered records"
            );
            for (stream, slot) in &self.slots {
                if !slot.stage.is_terminal() {
                    if let Some(q) = self.ctx.queues.get(stream) {
                        q.request_flush();
                    }
                }
            }
            self.last_flush = Instant::now();
            interval
        } else {
            interval.min(cadence.saturating_sub(elapsed)).max(Duration::from_millis(1))
        };
        self.enqueue(Task::FlushCheckpoints { delay });
    }

    fn on_task_failed(&mut self, kind: TaskKind, stream: Option<StreamKey>, error: DestError) {
        if matches!(error, DestError::Cancelled) {
            tracing::trace!(task = %kind, stream = ?stream, "Task cancelled");
            return;
        }
        if self.run_state == RunState::Failed {
            tracing::debug!(task = %kind, error = %error, "Ignoring failure after run failure");
            return;
        }
        match stream {
            Some(stream) if !error.is_invariant_violation() && !kind.is_run_scoped() => {
                self.fail_stream(&stream, kind, error);
            }
            _ => self.fail_sync(error),
        }
    }

    fn persisted_records(&self, stream: &StreamKey) -> u64 {
        self.ctx
            .metrics
            .get(stream)
            .map_or(0, |m| m.snapshot().records_persisted)
    }

    fn fail_stream(&mut self, stream: &StreamKey, kind: TaskKind, error: DestError) {
        let persisted_records = self.persisted_records(stream);
        let Some(slot) = self.slots.get_mut(stream) else {
            return;
        };
        if slot.stage.is_terminal() {
            return;
        }
        tracing::error!(stream = %stream, task = %kind, error = %error, "Stream task failed");

        slot.stage = StreamStage::Failed;
        slot.cancel.cancel();
        let close = !slot.close_attempted;
        slot.close_attempted = true;
        if let Some(q) = self.ctx.queues.get(stream) {
            q.abort();
        }

        let failure = StreamFailure {
            stream: stream.clone(),
            cause: error.to_string(),
            persisted_records,
        };
        self.failed_streams.push(stream.clone());
        self.closing_failed.insert(stream.clone());
        if self.stream_error.is_none() {
            self.stream_error = Some(error);
        }
        self.enqueue(Task::FailStream { failure, close });
    }

    fn fail_sync(&mut self, error: DestError) {
        if self.run_state == RunState::Failed {
            return;
        }
        tracing::error!(run_state = ?self.run_state, error = %error, "Sync failed, cancelling all tasks");
        self.run_state = RunState::Failed;
        self.run_cancel.cancel();
        for queue in self.ctx.queues.values() {
            queue.abort();
        }

        let cause = error.to_string();
        let mut to_close = Vec::new();
        while let Ok(task) = self.task_rx.try_recv() {
            if let Task::FailStream {
                failure,
                close: true,
            } = task
            {
                to_close.push(failure);
            }
        }

        for stream in self.streams.clone() {
            let persisted_records = self.persisted_records(&stream);
            let Some(slot) = self.slots.get_mut(&stream) else {
                continue;
            };
            if slot.stage.is_terminal() {
                continue;
            }
            let opened = slot.stage != StreamStage::Uninitialized;
            slot.stage = StreamStage::Failed;
            if opened && !slot.close_attempted {
                slot.close_attempted = true;
                to_close.push(StreamFailure {
                    stream: stream.clone(),
                    cause: cause.clone(),
                    persisted_records,
                });
            }
            self.failed_streams.push(stream);
        }

        let run_teardown = !self.teardown_attempted;
        self.teardown_attempted = true;
        let failure = SyncFailure {
            cause,
            failed_streams: self.failed_streams.clone(),
        };
        self.run_error = Some(error);
        self.enqueue(Task::FailSync {
            failure,
            streams: to_close,
            run_teardown,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::checkpoint::CheckpointRecord;
    use crate::spool::SpoolReader;
    use async_trait::async_trait;

    struct NullProcessor;

    #[async_trait]
    impl RecordProcessor for NullProcessor {
        async fn process_records(
            &self,
            _stream: &StreamKey,
            _records: SpoolReader,
            _total_bytes: u64,
        ) -> Result<Batch, DestError> {
            Ok(Batch::persisted())
        }

        async fn process_batch(
            &self,
            _stream: &StreamKey,
            batch: Batch,
        ) -> Result<Batch, DestError> {
            Ok(batch)
        }

        async fn close(
            &self,
            _stream: &StreamKey,
            _failure: Option<&StreamFailure>,
        ) -> Result<(), DestError> {
            Ok(())
        }
    }

    fn orchestrator() -> TaskOrchestrator {
        let (orchestrator, _input) = TaskOrchestrator::new(
            DestConfig::default(),
            vec![StreamKey::new("a"), StreamKey::new("b")],
            Arc::new(NullProcessor),
            Arc::new(|_r: CheckpointRecord| {}),
        )
        .unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_failure_before_teardown_dispatch_still_tears_down() {
        let mut o = orchestrator();
        o.run_state = RunState::Running;
        for slot in o.slots.values_mut() {
            slot.stage = StreamStage::Closed;
        }
        o.check_complete();
        assert_eq!(o.run_state, RunState::TearingDown);

        // Teardown is queued but not dispatched when the run fails.
        o.fail_sync(DestError::Invariant("emitter panicked".into()));
        match o.task_rx.try_recv().unwrap() {
            Task::FailSync { run_teardown, .. } => assert!(run_teardown),
            other => panic!("unexpected task {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_after_failure_stops_loop() {
        let mut o = orchestrator();
        o.fail_sync(DestError::destination("setup failed"));
        assert!(matches!(
            o.task_rx.try_recv().unwrap(),
            Task::FailSync { run_teardown: true, .. }
        ));

        let panicked = tokio::spawn(async { panic!("teardown hook panicked") })
            .await
            .unwrap_err();
        o.handle_join(Err(panicked));
        assert!(matches!(o.task_rx.try_recv().unwrap(), Task::Done));
        assert!(matches!(o.run_error, Some(DestError::Destination(_))));
    }
}
