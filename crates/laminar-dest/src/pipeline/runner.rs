//! Task bodies.
//!
//! Each dequeued [`Task`] runs as its own tokio task and reports back through
//! the event channel. Bodies never touch orchestrator state; everything they
//! share lives in [`RunContext`].

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::batch::BatchEnvelope;
use crate::checkpoint::CheckpointLedger;
use crate::config::DestConfig;
use crate::error::DestError;
use crate::memory::MemoryBudget;
use crate::processor::{
    CheckpointEmitter, DestinationHooks, RecordProcessor, StreamFailure, SyncFailure,
};
use crate::queue::StreamQueue;
use crate::spool;
use crate::stream::StreamKey;

use super::metrics::StreamMetrics;
use super::task::Task;
use super::task_event::TaskEvent;

/// State shared by every task of one run.
pub(crate) struct RunContext {
    pub config: DestConfig,
    pub spool_dir: PathBuf,
    pub budget: MemoryBudget,
    pub ledger: Arc<CheckpointLedger>,
    pub queues: HashMap<StreamKey, Arc<StreamQueue>>,
    pub metrics: HashMap<StreamKey, Arc<StreamMetrics>>,
    pub processor: Arc<dyn RecordProcessor>,
    pub hooks: Arc<dyn DestinationHooks>,
    pub emitter: Arc<dyn CheckpointEmitter>,
    pub process_permits: Arc<Semaphore>,
}

impl RunContext {
    fn queue(&self, stream: &StreamKey) -> Result<&Arc<StreamQueue>, DestError> {
        self.queues
            .get(stream)
            .ok_or_else(|| DestError::UnknownStream(stream.clone()))
    }

    fn metrics(&self, stream: &StreamKey) -> Option<&StreamMetrics> {
        self.metrics.get(stream).map(Arc::as_ref)
    }

    pub fn flush_checkpoints(&self) -> usize {
        let emitter = &self.emitter;
        self.ledger.flush_ready(|record| emitter.emit(record))
    }
}

/// Runs `task` to completion and sends its outcome to `events`.
///
/// `cancel` is the token of the task's failure domain. Bodies that only
/// produce work for a live stream or run stop when it fires; close, teardown
/// and failure handling always run to completion.
pub(crate) async fn run_task(
    task: Task,
    ctx: Arc<RunContext>,
    events: mpsc::UnboundedSender<TaskEvent>,
    cancel: CancellationToken,
) {
    let kind = task.kind();
    let stream = task.stream().cloned();

    let outcome = match task {
        Task::Setup => ctx.hooks.setup().await.map(|()| TaskEvent::SetupComplete),
        Task::OpenStream(stream) => {
            with_cancel(&cancel, open_stream(&ctx, stream)).await
        }
        Task::SpillToDisk(stream) => {
            with_cancel(&cancel, spill_to_disk(&ctx, stream, &events)).await
        }
        Task::ProcessRecords(env) => with_cancel(&cancel, process_records(&ctx, env)).await,
        Task::ProcessBatch(env) => with_cancel(&cancel, process_batch(&ctx, env)).await,
        Task::CloseStream(stream) => close_stream(&ctx, stream).await,
        Task::Teardown { failure } => teardown(&ctx, failure).await,
        Task::FlushCheckpoints { delay } => {
            with_cancel(&cancel, async {
                tokio::time::sleep(delay).await;
                Ok(TaskEvent::CheckpointsFlushed {
                    emitted: ctx.flush_checkpoints(),
                })
            })
            .await
        }
        Task::FailStream { failure, close } => Ok(fail_stream(&ctx, failure, close).await),
        Task::FailSync {
            failure,
            streams,
            run_teardown,
        } => Ok(fail_sync(&ctx, failure, streams, run_teardown).await),
        Task::Done => return,
    };

    let event = outcome.unwrap_or_else(|error| TaskEvent::TaskFailed {
        kind,
        stream,
        error,
    });
    // The orchestrator holds a sender for as long as it runs.
    let _ = events.send(event);
}

async fn with_cancel<F>(cancel: &CancellationToken, fut: F) -> Result<TaskEvent, DestError>
where
    F: Future<Output = Result<TaskEvent, DestError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DestError::Cancelled),
        res = fut => res,
    }
}

async fn open_stream(ctx: &RunContext, stream: StreamKey) -> Result<TaskEvent, DestError> {
    ctx.processor.open(&stream).await?;
    tracing::info!(stream = %stream, "Stream opened");
    Ok(TaskEvent::StreamOpened(stream))
}

async fn spill_to_disk(
    ctx: &RunContext,
    stream: StreamKey,
    events: &mpsc::UnboundedSender<TaskEvent>,
) -> Result<TaskEvent, DestError> {
    let queue = ctx.queue(&stream)?;
    let window = ctx.config.spill_window();
    let mut seq = 0u64;

    loop {
        let mut chunk = queue
            .receive_chunk(ctx.config.bytes_per_spool_file, window)
            .await?;
        let spooled = spool::spill_records(&ctx.spool_dir, &stream, &chunk.records).await?;
        chunk.release_memory();

        if let Some(file) = spooled {
            if let Some(m) = ctx.metrics(&stream) {
                m.record_spooled(file.record_count());
            }
            tracing::debug!(
                stream = %stream,
                seq,
                range = %file.range(),
                bytes = file.byte_size(),
                "Batch spooled"
            );
            let env = BatchEnvelope::spooled(
                stream.clone(),
                seq,
                file,
                chunk.end_of_stream.is_some(),
            );
            seq += 1;
            if events.send(TaskEvent::BatchSpooled(env)).is_err() {
                return Err(DestError::Cancelled);
            }
        }

        if let Some(final_index) = chunk.end_of_stream {
            tracing::debug!(stream = %stream, final_index, batches = seq, "Spill complete");
            return Ok(TaskEvent::SpillComplete {
                stream,
                final_index,
            });
        }
    }
}

async fn process_records(
    ctx: &RunContext,
    mut env: BatchEnvelope,
) -> Result<TaskEvent, DestError> {
    let _permit = ctx
        .process_permits
        .acquire()
        .await
        .map_err(|_| DestError::Cancelled)?;

    let Some(file) = env.spool.take() else {
        return Err(DestError::Invariant(format!(
            "batch {} of stream {} has no spool file",
            env.seq, env.stream
        )));
    };
    let reader = file.reader()?;
    if let Some(m) = ctx.metrics(&env.stream) {
        m.record_process_call();
    }
    let batch = ctx
        .processor
        .process_records(&env.stream, reader, file.byte_size())
        .await?;
    // The processor consumed the reader; the spool file is deleted here.
    drop(file);
    env.advance(batch);
    Ok(TaskEvent::BatchProcessed(env))
}

async fn process_batch(ctx: &RunContext, mut env: BatchEnvelope) -> Result<TaskEvent, DestError> {
    let _permit = ctx
        .process_permits
        .acquire()
        .await
        .map_err(|_| DestError::Cancelled)?;
    if let Some(m) = ctx.metrics(&env.stream) {
        m.record_process_call();
    }
    let batch = ctx
        .processor
        .process_batch(&env.stream, env.batch.clone())
        .await?;
    env.advance(batch);
    Ok(TaskEvent::BatchProcessed(env))
}

async fn close_stream(ctx: &RunContext, stream: StreamKey) -> Result<TaskEvent, DestError> {
    ctx.processor.close(&stream, None).await?;
    Ok(TaskEvent::StreamClosed(stream))
}

async fn teardown(
    ctx: &RunContext,
    failure: Option<SyncFailure>,
) -> Result<TaskEvent, DestError> {
    let emitted = ctx.flush_checkpoints();
    if emitted > 0 {
        tracing::debug!(emitted, "Final checkpoint flush");
    }
    ctx.hooks.teardown(failure.as_ref()).await?;
    Ok(TaskEvent::TeardownComplete)
}

/// Runs a collaborator call on its own task. Failure handling must report
/// back even when the destination panics, so a panic becomes an error here.
async fn isolated<T, F>(fut: F) -> Result<T, DestError>
where
    F: Future<Output = Result<T, DestError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut).await?
}

async fn close_partial(ctx: &RunContext, failure: &StreamFailure) -> Result<(), DestError> {
    let processor = Arc::clone(&ctx.processor);
    let failure = failure.clone();
    isolated(async move { processor.close(&failure.stream, Some(&failure)).await }).await
}

async fn fail_stream(ctx: &RunContext, failure: StreamFailure, close: bool) -> TaskEvent {
    if close {
        if let Err(e) = close_partial(ctx, &failure).await {
            tracing::warn!(
                stream = %failure.stream,
                error = %e,
                "Failed to close stream with partial result"
            );
        }
    }
    tracing::warn!(
        stream = %failure.stream,
        persisted_records = failure.persisted_records,
        cause = %failure.cause,
        "Stream failed"
    );
    TaskEvent::StreamFailureHandled(failure.stream)
}

async fn fail_sync(
    ctx: &Arc<RunContext>,
    failure: SyncFailure,
    streams: Vec<StreamFailure>,
    run_teardown: bool,
) -> TaskEvent {
    let flush_ctx = Arc::clone(ctx);
    match isolated(async move { Ok(flush_ctx.flush_checkpoints()) }).await {
        Ok(0) => {}
        Ok(emitted) => {
            tracing::info!(emitted, "Emitted checkpoints persisted before the failure");
        }
        Err(e) => tracing::warn!(error = %e, "Final checkpoint flush failed"),
    }
    for partial in &streams {
        if let Err(e) = close_partial(ctx, partial).await {
            tracing::warn!(
                stream = %partial.stream,
                error = %e,
                "Failed to close stream with partial result"
            );
        }
    }
    if run_teardown {
        let hooks = Arc::clone(&ctx.hooks);
        if let Err(e) = isolated(async move { hooks.teardown(Some(&failure)).await }).await {
            tracing::warn!(error = %e, "Teardown after failure failed");
        }
    }
    TaskEvent::SyncFailureHandled
}
