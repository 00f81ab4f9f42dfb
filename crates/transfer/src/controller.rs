//! Runs jobs: one writer task per job, parked between chunks.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    BufferPool, CommitThrottle, CompletionReceiver, Destination, DestinationAttributes,
    FileChunkProducer, ProgressCheckpoint, ProgressTracker, SequentialWriter,
    SharedTransferState, TransferConfig, TransferError, TransferJob,
};

/// Steps `writer` until it reaches a terminal state.
///
/// Between steps the task parks until a chunk arrives or the writer's
/// token is cancelled, so idle jobs cost nothing.
pub async fn drive(mut writer: SequentialWriter) -> SequentialWriter {
    let shared = Arc::clone(writer.shared());
    let cancel = writer.cancel_token().clone();

    while !writer.is_finished() {
        if writer.has_work() {
            writer.do_step().await;
            continue;
        }
        tokio::select! {
            _ = shared.chunk_arrived() => {}
            _ = cancel.cancelled() => {
                // The writer notices the token on its next step.
                writer.do_step().await;
            }
        }
    }
    writer
}

/// Owns the shared buffer pool and starts jobs against it.
pub struct TransferController {
    config: TransferConfig,
    pool: BufferPool,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    throttle: Option<Arc<dyn CommitThrottle>>,
}

impl TransferController {
    pub fn new(config: TransferConfig) -> Self {
        let pool = config.build_pool();
        let tracker = Arc::new(ProgressTracker::new(config.progress_interval));
        Self {
            config,
            pool,
            tracker,
            cancel: CancellationToken::new(),
            throttle: None,
        }
    }

    /// Installs a commit throttle used by every job started afterwards.
    pub fn with_throttle(mut self, throttle: Arc<dyn CommitThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Pool producers must draw chunk buffers from.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Creates a fresh checkpoint aligned to the configured block size.
    pub fn new_checkpoint(&self) -> ProgressCheckpoint {
        ProgressCheckpoint::new(self.config.block_size)
    }

    /// Starts a writer for a payload of `total_length` bytes.
    ///
    /// The caller produces chunks into [`TransferHandle::shared`] using
    /// buffers from [`pool`](Self::pool), opening each block in the job's
    /// checkpoint before inserting it.
    pub fn start_job(
        &self,
        destination: Destination,
        total_length: u64,
        attributes: DestinationAttributes,
        source_identity: &str,
        checkpoint: ProgressCheckpoint,
    ) -> TransferHandle {
        let job = Arc::new(TransferJob::new(
            destination.describe(),
            total_length,
            checkpoint,
        ));
        let shared = Arc::new(SharedTransferState::new(
            total_length,
            attributes,
            source_identity,
        ));
        let cancel = self.cancel.child_token();

        let (mut writer, completion) = SequentialWriter::new(
            Arc::clone(&job),
            Arc::clone(&shared),
            destination,
            self.config.hash_algorithm,
            cancel.clone(),
        );
        if let Some(throttle) = &self.throttle {
            writer = writer.with_throttle(Arc::clone(throttle));
        }

        self.tracker.track(Arc::clone(&job));
        self.tracker.ensure_running();
        tracing::info!(job = %job.id(), source = source_identity, total_length, "job started");

        let tracker = Arc::clone(&self.tracker);
        let job_id = job.id();
        let stop_producers = cancel.clone();
        let task = tokio::spawn(async move {
            let writer = drive(writer).await;
            // Producers of a finished job have nothing left to feed.
            stop_producers.cancel();
            tracker.finish(&job_id);
            writer
        });

        TransferHandle {
            job,
            shared,
            cancel,
            completion,
            task,
            producer: None,
        }
    }

    /// Copies the local file at `source` into `destination`.
    ///
    /// Resumes from `checkpoint` when it carries progress. With
    /// `expected_digest` set and validation enabled, the finished content
    /// is checked against it.
    pub async fn transfer_file(
        &self,
        source: &Path,
        destination: Destination,
        expected_digest: Option<String>,
        checkpoint: ProgressCheckpoint,
    ) -> Result<TransferHandle, TransferError> {
        let producer = FileChunkProducer::open(source, self.pool.clone()).await?;
        let attributes = DestinationAttributes {
            content_hash: expected_digest,
            validate_content_hash: self.config.validate_content_hash,
        };
        let source_identity = source.display().to_string();
        let mut handle = self.start_job(
            destination,
            producer.file_size(),
            attributes,
            &source_identity,
            checkpoint,
        );

        let job = Arc::clone(&handle.job);
        let shared = Arc::clone(&handle.shared);
        let cancel = handle.cancel.clone();
        handle.producer = Some(tokio::spawn(async move {
            let result = producer.run(job.checkpoint(), &shared, &cancel).await;
            if let Err(err) = &result {
                if !matches!(err, TransferError::Cancelled) {
                    tracing::error!(job = %job.id(), error = %err, "producer failed");
                    // The writer would otherwise wait for chunks forever.
                    cancel.cancel();
                }
            }
            result
        }));
        Ok(handle)
    }

    /// Cancels every running job and stops periodic progress reports.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.stop();
    }
}

/// Handle to one running job.
pub struct TransferHandle {
    job: Arc<TransferJob>,
    shared: Arc<SharedTransferState>,
    cancel: CancellationToken,
    completion: CompletionReceiver,
    task: JoinHandle<SequentialWriter>,
    producer: Option<JoinHandle<Result<u64, TransferError>>>,
}

impl TransferHandle {
    pub fn job(&self) -> &Arc<TransferJob> {
        &self.job
    }

    /// Chunk map the job's producers insert into.
    pub fn shared(&self) -> &Arc<SharedTransferState> {
        &self.shared
    }

    /// Token cancelled when the job is cancelled or ends.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the job to end and returns its outcome.
    pub async fn join(self) -> Result<(), TransferError> {
        self.join_with_writer().await.0
    }

    /// Like [`join`](Self::join), but also returns the writer, e.g. to take
    /// back a caller-supplied stream. The writer is `None` if its task
    /// panicked.
    pub async fn join_with_writer(self) -> (Result<(), TransferError>, Option<SequentialWriter>) {
        let writer = match self.task.await {
            Ok(writer) => Some(writer),
            Err(err) => {
                tracing::error!(job = %self.job.id(), "writer task failed: {err}");
                None
            }
        };
        let mut result = match self.completion.await {
            Ok(result) => result,
            Err(_) => Err(TransferError::InvariantViolation(
                "writer ended without reporting completion".into(),
            )),
        };

        if let Some(producer) = self.producer {
            let produced = match producer.await {
                Ok(produced) => produced,
                Err(err) => Err(TransferError::InvariantViolation(format!(
                    "producer task failed: {err}"
                ))),
            };
            // A producer failure surfaces as a cancelled writer; report the cause.
            if let Err(cause) = produced {
                let writer_cancelled = matches!(result, Err(TransferError::Cancelled));
                if writer_cancelled && !matches!(cause, TransferError::Cancelled) {
                    self.job.fail(&cause.to_string());
                    result = Err(cause);
                }
            }
        }
        (result, writer)
    }
}
