//! In-order committer for one job.
//!
//! ```text
//! OpenDestination ──► VerifyPriorContent ──► Write ──► Finished
//!        │            (resume + validation)    │
//!        └──────────────────┴──────────────────┴──► Error
//! ```
//!
//! The writer is driven from outside: a scheduler checks
//! [`has_work`](SequentialWriter::has_work) and calls
//! [`do_step`](SequentialWriter::do_step). Each step is one unit of async
//! work (open, start the prefix digest, or commit one chunk), so many
//! writers can share a scheduler without anyone blocking on a chunk that
//! has not been produced yet.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chunkflow_protocol::HashAlgorithm;

use crate::{
    Chunk, ContentHasher, Destination, DestinationStream, IncrementalHashStream,
    SharedTransferState, TransferError, TransferJob, validate_destination_path,
};

/// Receives the single completion notification of a writer.
pub type CompletionReceiver = oneshot::Receiver<Result<(), TransferError>>;

/// Hook consulted after every commit; returns how long to pause.
///
/// This is only the integration point for bandwidth limits; the writer
/// carries no policy of its own.
pub trait CommitThrottle: Send + Sync {
    fn delay_for(&self, committed_bytes: u64) -> Option<Duration>;
}

/// Lifecycle of a [`SequentialWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    OpenDestination,
    VerifyPriorContent,
    Write,
    Finished,
    Error,
}

impl WriterState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WriterState::Finished | WriterState::Error)
    }
}

/// Drains a job's [`SharedTransferState`] into its destination in offset order.
pub struct SequentialWriter {
    job: Arc<TransferJob>,
    job_id: String,
    shared: Arc<SharedTransferState>,
    algorithm: HashAlgorithm,
    cancel: CancellationToken,
    throttle: Option<Arc<dyn CommitThrottle>>,
    state: WriterState,
    destination: Option<Destination>,
    stream: Option<IncrementalHashStream>,
    /// Set when the writer opened the destination file itself.
    owned_path: Option<PathBuf>,
    sync_handle: Option<tokio::fs::File>,
    resume_offset: u64,
    expect_offset: u64,
    prefix_task: Option<JoinHandle<Result<ContentHasher, TransferError>>>,
    completion: Option<oneshot::Sender<Result<(), TransferError>>>,
}

impl SequentialWriter {
    /// Creates a writer in `OpenDestination` and the receiver for its
    /// completion notification.
    pub fn new(
        job: Arc<TransferJob>,
        shared: Arc<SharedTransferState>,
        destination: Destination,
        algorithm: HashAlgorithm,
        cancel: CancellationToken,
    ) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let job_id = job.id();
        let writer = Self {
            job,
            job_id,
            shared,
            algorithm,
            cancel,
            throttle: None,
            state: WriterState::OpenDestination,
            destination: Some(destination),
            stream: None,
            owned_path: None,
            sync_handle: None,
            resume_offset: 0,
            expect_offset: 0,
            prefix_task: None,
            completion: Some(tx),
        };
        (writer, rx)
    }

    /// Installs a commit throttle.
    pub fn with_throttle(mut self, throttle: Arc<dyn CommitThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Returns `true` once the writer reached `Finished` or `Error`.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns `true` when [`do_step`](Self::do_step) would make progress.
    ///
    /// In `Write` this is only the case when the payload is fully drained
    /// or the chunk at the expected offset has arrived.
    pub fn has_work(&self) -> bool {
        match self.state {
            WriterState::OpenDestination | WriterState::VerifyPriorContent => true,
            WriterState::Write => {
                self.expect_offset >= self.shared.total_length()
                    || self.shared.contains_chunk(self.expect_offset)
            }
            WriterState::Finished | WriterState::Error => false,
        }
    }

    /// Offset of the next chunk the writer will commit.
    pub fn expect_offset(&self) -> u64 {
        self.expect_offset
    }

    /// Offset the writer resumed from (0 for a fresh transfer).
    pub fn resume_offset(&self) -> u64 {
        self.resume_offset
    }

    pub fn job(&self) -> &Arc<TransferJob> {
        &self.job
    }

    pub fn shared(&self) -> &Arc<SharedTransferState> {
        &self.shared
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Digest of the committed content, once finalized.
    pub fn computed_digest(&self) -> Option<&str> {
        self.stream.as_ref().and_then(|s| s.digest())
    }

    /// Hands a caller-supplied stream back once the writer is terminal.
    ///
    /// Returns `None` for file destinations the writer opened itself.
    pub fn take_stream(&mut self) -> Option<Box<dyn DestinationStream>> {
        if !self.is_finished() || self.owned_path.is_some() {
            return None;
        }
        if let Some(Destination::Stream(stream)) = self.destination.take() {
            return Some(stream);
        }
        self.stream.take().map(IncrementalHashStream::into_inner)
    }

    /// Runs one step of the state machine and returns the new state.
    ///
    /// Failures never escape: they move the writer to `Error` and are
    /// delivered through the completion notification.
    pub async fn do_step(&mut self) -> WriterState {
        let result = match self.state {
            WriterState::OpenDestination => self.open_destination().await,
            WriterState::VerifyPriorContent => self.verify_prior_content().await,
            WriterState::Write => self.write_next().await,
            WriterState::Finished | WriterState::Error => Ok(()),
        };
        if let Err(err) = result {
            self.abort(err);
        }
        self.state
    }

    async fn open_destination(&mut self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let total = self.shared.total_length();
        let validate = self.shared.attributes().validate_content_hash;
        let resume = self.job.checkpoint().resume_offset().min(total);

        let inner: Box<dyn DestinationStream> = match self.destination.take() {
            Some(Destination::Path(path)) => {
                let file = open_destination_file(&path, total).await?;
                let sync_handle = file.try_clone().await.map_err(|source| {
                    TransferError::DestinationOpen {
                        path: path.clone(),
                        source,
                    }
                })?;
                self.sync_handle = Some(sync_handle);
                self.owned_path = Some(path);
                Box::new(file)
            }
            Some(Destination::Stream(stream)) => {
                if !stream.can_write() || !stream.can_seek() {
                    let reason = if stream.can_write() {
                        "stream is not seekable"
                    } else {
                        "stream is not writable"
                    };
                    // Keep the stream so the caller can take it back.
                    self.destination = Some(Destination::Stream(stream));
                    return Err(TransferError::UnsupportedDestination(reason.into()));
                }
                stream
            }
            None => {
                return Err(TransferError::InvariantViolation(
                    "destination opened twice".into(),
                ));
            }
        };

        self.stream = Some(IncrementalHashStream::new(inner, self.algorithm, resume));
        self.resume_offset = resume;
        self.expect_offset = resume;
        self.job.start(resume);

        info!(
            job = %self.job_id,
            destination = %self.job.destination(),
            total,
            resume,
            "destination opened"
        );

        self.state = if validate && resume > 0 {
            WriterState::VerifyPriorContent
        } else {
            WriterState::Write
        };
        Ok(())
    }

    /// Starts hashing `[0, resume)` so live commits can continue meanwhile.
    async fn verify_prior_content(&mut self) -> Result<(), TransferError> {
        let resume = self.resume_offset;
        let algorithm = self.algorithm;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransferError::InvariantViolation("no open destination".into()))?;
        stream.begin_separate();

        match &self.owned_path {
            Some(path) => {
                let path = path.clone();
                debug!(job = %self.job_id, resume, "hashing prior content in background");
                self.prefix_task = Some(tokio::spawn(async move {
                    let mut file = tokio::fs::File::open(&path).await?;
                    IncrementalHashStream::compute_separate_digest(&mut file, resume, algorithm)
                        .await
                }));
            }
            None => {
                // A caller stream has a single cursor, so the prefix is read
                // inline before any further commit moves it.
                let prefix = IncrementalHashStream::compute_separate_digest(
                    stream.get_mut(),
                    resume,
                    algorithm,
                )
                .await;
                match prefix {
                    Ok(hasher) => {
                        stream.fold_prefix(hasher, resume).await;
                    }
                    Err(err) => stream.fail(err.to_string()),
                }
            }
        }

        self.state = WriterState::Write;
        Ok(())
    }

    /// Folds in the background prefix digest if it is ready (or `wait`).
    async fn collect_prefix(&mut self, wait: bool) {
        let ready = match &self.prefix_task {
            Some(task) => wait || task.is_finished(),
            None => false,
        };
        if !ready {
            return;
        }
        let Some(task) = self.prefix_task.take() else {
            return;
        };
        let outcome = match task.await {
            Ok(result) => result,
            Err(join) => Err(TransferError::HashFailed(join.to_string())),
        };
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match outcome {
            Ok(hasher) => {
                if stream.fold_prefix(hasher, self.resume_offset).await {
                    debug!(job = %self.job_id, through = self.resume_offset, "prior content digest folded in");
                }
            }
            Err(err) => stream.fail(err.to_string()),
        }
    }

    async fn write_next(&mut self) -> Result<(), TransferError> {
        self.collect_prefix(false).await;

        let total = self.shared.total_length();
        if self.expect_offset >= total {
            return self.finalize().await;
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let Some(chunk) = self.shared.take_chunk(self.expect_offset) else {
            return Ok(());
        };

        let current = self.expect_offset;
        let advance = (chunk.len() as u64).min(total - current);
        self.expect_offset = current + advance;

        let committed = self.commit(&chunk, current, advance).await;
        // The slot goes back whether or not the commit succeeded.
        chunk.release();
        committed?;

        if self.expect_offset >= total {
            self.finalize().await?;
        }
        Ok(())
    }

    async fn commit(&mut self, chunk: &Chunk, current: u64, advance: u64) -> Result<(), TransferError> {
        let data = &chunk.data()[..advance as usize];
        {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| TransferError::InvariantViolation("no open destination".into()))?;
            stream.write(current, data).await?;
            if !stream.transform_block(current, data) {
                let fault = stream.fault().unwrap_or("content hash stream failed");
                return Err(TransferError::HashFailed(fault.to_string()));
            }
        }

        self.close_covered_blocks(current, current + advance);
        self.job.add_progress(advance);
        debug!(job = %self.job_id, offset = current, len = advance, "chunk committed");

        let delay = self.throttle.as_ref().and_then(|t| t.delay_for(advance));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Closes every checkpoint block that `[start, end)` completes.
    fn close_covered_blocks(&self, start: u64, end: u64) {
        let checkpoint = self.job.checkpoint();
        let block_size = checkpoint.block_size();
        let total = self.shared.total_length();
        let mut block_start = start - start % block_size;
        loop {
            let block_end = (block_start + block_size).min(total);
            if end < block_end {
                break;
            }
            let was_open = checkpoint.mark_window_closed(block_start, block_end);
            debug!(job = %self.job_id, block = block_start, was_open, "block closed");
            if block_end >= total {
                break;
            }
            block_start += block_size;
        }
    }

    async fn finalize(&mut self) -> Result<(), TransferError> {
        self.collect_prefix(true).await;

        let attributes = self.shared.attributes().clone();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransferError::InvariantViolation("no open destination".into()))?;
        stream.catch_up().await;
        if let Some(fault) = stream.fault() {
            return Err(TransferError::HashFailed(fault.to_string()));
        }
        let digest = stream.transform_final_block();

        let mismatch = match (attributes.validate_content_hash, attributes.content_hash) {
            (true, Some(expected)) if !expected.is_empty() => match digest {
                Some(actual) if actual == expected => None,
                Some(actual) => Some(TransferError::ContentMismatch {
                    expected,
                    actual,
                    source_identity: self.shared.source_identity().to_string(),
                }),
                None => {
                    return Err(TransferError::HashFailed(
                        "digest incomplete at end of payload".into(),
                    ));
                }
            },
            _ => None,
        };

        self.close_destination().await?;
        self.shared.discard_pending();
        self.state = WriterState::Finished;

        match mismatch {
            None => {
                self.job.complete();
                info!(job = %self.job_id, bytes = self.shared.total_length(), "transfer finished");
                self.notify(Ok(()));
            }
            Some(err) => {
                // The bytes stay where they are; only the outcome is flagged.
                self.job.fail(&err.to_string());
                warn!(job = %self.job_id, error = %err, "content integrity mismatch");
                self.notify(Err(err));
            }
        }
        Ok(())
    }

    /// Flushes the destination; closes and syncs it only if the writer opened it.
    async fn close_destination(&mut self) -> Result<(), TransferError> {
        if self.owned_path.is_some() {
            if let Some(stream) = self.stream.as_mut() {
                let inner = stream.get_mut();
                inner.flush().await?;
                inner.shutdown().await?;
            }
            if let Some(file) = self.sync_handle.take() {
                file.sync_all().await?;
            }
        } else if let Some(stream) = self.stream.as_mut() {
            stream.get_mut().flush().await?;
        }
        Ok(())
    }

    fn abort(&mut self, err: TransferError) {
        if let Some(task) = self.prefix_task.take() {
            task.abort();
        }
        let discarded = self.shared.discard_pending();
        if self.owned_path.is_some() {
            // Dropping the handles closes the file.
            self.stream = None;
            self.sync_handle = None;
        }
        self.state = WriterState::Error;

        if matches!(err, TransferError::Cancelled) {
            self.job.cancel();
            info!(job = %self.job_id, committed_through = self.expect_offset, "transfer cancelled");
        } else {
            self.job.fail(&err.to_string());
            error!(job = %self.job_id, error = %err, discarded, "transfer failed");
        }
        self.notify(Err(err));
    }

    fn notify(&mut self, result: Result<(), TransferError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

async fn open_destination_file(path: &Path, total: u64) -> Result<tokio::fs::File, TransferError> {
    validate_destination_path(path)?;
    let open_err = |source| TransferError::DestinationOpen {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(open_err)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(open_err)?;
    // Sparse pre-size; no zero-fill.
    file.set_len(total)
        .await
        .map_err(|source| TransferError::Preallocate {
            path: path.to_path_buf(),
            length: total,
            source,
        })?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, SeekFrom};
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::task::{Context, Poll};

    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

    use crate::{
        BufferPool, CheckpointRecord, DestinationAttributes, MemoryDestination, ProgressCheckpoint,
        TransferStatus, content_digest,
    };

    const BLOCK: u64 = 4096;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn pool() -> BufferPool {
        BufferPool::new(BLOCK as usize, 8, Duration::from_millis(50))
    }

    fn md5(data: &[u8]) -> String {
        content_digest(data, HashAlgorithm::Md5)
    }

    struct Fixture {
        writer: SequentialWriter,
        done: CompletionReceiver,
        job: Arc<TransferJob>,
        shared: Arc<SharedTransferState>,
    }

    fn fixture(
        total: u64,
        checkpoint: ProgressCheckpoint,
        attributes: DestinationAttributes,
        destination: Destination,
    ) -> Fixture {
        let job = Arc::new(TransferJob::with_id(
            "job-1",
            destination.describe(),
            total,
            checkpoint,
        ));
        let shared = Arc::new(SharedTransferState::new(total, attributes, "src://payload"));
        let (writer, done) = SequentialWriter::new(
            Arc::clone(&job),
            Arc::clone(&shared),
            destination,
            HashAlgorithm::Md5,
            CancellationToken::new(),
        );
        Fixture {
            writer,
            done,
            job,
            shared,
        }
    }

    /// Inserts the chunk covering `[offset, offset + BLOCK)` of `data`.
    async fn deliver(pool: &BufferPool, shared: &SharedTransferState, data: &[u8], offset: u64) {
        let start = offset as usize;
        let end = (start + BLOCK as usize).min(data.len());
        let mut buf = pool.acquire().await.unwrap();
        buf[..end - start].copy_from_slice(&data[start..end]);
        shared
            .insert_chunk(Chunk::new(offset, buf, end - start).unwrap())
            .unwrap();
    }

    async fn run_to_end(writer: &mut SequentialWriter) {
        while !writer.is_finished() {
            assert!(writer.has_work(), "writer stalled at {}", writer.expect_offset());
            writer.do_step().await;
        }
    }

    /// Memory destination that logs writes and can fail the n-th one.
    struct RecordingDestination {
        inner: MemoryDestination,
        position: u64,
        writes: Arc<Mutex<Vec<(u64, usize)>>>,
        fail_on_write: Option<usize>,
        write_calls: usize,
    }

    impl RecordingDestination {
        fn new(inner: MemoryDestination) -> (Self, Arc<Mutex<Vec<(u64, usize)>>>) {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let recorder = Self {
                inner,
                position: 0,
                writes: Arc::clone(&writes),
                fail_on_write: None,
                write_calls: 0,
            };
            (recorder, writes)
        }
    }

    impl DestinationStream for RecordingDestination {}

    impl AsyncRead for RecordingDestination {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for RecordingDestination {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let call = self.write_calls;
            self.write_calls += 1;
            if self.fail_on_write == Some(call) {
                return Poll::Ready(Err(io::Error::other("injected write failure")));
            }
            let position = self.position;
            self.writes.lock().unwrap().push((position, buf.len()));
            let written = Pin::new(&mut self.inner).poll_write(cx, buf);
            if let Poll::Ready(Ok(n)) = &written {
                self.position += *n as u64;
            }
            written
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl AsyncSeek for RecordingDestination {
        fn start_seek(mut self: Pin<&mut Self>, pos: SeekFrom) -> io::Result<()> {
            Pin::new(&mut self.inner).start_seek(pos)
        }

        fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
            let done = Pin::new(&mut self.inner).poll_complete(cx);
            if let Poll::Ready(Ok(pos)) = &done {
                self.position = *pos;
            }
            done
        }
    }

    #[tokio::test]
    async fn reverse_delivery_commits_in_order() {
        let data = payload(10_000);
        let pool = pool();
        let dest = MemoryDestination::new();
        let checkpoint = ProgressCheckpoint::new(BLOCK);
        for block in [0, 4096, 8192] {
            checkpoint.mark_window_open(block).unwrap();
        }
        let mut f = fixture(
            10_000,
            checkpoint,
            DestinationAttributes::validated(md5(&data)),
            Destination::stream(dest.clone()),
        );

        assert!(f.writer.has_work());
        assert_eq!(f.writer.do_step().await, WriterState::Write);
        assert!(!f.writer.has_work());

        deliver(&pool, &f.shared, &data, 8192).await;
        assert!(!f.writer.has_work());
        deliver(&pool, &f.shared, &data, 4096).await;
        assert!(!f.writer.has_work());
        // Out-of-turn chunks stay parked in the map.
        assert_eq!(f.shared.pending_offsets(), vec![4096, 8192]);

        deliver(&pool, &f.shared, &data, 0).await;
        assert!(f.writer.has_work());

        f.writer.do_step().await;
        assert_eq!(f.writer.expect_offset(), 4096);
        assert_eq!(f.job.checkpoint().snapshot(), CheckpointRecord::new(4096, [4096, 8192]));

        f.writer.do_step().await;
        assert_eq!(f.writer.expect_offset(), 8192);
        assert_eq!(f.job.checkpoint().snapshot(), CheckpointRecord::new(8192, [8192]));

        assert_eq!(f.writer.do_step().await, WriterState::Finished);
        assert_eq!(f.writer.expect_offset(), 10_000);
        assert_eq!(f.job.checkpoint().snapshot(), CheckpointRecord::new(10_000, []));

        assert!(f.done.await.unwrap().is_ok());
        assert_eq!(dest.contents(), data);
        assert_eq!(f.job.status(), TransferStatus::Completed);
        assert_eq!(f.job.transferred_bytes(), 10_000);
        assert_eq!(pool.metrics().outstanding(), 0);
        // Caller streams are flushed, never shut down.
        assert!(!dest.is_shut_down());
    }

    #[tokio::test]
    async fn any_delivery_order_reproduces_payload() {
        let data = payload(40_000);
        let offsets: Vec<u64> = (0..40_000u64).step_by(BLOCK as usize).collect();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..10 {
            let pool = BufferPool::new(BLOCK as usize, offsets.len(), Duration::from_millis(50));
            let dest = MemoryDestination::new();
            let mut f = fixture(
                40_000,
                ProgressCheckpoint::new(BLOCK),
                DestinationAttributes::validated(md5(&data)),
                Destination::stream(dest.clone()),
            );
            f.writer.do_step().await;

            let mut order = offsets.clone();
            order.shuffle(&mut rng);
            for offset in order {
                deliver(&pool, &f.shared, &data, offset).await;
                // Interleave a random number of writer steps.
                for _ in 0..rng.gen_range(0..3) {
                    if f.writer.has_work() {
                        f.writer.do_step().await;
                    }
                }
            }
            run_to_end(&mut f.writer).await;

            assert!(f.done.await.unwrap().is_ok());
            assert_eq!(dest.contents(), data);
            assert_eq!(pool.metrics().outstanding(), 0);
        }
    }

    #[tokio::test]
    async fn file_destination_is_presized_and_closed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/out.bin");
        let data = payload(10_000);
        let pool = pool();
        let mut f = fixture(
            10_000,
            ProgressCheckpoint::new(BLOCK),
            DestinationAttributes::validated(md5(&data)),
            Destination::Path(path.clone()),
        );

        f.writer.do_step().await;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10_000);
        // Held for the final sync_all.
        assert!(f.writer.sync_handle.is_some());

        for offset in [0, 4096, 8192] {
            deliver(&pool, &f.shared, &data, offset).await;
        }
        run_to_end(&mut f.writer).await;

        assert!(f.done.await.unwrap().is_ok());
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(f.writer.computed_digest(), Some(md5(&data).as_str()));
        // Owned files are never handed out.
        assert!(f.writer.take_stream().is_none());
    }

    #[tokio::test]
    async fn resume_from_mid_window_skips_prefix() {
        let data = payload(10_000);
        let pool = pool();
        // A previous run wrote block 0; the rest of the buffer is garbage.
        let mut prior = data[..4096].to_vec();
        prior.resize(10_000, 0xEE);
        let dest = MemoryDestination::with_contents(prior);
        let (recorder, writes) = RecordingDestination::new(dest.clone());

        let checkpoint =
            ProgressCheckpoint::from_record(&CheckpointRecord::new(0, [4096]), BLOCK);
        let mut f = fixture(
            10_000,
            checkpoint,
            DestinationAttributes::validated(md5(&data)),
            Destination::stream(recorder),
        );

        assert_eq!(f.writer.do_step().await, WriterState::VerifyPriorContent);
        assert_eq!(f.writer.resume_offset(), 4096);
        assert_eq!(f.job.transferred_bytes(), 4096);
        assert_eq!(f.writer.do_step().await, WriterState::Write);

        f.job.checkpoint().mark_window_open(8192).unwrap();
        deliver(&pool, &f.shared, &data, 8192).await;
        deliver(&pool, &f.shared, &data, 4096).await;
        run_to_end(&mut f.writer).await;

        assert!(f.done.await.unwrap().is_ok());
        assert_eq!(dest.contents(), data);
        assert!(writes.lock().unwrap().iter().all(|(pos, _)| *pos >= 4096));
        // Same digest as a from-scratch transfer.
        assert_eq!(f.writer.computed_digest(), Some(md5(&data).as_str()));
    }

    #[tokio::test]
    async fn resume_file_destination_hashes_prefix_in_background() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let data = payload(10_000);
        let mut prior = data[..4096].to_vec();
        prior.resize(10_000, 0);
        std::fs::write(&path, &prior).unwrap();

        let pool = pool();
        let checkpoint =
            ProgressCheckpoint::from_record(&CheckpointRecord::new(0, [4096]), BLOCK);
        let mut f = fixture(
            10_000,
            checkpoint,
            DestinationAttributes::validated(md5(&data)),
            Destination::Path(path.clone()),
        );

        f.writer.do_step().await;
        f.writer.do_step().await;
        assert_eq!(f.writer.state(), WriterState::Write);

        deliver(&pool, &f.shared, &data, 4096).await;
        deliver(&pool, &f.shared, &data, 8192).await;
        run_to_end(&mut f.writer).await;

        assert!(f.done.await.unwrap().is_ok());
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn short_caller_stream_fails_the_prefix_pass() {
        let data = payload(8192);
        let pool = pool();
        // Claims 4096 committed bytes but only holds 100.
        let dest = MemoryDestination::with_contents(data[..100].to_vec());
        let checkpoint = ProgressCheckpoint::from_record(&CheckpointRecord::new(4096, []), BLOCK);
        let mut f = fixture(
            8192,
            checkpoint,
            DestinationAttributes::validated(md5(&data)),
            Destination::stream(dest.clone()),
        );

        assert_eq!(f.writer.do_step().await, WriterState::VerifyPriorContent);
        assert_eq!(f.writer.do_step().await, WriterState::Write);

        deliver(&pool, &f.shared, &data, 4096).await;
        run_to_end(&mut f.writer).await;

        assert_eq!(f.writer.state(), WriterState::Error);
        assert!(matches!(f.done.await.unwrap(), Err(TransferError::HashFailed(_))));
        assert_eq!(f.job.status(), TransferStatus::Failed);
        assert_eq!(f.job.checkpoint().resume_offset(), 4096);
        assert_eq!(pool.metrics().outstanding(), 0);
    }

    #[tokio::test]
    async fn truncated_file_fails_the_background_prefix_pass() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let data = payload(4096);
        std::fs::write(&path, &data).unwrap();

        // Every block is already committed, so the next write step finalizes.
        let checkpoint = ProgressCheckpoint::from_record(&CheckpointRecord::new(4096, []), BLOCK);
        let mut f = fixture(
            4096,
            checkpoint,
            DestinationAttributes::validated(md5(&data)),
            Destination::Path(path.clone()),
        );

        assert_eq!(f.writer.do_step().await, WriterState::VerifyPriorContent);
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(100)
            .unwrap();
        assert_eq!(f.writer.do_step().await, WriterState::Write);
        run_to_end(&mut f.writer).await;

        assert_eq!(f.writer.state(), WriterState::Error);
        assert!(matches!(f.done.await.unwrap(), Err(TransferError::HashFailed(_))));
        assert_eq!(f.job.status(), TransferStatus::Failed);
        assert!(f.writer.computed_digest().is_none());
    }

    #[tokio::test]
    async fn resume_without_validation_skips_prior_content() {
        let data = payload(8192);
        let pool = pool();
        let dest = MemoryDestination::with_contents(data[..4096].to_vec());
        let checkpoint = ProgressCheckpoint::from_record(&CheckpointRecord::new(4096, []), BLOCK);
        let mut f = fixture(
            8192,
            checkpoint,
            DestinationAttributes::default(),
            Destination::stream(dest.clone()),
        );

        assert_eq!(f.writer.do_step().await, WriterState::Write);
        deliver(&pool, &f.shared, &data, 4096).await;
        run_to_end(&mut f.writer).await;

        assert!(f.done.await.unwrap().is_ok());
        assert_eq!(dest.contents(), data);
        // The digest only covers this run's bytes.
        assert_eq!(f.writer.computed_digest(), Some(md5(&data[4096..]).as_str()));
    }

    #[tokio::test]
    async fn digest_mismatch_keeps_bytes_and_reports_both_digests() {
        let data = payload(5000);
        let pool = pool();
        let dest = MemoryDestination::new();
        let wrong = md5(b"something else");
        let mut f = fixture(
            5000,
            ProgressCheckpoint::new(BLOCK),
            DestinationAttributes::validated(wrong.clone()),
            Destination::stream(dest.clone()),
        );

        f.writer.do_step().await;
        deliver(&pool, &f.shared, &data, 0).await;
        deliver(&pool, &f.shared, &data, 4096).await;
        run_to_end(&mut f.writer).await;

        assert_eq!(f.writer.state(), WriterState::Finished);
        match f.done.await.unwrap() {
            Err(TransferError::ContentMismatch {
                expected,
                actual,
                source_identity,
            }) => {
                assert_eq!(expected, wrong);
                assert_eq!(actual, md5(&data));
                assert_eq!(source_identity, "src://payload");
            }
            other => panic!("expected ContentMismatch, got {other:?}"),
        }
        assert_eq!(dest.contents(), data);
        assert_eq!(f.job.status(), TransferStatus::Failed);
        assert!(f.job.error().contains(&wrong));
    }

    #[tokio::test]
    async fn mismatch_is_ignored_when_validation_is_off() {
        let data = payload(100);
        let pool = pool();
        let mut f = fixture(
            100,
            ProgressCheckpoint::new(BLOCK),
            DestinationAttributes {
                content_hash: Some(md5(b"nope")),
                validate_content_hash: false,
            },
            Destination::stream(MemoryDestination::new()),
        );
        f.writer.do_step().await;
        deliver(&pool, &f.shared, &data, 0).await;
        run_to_end(&mut f.writer).await;
        assert!(f.done.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn empty_payload_finishes_immediately() {
        let mut f = fixture(
            0,
            ProgressCheckpoint::new(BLOCK),
            DestinationAttributes::validated(md5(b"")),
            Destination::stream(MemoryDestination::new()),
        );
        assert_eq!(f.writer.do_step().await, WriterState::Write);
        assert!(f.writer.has_work());
        assert_eq!(f.writer.do_step().await, WriterState::Finished);
        assert!(f.done.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unsupported_streams_are_rejected_and_returned() {
        let dest = MemoryDestination::new();
        for (stream, reason) in [
            (dest.read_only(), "not writable"),
            (dest.sequential(), "not seekable"),
        ] {
            let mut f = fixture(
                10,
                ProgressCheckpoint::new(BLOCK),
                DestinationAttributes::default(),
                Destination::stream(stream),
            );
            assert_eq!(f.writer.do_step().await, WriterState::Error);
            match f.done.await.unwrap() {
                Err(TransferError::UnsupportedDestination(msg)) => assert!(msg.contains(reason)),
                other => panic!("expected UnsupportedDestination, got {other:?}"),
            }
            assert!(f.writer.take_stream().is_some());
        }
    }

    #[tokio::test]
    async fn open_failure_carries_cause() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let mut f = fixture(
            10,
            ProgressCheckpoint::new(BLOCK),
            DestinationAttributes::default(),
            Destination::Path(blocker.join("child.bin")),
        );
        assert_eq!(f.writer.do_step().await, WriterState::Error);
        let err = f.done.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::DestinationOpen { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::Setup);
        assert_eq!(f.job.status(), TransferStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_before_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("never.bin");
        let mut f = fixture(
            10,
            ProgressCheckpoint::new(BLOCK),
            DestinationAttributes::default(),
            Destination::Path(path.clone()),
        );
        f.writer.cancel_token().cancel();
        assert_eq!(f.writer.do_step().await, WriterState::Error);
        assert!(matches!(f.done.await.unwrap(), Err(TransferError::Cancelled)));
        assert_eq!(f.job.status(), TransferStatus::Cancelled);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cancellation_between_commits_releases_parked_chunks() {
        let data = payload(12_288);
        let pool = pool();
        let mut f = fixture(
            12_288,
            ProgressCheckpoint::new(BLOCK),
            DestinationAttributes::validated(md5(&data)),
            Destination::stream(MemoryDestination::new()),
        );
        f.writer.do_step().await;
        for offset in [0, 4096, 8192] {
            deliver(&pool, &f.shared, &data, offset).await;
        }
        f.writer.do_step().await;
        assert_eq!(f.writer.expect_offset(), 4096);

        f.writer.cancel_token().cancel();
        assert_eq!(f.writer.do_step().await, WriterState::Error);
        assert!(matches!(f.done.await.unwrap(), Err(TransferError::Cancelled)));
        assert_eq!(f.shared.pending_chunks(), 0);
        assert_eq!(pool.metrics().outstanding(), 0);
        // Block 0 stays committed for a later resume.
        assert_eq!(f.job.checkpoint().resume_offset(), 4096);
    }

    #[tokio::test]
    async fn randomized_write_failures_never_leak_buffers() {
        let data = payload(32_768);
        let offsets: Vec<u64> = (0..32_768u64).step_by(BLOCK as usize).collect();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..20 {
            let pool = BufferPool::new(BLOCK as usize, offsets.len(), Duration::from_millis(50));
            let (mut recorder, _) = RecordingDestination::new(MemoryDestination::new());
            let fail_at = rng.gen_range(0..offsets.len() + 2);
            recorder.fail_on_write = Some(fail_at);

            let mut f = fixture(
                32_768,
                ProgressCheckpoint::new(BLOCK),
                DestinationAttributes::validated(md5(&data)),
                Destination::stream(recorder),
            );
            f.writer.do_step().await;

            let mut order = offsets.clone();
            order.shuffle(&mut rng);
            for offset in order {
                deliver(&pool, &f.shared, &data, offset).await;
            }
            run_to_end(&mut f.writer).await;

            let outcome = f.done.await.unwrap();
            if fail_at < offsets.len() {
                assert!(matches!(outcome, Err(TransferError::Io(_))));
                assert_eq!(f.writer.state(), WriterState::Error);
            } else {
                assert!(outcome.is_ok());
            }
            let m = pool.metrics();
            assert_eq!(m.acquired, offsets.len() as u64);
            assert_eq!(m.acquired, m.released);
            assert_eq!(pool.available(), offsets.len());
        }
    }

    #[tokio::test]
    async fn chunk_spanning_blocks_closes_each() {
        let data = payload(3000);
        let pool = BufferPool::new(4096, 1, Duration::from_millis(50));
        let checkpoint = ProgressCheckpoint::new(1024);
        for block in [0, 1024, 2048] {
            checkpoint.mark_window_open(block).unwrap();
        }
        let mut f = fixture(
            3000,
            checkpoint,
            DestinationAttributes::validated(md5(&data)),
            Destination::stream(MemoryDestination::new()),
        );
        f.writer.do_step().await;

        let mut buf = pool.acquire().await.unwrap();
        buf[..3000].copy_from_slice(&data);
        f.shared.insert_chunk(Chunk::new(0, buf, 3000).unwrap()).unwrap();
        run_to_end(&mut f.writer).await;

        assert!(f.done.await.unwrap().is_ok());
        assert_eq!(f.job.checkpoint().snapshot(), CheckpointRecord::new(3000, []));
    }

    #[tokio::test]
    async fn throttle_is_consulted_per_commit() {
        struct Recorder(AtomicU64);
        impl CommitThrottle for Recorder {
            fn delay_for(&self, committed_bytes: u64) -> Option<Duration> {
                self.0.fetch_add(committed_bytes, Ordering::Relaxed);
                Some(Duration::from_millis(1))
            }
        }

        let data = payload(6000);
        let pool = pool();
        let recorder = Arc::new(Recorder(AtomicU64::new(0)));
        let f = fixture(
            6000,
            ProgressCheckpoint::new(BLOCK),
            DestinationAttributes::default(),
            Destination::stream(MemoryDestination::new()),
        );
        let mut writer = f.writer.with_throttle(recorder.clone());
        writer.do_step().await;
        deliver(&pool, &f.shared, &data, 0).await;
        deliver(&pool, &f.shared, &data, 4096).await;
        run_to_end(&mut writer).await;

        assert!(f.done.await.unwrap().is_ok());
        assert_eq!(recorder.0.load(Ordering::Relaxed), 6000);
    }

    #[tokio::test]
    async fn steps_after_terminal_are_noops() {
        let mut f = fixture(
            0,
            ProgressCheckpoint::new(BLOCK),
            DestinationAttributes::default(),
            Destination::stream(MemoryDestination::new()),
        );
        run_to_end(&mut f.writer).await;
        assert!(!f.writer.has_work());
        assert_eq!(f.writer.do_step().await, WriterState::Finished);
        assert!(f.writer.take_stream().is_some());
    }
}
