use std::sync::RwLock;

use chrono::{DateTime, Utc};

use chunkflow_protocol::{TransferProgress, TransferStatus};

use crate::pool::PooledBuffer;
use crate::{ProgressCheckpoint, SpeedCalculator, TransferError};

/// A contiguous slice of the payload travelling from a producer to the writer.
///
/// The chunk owns its pool slot until the writer releases it.
#[derive(Debug)]
pub struct Chunk {
    start_offset: u64,
    buffer: PooledBuffer,
    length: usize,
}

impl Chunk {
    /// Wraps the first `length` bytes of `buffer` as payload starting at `start_offset`.
    pub fn new(start_offset: u64, buffer: PooledBuffer, length: usize) -> Result<Self, TransferError> {
        if length > buffer.len() {
            return Err(TransferError::InvariantViolation(format!(
                "chunk at {start_offset} claims {length} bytes but its buffer holds {}",
                buffer.len()
            )));
        }
        Ok(Self {
            start_offset,
            buffer,
            length,
        })
    }

    /// Byte offset of the first byte within the payload.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Number of payload bytes carried.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` for a zero-length chunk.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Offset one past the last byte.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.length as u64
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Returns the slot to the pool, consuming the chunk.
    pub fn release(self) {
        self.buffer.release();
    }
}

/// One source-to-destination transfer (thread-safe).
///
/// Owned by the controller; the writer only holds a shared reference.
pub struct TransferJob {
    checkpoint: ProgressCheckpoint,
    speed: SpeedCalculator,
    inner: RwLock<JobInner>,
}

struct JobInner {
    id: String,
    destination: String,
    status: TransferStatus,
    total_bytes: u64,
    transferred_bytes: u64,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error: String,
}

impl TransferJob {
    /// Creates a pending job with a fresh id.
    pub fn new(destination: impl Into<String>, total_bytes: u64, checkpoint: ProgressCheckpoint) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            destination,
            total_bytes,
            checkpoint,
        )
    }

    /// Creates a pending job with a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        destination: impl Into<String>,
        total_bytes: u64,
        checkpoint: ProgressCheckpoint,
    ) -> Self {
        Self {
            checkpoint,
            speed: SpeedCalculator::default(),
            inner: RwLock::new(JobInner {
                id: id.into(),
                destination: destination.into(),
                status: TransferStatus::Pending,
                total_bytes,
                transferred_bytes: 0,
                started_at: None,
                updated_at: Utc::now(),
                completed_at: None,
                error: String::new(),
            }),
        }
    }

    /// Marks the job as in progress.
    ///
    /// Bytes below the resume point count as already transferred.
    pub fn start(&self, resumed_from: u64) {
        let mut s = self.inner.write().unwrap();
        s.status = TransferStatus::InProgress;
        s.transferred_bytes = resumed_from.min(s.total_bytes);
        let now = Utc::now();
        s.started_at = Some(now);
        s.updated_at = now;
    }

    /// Records `bytes` newly committed to the destination.
    pub fn add_progress(&self, bytes: u64) {
        {
            let mut s = self.inner.write().unwrap();
            s.transferred_bytes = (s.transferred_bytes + bytes).min(s.total_bytes);
            s.updated_at = Utc::now();
        }
        self.speed.record(bytes);
    }

    /// Marks the job as completed.
    pub fn complete(&self) {
        self.finish(TransferStatus::Completed, String::new());
    }

    /// Marks the job as failed with an error message.
    pub fn fail(&self, err: &str) {
        self.finish(TransferStatus::Failed, err.to_string());
    }

    /// Marks the job as cancelled.
    pub fn cancel(&self) {
        self.finish(TransferStatus::Cancelled, String::new());
    }

    fn finish(&self, status: TransferStatus, error: String) {
        let mut s = self.inner.write().unwrap();
        s.status = status;
        s.error = error;
        let now = Utc::now();
        s.completed_at = Some(now);
        s.updated_at = now;
    }

    /// Returns current progress as a protocol-compatible struct.
    pub fn progress(&self) -> TransferProgress {
        let s = self.inner.read().unwrap();
        let eta_seconds = match s.status {
            TransferStatus::InProgress => self
                .speed
                .eta(s.total_bytes.saturating_sub(s.transferred_bytes))
                .map(|eta| eta.as_secs_f64()),
            _ => None,
        };
        TransferProgress {
            job_id: s.id.clone(),
            status: s.status.clone(),
            total_bytes: s.total_bytes,
            transferred_bytes: s.transferred_bytes,
            bytes_per_second: self.speed.bytes_per_second(),
            started_at: s.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            updated_at: s.updated_at.to_rfc3339(),
            error: s.error.clone(),
            entry_offset: self.checkpoint.entry_offset(),
            open_blocks: self.checkpoint.open_blocks(),
            eta_seconds,
        }
    }

    /// Progress checkpoint owned by this job.
    pub fn checkpoint(&self) -> &ProgressCheckpoint {
        &self.checkpoint
    }

    /// Returns `true` if the job is pending or in progress.
    pub fn is_active(&self) -> bool {
        let s = self.inner.read().unwrap();
        matches!(s.status, TransferStatus::Pending | TransferStatus::InProgress)
    }

    /// Returns the job id.
    pub fn id(&self) -> String {
        self.inner.read().unwrap().id.clone()
    }

    /// Human-readable destination description.
    pub fn destination(&self) -> String {
        self.inner.read().unwrap().destination.clone()
    }

    /// Returns the current status.
    pub fn status(&self) -> TransferStatus {
        self.inner.read().unwrap().status.clone()
    }

    /// Returns the error message of a failed job (empty otherwise).
    pub fn error(&self) -> String {
        self.inner.read().unwrap().error.clone()
    }

    /// Returns total bytes to transfer.
    pub fn total_bytes(&self) -> u64 {
        self.inner.read().unwrap().total_bytes
    }

    /// Returns bytes transferred so far.
    pub fn transferred_bytes(&self) -> u64 {
        self.inner.read().unwrap().transferred_bytes
    }

    /// Time the job reached a terminal state, if it has.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap().completed_at
    }
}
