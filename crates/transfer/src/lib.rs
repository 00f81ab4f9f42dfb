//! Sequential chunked writer with resume support and integrity checks.
//!
//! Producers insert chunks for a job in any order; the [`SequentialWriter`]
//! commits them to the destination strictly by offset, closes blocks in the
//! [`ProgressCheckpoint`] as they become durable, and feeds committed bytes
//! through an [`IncrementalHashStream`] so the final digest can be compared
//! with the one the source advertised.

mod checkpoint;
mod chunked;
mod config;
mod controller;
mod destination;
mod hash;
mod pool;
mod progress;
mod state;
mod types;
mod validation;
mod writer;

use std::path::PathBuf;
use std::time::Duration;

pub use checkpoint::ProgressCheckpoint;
pub use chunked::FileChunkProducer;
pub use config::TransferConfig;
pub use controller::{TransferController, TransferHandle, drive};
pub use destination::{Destination, DestinationStream, MemoryDestination};
pub use hash::{ContentHasher, IncrementalHashStream, content_digest, file_content_digest};
pub use pool::{BufferPool, PoolMetrics, PooledBuffer};
pub use progress::{ProgressCallback, ProgressTracker, SpeedCalculator};
pub use state::{DestinationAttributes, SharedTransferState};
pub use types::{Chunk, TransferJob};
pub use validation::validate_destination_path;
pub use writer::{CommitThrottle, CompletionReceiver, SequentialWriter, WriterState};

pub use chunkflow_protocol::{CheckpointRecord, HashAlgorithm, TransferProgress, TransferStatus};

/// Default block size: 4 MiB.
///
/// Blocks are the unit tracked in the checkpoint window.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Default chunk (pool slot) size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default number of pool slots shared by all jobs.
pub const DEFAULT_POOL_SLOTS: usize = 16;

/// Broad classification of a [`TransferError`].
///
/// The controller only looks at the kind when deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Destination could not be prepared. Fatal to the job.
    Setup,
    /// Computed digest differs from the expected one. Bytes stay written.
    Integrity,
    /// Buffer pool exhausted. Back off and retry.
    Resource,
    /// A producer/writer contract was broken.
    Invariant,
    /// Cooperative cancellation.
    Cancelled,
    /// I/O failure while committing bytes.
    Io,
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to open destination {path}: {source}")]
    DestinationOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to pre-size destination {path} to {length} bytes: {source}")]
    Preallocate {
        path: PathBuf,
        length: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported destination: {0}")]
    UnsupportedDestination(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("content mismatch for {source_identity}: expected {expected}, computed {actual}")]
    ContentMismatch {
        expected: String,
        actual: String,
        source_identity: String,
    },

    #[error("buffer pool exhausted ({slots} slots, waited {waited:?})")]
    PoolExhausted { slots: usize, waited: Duration },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("hash calculation failed: {0}")]
    HashFailed(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Returns the classification the controller acts on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::DestinationOpen { .. }
            | TransferError::Preallocate { .. }
            | TransferError::UnsupportedDestination(_)
            | TransferError::InvalidPath(_)
            | TransferError::Json(_) => ErrorKind::Setup,
            TransferError::ContentMismatch { .. } => ErrorKind::Integrity,
            TransferError::PoolExhausted { .. } => ErrorKind::Resource,
            TransferError::InvariantViolation(_) => ErrorKind::Invariant,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::Io(_) | TransferError::HashFailed(_) => ErrorKind::Io,
        }
    }

    /// Only pool exhaustion is transient from this crate's point of view.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Resource
    }
}
