//! Per-job state shared between producers and the writer.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::{Chunk, TransferError};

/// What the destination is expected to contain once the transfer finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationAttributes {
    /// Canonical (base64) digest advertised by the source, if any.
    pub content_hash: Option<String>,
    /// Compare the computed digest against `content_hash` at finalize.
    pub validate_content_hash: bool,
}

impl DestinationAttributes {
    /// Attributes that request validation against `content_hash`.
    pub fn validated(content_hash: impl Into<String>) -> Self {
        Self {
            content_hash: Some(content_hash.into()),
            validate_content_hash: true,
        }
    }
}

/// Chunks produced for one job, keyed by start offset.
///
/// Producers insert; the writer removes each key at most once and becomes
/// the exclusive owner of the chunk's buffer.
#[derive(Debug)]
pub struct SharedTransferState {
    total_length: u64,
    attributes: DestinationAttributes,
    source_identity: String,
    chunks: Mutex<ChunkMap>,
    arrived: Notify,
}

#[derive(Debug, Default)]
struct ChunkMap {
    pending: BTreeMap<u64, Chunk>,
    /// Everything below this offset has already been taken by the writer.
    drained_through: u64,
}

impl SharedTransferState {
    pub fn new(
        total_length: u64,
        attributes: DestinationAttributes,
        source_identity: impl Into<String>,
    ) -> Self {
        Self {
            total_length,
            attributes,
            source_identity: source_identity.into(),
            chunks: Mutex::new(ChunkMap::default()),
            arrived: Notify::new(),
        }
    }

    /// Total payload length in bytes.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Expected digest and validation toggle.
    pub fn attributes(&self) -> &DestinationAttributes {
        &self.attributes
    }

    /// Source description used in diagnostics.
    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    /// Hands a chunk to the writer.
    ///
    /// The chunk is keyed by its own start offset, so key and chunk can
    /// never disagree.
    ///
    /// # Errors
    ///
    /// Inserting an offset that is already pending, that the writer has
    /// already taken, or that lies past the end of the payload breaks the
    /// producer contract. So does an empty chunk inside the payload, which
    /// would park the writer at its offset forever. Debug builds assert; release builds reject the
    /// chunk (returning its buffer to the pool) and leave the destination
    /// untouched.
    pub fn insert_chunk(&self, chunk: Chunk) -> Result<(), TransferError> {
        let offset = chunk.start_offset();
        {
            let mut map = self.chunks.lock().unwrap();
            let problem = if offset < map.drained_through {
                Some(format!(
                    "chunk at {offset} re-inserted after the writer drained through {}",
                    map.drained_through
                ))
            } else if map.pending.contains_key(&offset) {
                Some(format!("duplicate chunk at {offset}"))
            } else if offset < self.total_length && chunk.is_empty() {
                Some(format!("empty chunk at {offset} inside payload of {}", self.total_length))
            } else if offset >= self.total_length && !chunk.is_empty() {
                Some(format!(
                    "chunk at {offset} starts past payload end {}",
                    self.total_length
                ))
            } else {
                None
            };
            if let Some(problem) = problem {
                drop(map);
                tracing::warn!(offset, source = %self.source_identity, "{problem}");
                debug_assert!(false, "{problem}");
                return Err(TransferError::InvariantViolation(problem));
            }
            map.pending.insert(offset, chunk);
        }
        self.arrived.notify_one();
        Ok(())
    }

    /// Removes the chunk starting at `offset`, if present.
    pub fn take_chunk(&self, offset: u64) -> Option<Chunk> {
        let mut map = self.chunks.lock().unwrap();
        let chunk = map.pending.remove(&offset)?;
        if !chunk.is_empty() {
            map.drained_through = map.drained_through.max(chunk.end_offset());
        }
        Some(chunk)
    }

    /// Returns `true` if a chunk starting at `offset` is waiting.
    pub fn contains_chunk(&self, offset: u64) -> bool {
        self.chunks.lock().unwrap().pending.contains_key(&offset)
    }

    /// Number of chunks waiting for the writer.
    pub fn pending_chunks(&self) -> usize {
        self.chunks.lock().unwrap().pending.len()
    }

    /// Start offsets of the waiting chunks, ascending.
    pub fn pending_offsets(&self) -> Vec<u64> {
        self.chunks.lock().unwrap().pending.keys().copied().collect()
    }

    /// Drops every waiting chunk, returning their buffers to the pool.
    ///
    /// Used when the job ends without draining the map.
    pub fn discard_pending(&self) -> usize {
        let drained = std::mem::take(&mut self.chunks.lock().unwrap().pending);
        let count = drained.len();
        for chunk in drained.into_values() {
            chunk.release();
        }
        count
    }

    /// Waits until a producer inserts a chunk.
    ///
    /// A wake-up that happened while nobody was waiting is remembered, so
    /// checking for work and then calling this cannot miss an insertion.
    pub async fn chunk_arrived(&self) {
        self.arrived.notified().await;
    }

    /// Wakes the writer without inserting anything.
    pub fn wake(&self) {
        self.arrived.notify_one();
    }
}
