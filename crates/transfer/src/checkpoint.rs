//! Resumable progress record for one job.
//!
//! Producers open a block in the window before dispatching it; the writer
//! closes it once every byte of the block is on the destination. Because
//! blocks are dispatched in increasing order and only closed when fully
//! committed, the lowest open block is always the first gap, which makes it
//! the exact resume point.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use chunkflow_protocol::CheckpointRecord;

use crate::TransferError;

/// Thread-safe transfer window plus contiguous low-water mark.
#[derive(Debug)]
pub struct ProgressCheckpoint {
    block_size: u64,
    inner: Mutex<WindowInner>,
}

#[derive(Debug, Default)]
struct WindowInner {
    entry_offset: u64,
    window: BTreeSet<u64>,
}

impl ProgressCheckpoint {
    /// Creates an empty checkpoint for a transfer starting at offset 0.
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size: block_size.max(1),
            inner: Mutex::new(WindowInner::default()),
        }
    }

    /// Rebuilds a checkpoint from its persisted form.
    ///
    /// Window offsets that are not block-aligned are dropped with a warning
    /// and the entry offset is lowered to the resume point if it was ahead.
    pub fn from_record(record: &CheckpointRecord, block_size: u64) -> Self {
        let block_size = block_size.max(1);
        let mut window = BTreeSet::new();
        for &offset in &record.transfer_window {
            if offset % block_size == 0 {
                window.insert(offset);
            } else {
                tracing::warn!(offset, block_size, "dropping unaligned window offset");
            }
        }
        let mut entry_offset = record.entry_offset;
        if let Some(&lowest) = window.first() {
            entry_offset = entry_offset.min(lowest);
        }
        Self {
            block_size,
            inner: Mutex::new(WindowInner {
                entry_offset,
                window,
            }),
        }
    }

    /// Block size the window is aligned to.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Marks the block at `block_offset` as dispatched to a producer.
    ///
    /// Re-opening a block that is still open (a producer retry) is a no-op.
    ///
    /// # Errors
    ///
    /// The offset must be block-aligned and must not belong to a block that
    /// was already closed.
    pub fn mark_window_open(&self, block_offset: u64) -> Result<(), TransferError> {
        if block_offset % self.block_size != 0 {
            return Err(TransferError::InvariantViolation(format!(
                "window offset {block_offset} is not aligned to {}",
                self.block_size
            )));
        }
        let mut s = self.inner.lock().unwrap();
        if block_offset < s.entry_offset {
            return Err(TransferError::InvariantViolation(format!(
                "block {block_offset} is already committed (entry offset {})",
                s.entry_offset
            )));
        }
        s.window.insert(block_offset);
        Ok(())
    }

    /// Marks the block at `block_offset` as fully written through `block_end`.
    ///
    /// Returns `false` if the block was not open. Since commits happen in
    /// offset order, every byte below `block_end` is durable afterwards, so
    /// the entry offset advances to it.
    pub fn mark_window_closed(&self, block_offset: u64, block_end: u64) -> bool {
        let mut s = self.inner.lock().unwrap();
        let was_open = s.window.remove(&block_offset);
        if s.entry_offset < block_end {
            s.entry_offset = block_end;
        }
        was_open
    }

    /// Offset a transfer should resume from.
    pub fn resume_offset(&self) -> u64 {
        let s = self.inner.lock().unwrap();
        s.window.first().copied().unwrap_or(s.entry_offset)
    }

    /// Low-water mark below which all bytes are written.
    pub fn entry_offset(&self) -> u64 {
        self.inner.lock().unwrap().entry_offset
    }

    /// Number of blocks currently open.
    pub fn open_blocks(&self) -> usize {
        self.inner.lock().unwrap().window.len()
    }

    /// Returns `true` if `block_offset` is currently open.
    pub fn is_open(&self, block_offset: u64) -> bool {
        self.inner.lock().unwrap().window.contains(&block_offset)
    }

    /// Consistent snapshot for persistence.
    pub fn snapshot(&self) -> CheckpointRecord {
        let s = self.inner.lock().unwrap();
        CheckpointRecord {
            entry_offset: s.entry_offset,
            transfer_window: s.window.iter().copied().collect(),
        }
    }

    /// Writes the current snapshot to `path` as JSON.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "checkpoint saved");
        Ok(())
    }

    /// Loads a checkpoint previously written by [`save`](Self::save).
    ///
    /// A missing file yields a fresh checkpoint.
    pub fn load(path: &Path, block_size: u64) -> Result<Self, TransferError> {
        if !path.exists() {
            return Ok(Self::new(block_size));
        }
        let content = std::fs::read_to_string(path)?;
        let record: CheckpointRecord = serde_json::from_str(&content)?;
        Ok(Self::from_record(&record, block_size))
    }
}
