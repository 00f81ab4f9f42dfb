use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use crate::types::Chunk;
use crate::{BufferPool, ProgressCheckpoint, SharedTransferState, TransferError};

/// Reads a local source file into pool buffers and hands them to a job.
///
/// Each chunk is at most one pool slot long. Blocks are opened in the
/// checkpoint window before the chunk covering them is inserted.
pub struct FileChunkProducer {
    file: tokio::fs::File,
    path: PathBuf,
    file_size: u64,
    offset: u64,
    pool: BufferPool,
}

impl FileChunkProducer {
    /// Opens `path` for chunked reading into `pool`.
    pub async fn open(path: &Path, pool: BufferPool) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_size,
            offset: 0,
            pool,
        })
    }

    /// Seeks to the given byte offset (for resume).
    pub async fn seek_to(&mut self, offset: u64) -> Result<(), TransferError> {
        let offset = offset.min(self.file_size);
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next chunk into a pool slot. Returns `None` at end of file.
    ///
    /// Waits for a free slot, so a slow writer throttles the producer.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }
        let mut buffer = self.pool.acquire().await?;
        let len = remaining.min(buffer.len() as u64) as usize;
        // A short read here means the source shrank underneath us; the
        // buffer goes back to the pool when it drops.
        self.file.read_exact(&mut buffer[..len]).await?;

        let chunk = Chunk::new(self.offset, buffer, len)?;
        self.offset += len as u64;
        Ok(Some(chunk))
    }

    /// Feeds the whole file, from the checkpoint's resume point, into `shared`.
    ///
    /// Returns the number of bytes produced.
    pub async fn run(
        mut self,
        checkpoint: &ProgressCheckpoint,
        shared: &SharedTransferState,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let start = checkpoint.resume_offset();
        self.seek_to(start).await?;
        tracing::debug!(source = %self.path.display(), start, size = self.file_size, "producer started");

        while self.remaining() > 0 {
            let next = tokio::select! {
                next = self.next_chunk() => next,
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                // Nothing was read yet, so the same offset is retried.
                Err(err) if err.is_retryable() => {
                    tracing::warn!(source = %self.path.display(), offset = self.offset, "{err}, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            };
            open_covered_blocks(checkpoint, chunk.start_offset(), chunk.end_offset())?;
            shared.insert_chunk(chunk)?;
        }
        Ok(self.offset - start)
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.file_size - self.offset
    }

    /// Source path, used as the job's source identity.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Opens the blocks `[start, end)` touches. Blocks below the entry offset
/// are already committed; a resume from an unaligned entry offset starts
/// inside one of them.
fn open_covered_blocks(checkpoint: &ProgressCheckpoint, start: u64, end: u64) -> Result<(), TransferError> {
    let block_size = checkpoint.block_size();
    let entry = checkpoint.entry_offset();
    let mut block = start - start % block_size;
    while block < end {
        if block < entry {
            block += block_size;
            continue;
        }
        checkpoint.mark_window_open(block)?;
        block += block_size;
    }
    Ok(())
}
