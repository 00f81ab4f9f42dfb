//! Write-through destination wrapper with a running content digest.
//!
//! Bytes are written with [`IncrementalHashStream::write`] and then fed to
//! the digest with [`IncrementalHashStream::transform_block`]. The digest
//! only advances at its cursor; blocks that arrive early are held until the
//! gap before them is filled. On resume the prefix already on disk is hashed
//! separately ([`compute_separate_digest`](IncrementalHashStream::compute_separate_digest))
//! and folded in, so the write path never re-reads it.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt};

use chunkflow_protocol::HashAlgorithm;

use crate::{DestinationStream, TransferError};

/// Read size for the separate prefix pass (64 KiB).
const PREFIX_READ_SIZE: usize = 64 * 1024;

/// Bytes a stream copies while its digest cannot advance (16 MiB).
///
/// Past this, early blocks are recorded by length only and read back from
/// the destination when the digest reaches them.
pub const DEFAULT_DEFERRAL_LIMIT: usize = 16 * 1024 * 1024;

/// A block the digest saw ahead of its cursor.
enum Deferred {
    Held(Vec<u8>),
    /// Already on the destination; only the length is kept.
    OnDestination(u64),
}

/// Running digest for one of the supported algorithms.
#[derive(Clone)]
pub enum ContentHasher {
    Md5(md5::Md5),
    Sha256(Sha256),
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => ContentHasher::Md5(md5::Md5::new()),
            HashAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            ContentHasher::Md5(_) => HashAlgorithm::Md5,
            ContentHasher::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Md5(h) => h.update(data),
            ContentHasher::Sha256(h) => h.update(data),
        }
    }

    /// Finishes the digest and returns its base64 encoding.
    pub fn finalize_base64(self) -> String {
        match self {
            ContentHasher::Md5(h) => STANDARD.encode(h.finalize()),
            ContentHasher::Sha256(h) => STANDARD.encode(h.finalize()),
        }
    }
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHasher({:?})", self.algorithm())
    }
}

/// Canonical digest of an in-memory payload.
pub fn content_digest(data: &[u8], algorithm: HashAlgorithm) -> String {
    let mut hasher = ContentHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_base64()
}

/// Canonical digest of a whole file.
pub async fn file_content_digest(path: &Path, algorithm: HashAlgorithm) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let hasher = IncrementalHashStream::compute_separate_digest(&mut file, len, algorithm).await?;
    Ok(hasher.finalize_base64())
}

/// Destination stream plus the digest of everything committed to it.
pub struct IncrementalHashStream {
    inner: Box<dyn DestinationStream>,
    algorithm: HashAlgorithm,
    hasher: Option<ContentHasher>,
    cursor: u64,
    deferred: BTreeMap<u64, Deferred>,
    deferred_bytes: usize,
    deferral_limit: usize,
    awaiting_prefix: bool,
    fault: Option<String>,
    digest: Option<String>,
}

impl IncrementalHashStream {
    /// Wraps `inner` with an empty digest whose cursor starts at `start`.
    ///
    /// `start` is non-zero when resuming without validation: the digest then
    /// only covers bytes written by this run.
    pub fn new(inner: Box<dyn DestinationStream>, algorithm: HashAlgorithm, start: u64) -> Self {
        Self {
            inner,
            algorithm,
            hasher: Some(ContentHasher::new(algorithm)),
            cursor: start,
            deferred: BTreeMap::new(),
            deferred_bytes: 0,
            deferral_limit: DEFAULT_DEFERRAL_LIMIT,
            awaiting_prefix: false,
            fault: None,
            digest: None,
        }
    }

    /// Caps the bytes copied for early blocks.
    pub fn with_deferral_limit(mut self, limit: usize) -> Self {
        self.deferral_limit = limit;
        self
    }

    /// Bytes currently copied for blocks ahead of the cursor.
    pub fn deferred_bytes(&self) -> usize {
        self.deferred_bytes
    }

    /// Writes `data` at `offset`. Pass-through, no hashing.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        self.inner.seek(SeekFrom::Start(offset)).await?;
        self.inner.write_all(data).await?;
        Ok(())
    }

    /// Feeds `data` (which starts at `offset`) into the digest.
    ///
    /// `data` must already be written to the destination: once the deferral
    /// limit is reached an early block is read back from there instead of
    /// being copied.
    ///
    /// Returns `false` once the stream has failed; callers must stop feeding
    /// it and treat the job as failed.
    pub fn transform_block(&mut self, offset: u64, data: &[u8]) -> bool {
        if self.fault.is_some() {
            return false;
        }
        if self.hasher.is_none() {
            self.fail("block transformed after the digest was finalized");
            return false;
        }
        if data.is_empty() {
            return true;
        }
        if self.awaiting_prefix || offset > self.cursor {
            self.defer(offset, data);
            return true;
        }
        self.absorb(offset, data);
        self.drain_held();
        true
    }

    fn defer(&mut self, offset: u64, data: &[u8]) {
        if self.deferred.contains_key(&offset) {
            return;
        }
        let entry = if self.deferred_bytes + data.len() <= self.deferral_limit {
            self.deferred_bytes += data.len();
            Deferred::Held(data.to_vec())
        } else {
            Deferred::OnDestination(data.len() as u64)
        };
        self.deferred.insert(offset, entry);
    }

    /// Hashes the part of `data` past the cursor.
    fn absorb(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        if end <= self.cursor {
            return;
        }
        let skip = (self.cursor - offset) as usize;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&data[skip..]);
        }
        self.cursor = end;
    }

    /// Absorbs copied blocks that now meet the cursor. Stops at the first
    /// block that has to be read back.
    fn drain_held(&mut self) {
        while let Some(entry) = self.deferred.first_entry() {
            if *entry.key() > self.cursor || matches!(entry.get(), Deferred::OnDestination(_)) {
                break;
            }
            if let (offset, Deferred::Held(data)) = entry.remove_entry() {
                self.deferred_bytes -= data.len();
                self.absorb(offset, &data);
            }
        }
    }

    async fn drain_deferred(&mut self) -> Result<(), TransferError> {
        while let Some(entry) = self.deferred.first_entry() {
            if *entry.key() > self.cursor {
                break;
            }
            match entry.remove_entry() {
                (offset, Deferred::Held(data)) => {
                    self.deferred_bytes -= data.len();
                    self.absorb(offset, &data);
                }
                (offset, Deferred::OnDestination(len)) => self.read_back(offset, len).await?,
            }
        }
        Ok(())
    }

    /// Hashes `[offset, offset + len)` from the wrapped stream.
    async fn read_back(&mut self, offset: u64, len: u64) -> Result<(), TransferError> {
        self.inner.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; PREFIX_READ_SIZE.min(len as usize)];
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            let want = ((end - pos) as usize).min(buf.len());
            let n = self.inner.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::HashFailed(format!(
                    "destination ended at {pos} while reading back block {offset}"
                )));
            }
            self.absorb(pos, &buf[..n]);
            pos += n as u64;
        }
        Ok(())
    }

    /// Marks the range `[0, cursor)` as being hashed by a separate pass.
    ///
    /// Blocks transformed in the meantime are held until
    /// [`fold_prefix`](Self::fold_prefix) delivers the prefix digest.
    pub fn begin_separate(&mut self) {
        self.awaiting_prefix = true;
    }

    /// Returns `true` while a separate prefix pass is outstanding.
    pub fn awaiting_prefix(&self) -> bool {
        self.awaiting_prefix
    }

    /// Installs the digest of `[0, through)` computed by a separate pass,
    /// then hashes every deferred block it now reaches.
    pub async fn fold_prefix(&mut self, prefix: ContentHasher, through: u64) -> bool {
        if self.fault.is_some() {
            return false;
        }
        if !self.awaiting_prefix || through != self.cursor {
            self.fail(format!(
                "prefix digest through {through} does not meet live cursor {}",
                self.cursor
            ));
            return false;
        }
        self.hasher = Some(prefix);
        self.awaiting_prefix = false;
        if let Err(err) = self.drain_deferred().await {
            self.fail(err.to_string());
            return false;
        }
        true
    }

    /// Hashes deferred blocks the cursor has reached, reading back the ones
    /// that were not copied. Returns `false` once the stream has failed.
    pub async fn catch_up(&mut self) -> bool {
        if self.fault.is_some() {
            return false;
        }
        if self.awaiting_prefix {
            return true;
        }
        if let Err(err) = self.drain_deferred().await {
            self.fail(err.to_string());
            return false;
        }
        true
    }

    /// Records a hashing failure. Every later transform returns `false`.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(reason = %reason, "content hash stream failed");
        if self.fault.is_none() {
            self.fault = Some(reason);
        }
        self.deferred.clear();
        self.deferred_bytes = 0;
    }

    /// Failure recorded by [`fail`](Self::fail), if any.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Closes the digest and returns its canonical encoding.
    ///
    /// Returns `None` if the stream failed, the prefix pass never finished,
    /// or bytes are still held behind a gap.
    pub fn transform_final_block(&mut self) -> Option<String> {
        if let Some(digest) = &self.digest {
            return Some(digest.clone());
        }
        if self.fault.is_some() || self.awaiting_prefix || !self.deferred.is_empty() {
            return None;
        }
        let digest = self.hasher.take()?.finalize_base64();
        self.digest = Some(digest.clone());
        Some(digest)
    }

    /// Digest value once finalized.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Offset up to which bytes have been hashed.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Algorithm of the running digest.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Mutable access to the wrapped stream.
    pub fn get_mut(&mut self) -> &mut dyn DestinationStream {
        self.inner.as_mut()
    }

    /// Drops the hashing state and returns the wrapped stream unclosed.
    pub fn into_inner(self) -> Box<dyn DestinationStream> {
        self.inner
    }

    /// Hashes the first `len` bytes of `reader` independently of any live
    /// write path and returns the open digest state.
    pub async fn compute_separate_digest<R>(
        reader: &mut R,
        len: u64,
        algorithm: HashAlgorithm,
    ) -> Result<ContentHasher, TransferError>
    where
        R: AsyncRead + AsyncSeek + Unpin + ?Sized,
    {
        reader.seek(SeekFrom::Start(0)).await?;
        let mut hasher = ContentHasher::new(algorithm);
        let mut buf = vec![0u8; PREFIX_READ_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::HashFailed(format!(
                    "destination ended {remaining} bytes before resume offset {len}"
                )));
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(hasher)
    }
}
