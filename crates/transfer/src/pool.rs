//! Fixed-size buffer pool shared by every job.
//!
//! The pool caps in-flight memory at `slot_size * slot_count`. Producers
//! acquire a slot before reading a chunk; the writer hands the slot back
//! once the chunk is committed. Acquisition waits (bounded by the
//! configured timeout) while every slot is out, which is the backpressure
//! between fast producers and a slow destination.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::TransferError;

/// A pool of reusable, fixed-size byte buffers.
///
/// Cloning is cheap; clones share the same slots.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    slot_size: usize,
    slot_count: usize,
    acquire_timeout: Duration,
    permits: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Acquire/release counters for a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetrics {
    pub acquired: u64,
    pub released: u64,
}

impl PoolMetrics {
    /// Buffers currently held by producers or the writer.
    pub fn outstanding(&self) -> u64 {
        self.acquired - self.released
    }
}

impl BufferPool {
    /// Creates a pool of `slot_count` buffers of `slot_size` bytes.
    ///
    /// Buffers are allocated lazily on first use and recycled afterwards.
    pub fn new(slot_size: usize, slot_count: usize, acquire_timeout: Duration) -> Self {
        let slot_count = slot_count.max(1);
        Self {
            inner: Arc::new(PoolInner {
                slot_size,
                slot_count,
                acquire_timeout,
                permits: Arc::new(Semaphore::new(slot_count)),
                free: Mutex::new(Vec::with_capacity(slot_count)),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Acquires a slot, waiting up to the pool's acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::PoolExhausted`] if no slot frees up in time.
    pub async fn acquire(&self) -> Result<PooledBuffer, TransferError> {
        let started = Instant::now();
        let permit = tokio::time::timeout(
            self.inner.acquire_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await;
        match permit {
            Ok(Ok(permit)) => Ok(self.checkout(permit)),
            Ok(Err(_)) | Err(_) => {
                tracing::debug!(
                    slots = self.inner.slot_count,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "buffer pool exhausted"
                );
                Err(TransferError::PoolExhausted {
                    slots: self.inner.slot_count,
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Acquires a slot without waiting.
    pub fn try_acquire(&self) -> Result<PooledBuffer, TransferError> {
        match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => Ok(self.checkout(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(TransferError::PoolExhausted {
                    slots: self.inner.slot_count,
                    waited: Duration::ZERO,
                })
            }
        }
    }

    /// Returns a buffer to the pool. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &buffer.pool),
            "buffer released to a pool it was not acquired from"
        );
        buffer.release();
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> PooledBuffer {
        let recycled = self.inner.free.lock().unwrap().pop();
        let data = recycled.unwrap_or_else(|| vec![0u8; self.inner.slot_size]);
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            data: Some(data),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Size of every slot in bytes.
    pub fn slot_size(&self) -> usize {
        self.inner.slot_size
    }

    /// Total number of slots.
    pub fn slot_count(&self) -> usize {
        self.inner.slot_count
    }

    /// Slots that can be acquired right now.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Snapshot of the acquire/release counters.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
        }
    }
}

/// A slot checked out of a [`BufferPool`].
///
/// Dereferences to the full slot (`slot_size` bytes). The slot goes back
/// to the pool exactly once, either through [`release`](Self::release) or
/// on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Option<Vec<u8>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Returns the slot to its pool.
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };
        self.pool.free.lock().unwrap().push(data);
        let released = self.pool.released.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert!(
            released <= self.pool.acquired.load(Ordering::Relaxed),
            "buffer pool released more slots than it handed out"
        );
        // Permit goes last so a waiter never sees a free permit without a buffer.
        drop(self.permit.take());
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.give_back();
    }
}
