//! Transfer configuration.
//!
//! Stored as camelCase JSON. Fields that are missing, zero or out of range
//! keep their defaults, so an older or hand-edited file still loads.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chunkflow_protocol::HashAlgorithm;

use crate::progress::DEFAULT_INTERVAL;
use crate::{BufferPool, DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_POOL_SLOTS, TransferError};

const MIN_SIZE: u64 = 1024;
const MAX_BLOCK_SIZE: u64 = 1024 * 1024 * 1024;
const MAX_CHUNK_SIZE: u64 = 256 * 1024 * 1024;
const MAX_POOL_SLOTS: usize = 1024;

/// On-disk config format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    block_size: u64,
    #[serde(default)]
    chunk_size: u64,
    #[serde(default)]
    pool_slots: usize,
    #[serde(default)]
    acquire_timeout_ms: u64,
    #[serde(default = "default_true")]
    validate_content_hash: bool,
    #[serde(default)]
    hash_algorithm: HashAlgorithm,
    #[serde(default)]
    progress_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

/// Tunables shared by every job a controller runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// Unit tracked in the checkpoint window.
    pub block_size: u64,
    /// Pool slot size; a chunk never exceeds it.
    pub chunk_size: usize,
    pub pool_slots: usize,
    /// How long a producer waits for a free slot before giving up.
    pub acquire_timeout: Duration,
    pub validate_content_hash: bool,
    pub hash_algorithm: HashAlgorithm,
    pub progress_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            pool_slots: DEFAULT_POOL_SLOTS,
            acquire_timeout: Duration::from_secs(30),
            validate_content_hash: true,
            hash_algorithm: HashAlgorithm::Md5,
            progress_interval: DEFAULT_INTERVAL,
        }
    }
}

impl TransferConfig {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields defaults. An unparsable one is logged and
    /// also yields defaults; only read errors are returned.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let mut config = TransferConfig::default();
        if !path.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let Ok(file) = serde_json::from_str::<ConfigFile>(&content) else {
            tracing::warn!(path = %path.display(), "failed to parse transfer config, using defaults");
            return Ok(config);
        };

        if (MIN_SIZE..=MAX_BLOCK_SIZE).contains(&file.block_size) {
            config.block_size = file.block_size;
        }
        if (MIN_SIZE..=MAX_CHUNK_SIZE).contains(&file.chunk_size) {
            config.chunk_size = file.chunk_size as usize;
        }
        if (1..=MAX_POOL_SLOTS).contains(&file.pool_slots) {
            config.pool_slots = file.pool_slots;
        }
        if (1..=3_600_000).contains(&file.acquire_timeout_ms) {
            config.acquire_timeout = Duration::from_millis(file.acquire_timeout_ms);
        }
        config.validate_content_hash = file.validate_content_hash;
        config.hash_algorithm = file.hash_algorithm;
        if (50..=60_000).contains(&file.progress_interval_ms) {
            config.progress_interval = Duration::from_millis(file.progress_interval_ms);
        }

        Ok(config)
    }

    /// Saves configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = ConfigFile {
            block_size: self.block_size,
            chunk_size: self.chunk_size as u64,
            pool_slots: self.pool_slots,
            acquire_timeout_ms: self.acquire_timeout.as_millis() as u64,
            validate_content_hash: self.validate_content_hash,
            hash_algorithm: self.hash_algorithm,
            progress_interval_ms: self.progress_interval.as_millis() as u64,
        };

        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;

        tracing::debug!(path = %path.display(), "transfer configuration saved");
        Ok(())
    }

    /// Creates the buffer pool described by this config.
    pub fn build_pool(&self) -> BufferPool {
        BufferPool::new(self.chunk_size, self.pool_slots, self.acquire_timeout)
    }
}
