//! Data types shared across the transfer boundary.
//!
//! Everything in this crate is either persisted between process runs
//! (the checkpoint record) or handed to progress sinks outside the core.

pub mod checkpoint;
pub mod types;

pub use checkpoint::CheckpointRecord;
pub use types::{HashAlgorithm, TransferProgress, TransferStatus};
