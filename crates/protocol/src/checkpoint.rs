//! Persisted shape of a transfer checkpoint.
//!
//! ```json
//! { "entryOffset": 0, "transferWindow": [4096, 8192] }
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

/// Snapshot of transfer progress that survives a process restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    /// Offset below which every byte is durably written.
    pub entry_offset: u64,
    /// Start offsets of dispatched blocks that are not fully written yet.
    #[serde(default, deserialize_with = "sorted_window")]
    pub transfer_window: Vec<u64>,
}

impl CheckpointRecord {
    /// Creates a record, sorting and de-duplicating `window`.
    pub fn new(entry_offset: u64, window: impl IntoIterator<Item = u64>) -> Self {
        let set: BTreeSet<u64> = window.into_iter().collect();
        Self {
            entry_offset,
            transfer_window: set.into_iter().collect(),
        }
    }

    /// Offset a resumed transfer restarts from.
    ///
    /// The lowest open block is the first gap, so it wins over
    /// `entry_offset` whenever the window is non-empty.
    pub fn resume_offset(&self) -> u64 {
        self.transfer_window
            .first()
            .copied()
            .unwrap_or(self.entry_offset)
    }
}

fn sorted_window<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<u64>::deserialize(deserializer)?;
    let set: BTreeSet<u64> = raw.into_iter().collect();
    Ok(set.into_iter().collect())
}
