use std::path::{Component, Path};

use crate::TransferError;

/// Checks that `path` can name a destination file.
///
/// Rejects:
/// - Empty paths
/// - Paths without a final file name (`/`, `dir/..`)
/// - Existing directories
///
/// Missing parent directories are fine; the writer creates them.
pub fn validate_destination_path(path: &Path) -> Result<(), TransferError> {
    if path.as_os_str().is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    match path.components().next_back() {
        Some(Component::Normal(_)) => {}
        _ => {
            return Err(TransferError::InvalidPath(format!(
                "path does not name a file: {}",
                path.display()
            )));
        }
    }

    if path.is_dir() {
        return Err(TransferError::InvalidPath(format!(
            "destination is a directory: {}",
            path.display()
        )));
    }

    Ok(())
}
