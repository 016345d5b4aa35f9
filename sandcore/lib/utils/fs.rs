use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::SandcoreResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the total size in bytes of the regular files under `path`, without following symlinks.
///
/// Entries that disappear or cannot be read while walking are skipped.
pub async fn dir_size(path: impl Into<PathBuf>) -> SandcoreResult<u64> {
    let path = path.into();
    let size = tokio::task::spawn_blocking(move || dir_size_blocking(&path)).await?;
    Ok(size)
}

fn dir_size_blocking(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
