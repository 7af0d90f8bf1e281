//! Reference adapters for the hot and archive store contracts.
//!
//! The in-memory stores back the test-suite and scripted scenarios; the
//! filesystem stores keep one file per record/blob under a directory,
//! mirroring the `hot/` + `cold/` layout of a local deployment.

pub mod faults;
pub mod fs_archive;
pub mod fs_hot;
pub mod memory_archive;
pub mod memory_hot;

pub use faults::{FaultInjector, StoreOp};
pub use fs_archive::FsArchiveStore;
pub use fs_hot::FsHotStore;
pub use memory_archive::MemoryArchiveStore;
pub use memory_hot::MemoryHotStore;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tiered_archive_common::StoreError;
use tokio::io::AsyncWriteExt;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Reject names that are empty or could escape the store directory.
pub(crate) fn validate_file_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.contains("..");
    if bad {
        return Err(StoreError::MalformedKey(name.to_string()));
    }
    Ok(())
}

/// Write `bytes` to `dir/name` via a synced temp file and a rename, so
/// readers see either the old content or the new content, never a prefix.
pub(crate) async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = dir.join(format!(".{name}.tmp-{}-{seq}", std::process::id()));
    let final_path = dir.join(name);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}
