use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tiered_archive_common::{RecordId, Timestamp};

/// Progress of one migration run, checkpointed after each batch so a
/// crashed run can resume where it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCursor {
    /// When the run that wrote this cursor started.
    pub run_started_at: Timestamp,
    /// Scan bound the run was using.
    pub cutoff: Timestamp,
    /// Last record id the run got past. The next page starts after it.
    pub last_key: Option<RecordId>,
    pub batches_completed: u64,
}

impl MigrationCursor {
    pub fn start(run_started_at: Timestamp, cutoff: Timestamp) -> Self {
        Self {
            run_started_at,
            cutoff,
            last_key: None,
            batches_completed: 0,
        }
    }
}

/// JSON checkpoint file for a [`MigrationCursor`].
///
/// Writes go to a temp file that is renamed over the checkpoint, the same
/// way a manifest is replaced.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint. A missing file means "start from the beginning".
    pub async fn load(&self) -> Result<Option<MigrationCursor>, std::io::Error> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
    }

    pub async fn save(&self, cursor: &MigrationCursor) -> Result<(), std::io::Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(cursor)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Remove the checkpoint once a run has scanned everything.
    pub async fn clear(&self) -> Result<(), std::io::Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
