use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiered_archive_common::clock::duration_millis;
use tiered_archive_common::{Clock, HotStore, Record, RecordId, StoreError, Timestamp};

use crate::{validate_file_name, write_atomic};

const RECORD_SUFFIX: &str = ".json";

/// Hot store keeping one JSON document per record in a directory.
///
/// Expiry is checked against the injected clock on every read; expired
/// files are removed when encountered.
pub struct FsHotStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FsHotStore {
    /// Open (or create) the hot store directory.
    pub fn open(dir: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            clock,
        })
    }

    fn file_name(id: &RecordId) -> Result<String, StoreError> {
        let name = format!("{}{RECORD_SUFFIX}", id.as_str());
        validate_file_name(&name)?;
        Ok(name)
    }

    async fn read_record(path: &Path) -> Result<Option<Record>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_if_present(path: &Path) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl HotStore for FsHotStore {
    async fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
        let path = self.dir.join(Self::file_name(id)?);
        match Self::read_record(&path).await? {
            Some(record) if record.is_live_at(self.clock.now()) => Ok(Some(record)),
            Some(_) => {
                Self::remove_if_present(&path).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: &Record, ttl: Option<Duration>) -> Result<(), StoreError> {
        if record.partition_key.is_empty() {
            return Err(StoreError::MalformedKey(format!(
                "record {} has an empty partition key",
                record.id
            )));
        }
        let name = Self::file_name(&record.id)?;

        let mut stored = record.clone();
        if let Some(ttl) = ttl {
            stored.expires_at = Some(self.clock.now().saturating_add(duration_millis(ttl)));
        }
        let bytes = serde_json::to_vec(&stored).map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.dir, &name, &bytes).await
    }

    async fn delete(&self, id: &RecordId) -> Result<bool, StoreError> {
        let path = self.dir.join(Self::file_name(id)?);
        Self::remove_if_present(&path).await
    }

    async fn scan_older_than(
        &self,
        cutoff: Timestamp,
        start_after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let now = self.clock.now();
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Temp files start with '.', so they never match here.
            if let Some(id) = name.strip_suffix(RECORD_SUFFIX) {
                if !name.starts_with('.') {
                    names.push(RecordId::new(id));
                }
            }
        }
        names.sort();

        let mut page = Vec::new();
        for id in names {
            if page.len() >= limit {
                break;
            }
            if start_after.is_some_and(|after| &id <= after) {
                continue;
            }
            let path = self.dir.join(Self::file_name(&id)?);
            let record = match Self::read_record(&path).await {
                Ok(Some(record)) => record,
                // Deleted since read_dir: the scan is not a snapshot.
                Ok(None) => continue,
                Err(StoreError::Serialization(reason)) => {
                    tracing::warn!(id = %id, %reason, "skipping unreadable hot record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !record.is_live_at(now) {
                Self::remove_if_present(&path).await?;
                continue;
            }
            if record.timestamp <= cutoff {
                page.push(record);
            }
        }
        Ok(page)
    }
}
