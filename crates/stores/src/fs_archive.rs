use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tiered_archive_common::{ArchiveKey, ArchiveStore, StoreError};

use crate::{validate_file_name, write_atomic};

/// Archive store keeping one file per blob in a directory.
pub struct FsArchiveStore {
    dir: PathBuf,
}

impl FsArchiveStore {
    /// Open (or create) the archive directory.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &ArchiveKey) -> Result<PathBuf, StoreError> {
        validate_file_name(key.as_str())?;
        Ok(self.dir.join(key.as_str()))
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    async fn exists(&self, key: &ArchiveKey) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &ArchiveKey, bytes: Vec<u8>) -> Result<(), StoreError> {
        validate_file_name(key.as_str())?;
        write_atomic(&self.dir, key.as_str(), &bytes).await?;
        tracing::trace!(key = %key, bytes = bytes.len(), "archive blob written");
        Ok(())
    }

    async fn delete(&self, key: &ArchiveKey) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
