use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tiered_archive_common::{ArchiveKey, ArchiveStore, StoreError};

use crate::faults::{FaultInjector, StoreOp};

/// In-memory blob store with optional artificial latency on every call.
pub struct MemoryArchiveStore {
    blobs: Mutex<HashMap<ArchiveKey, Vec<u8>>>,
    latency: Duration,
    faults: FaultInjector,
    counters: ArchiveCounters,
}

#[derive(Debug, Default)]
struct ArchiveCounters {
    exists: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

/// Snapshot of operation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStoreStats {
    pub exists: u64,
    pub gets: u64,
    pub puts: u64,
    pub deletes: u64,
}

impl Default for MemoryArchiveStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Every call sleeps for `latency` before touching the map, to model
    /// a slow object store.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            latency,
            faults: FaultInjector::default(),
            counters: ArchiveCounters::default(),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Store raw bytes under `key`, bypassing faults and counters.
    pub fn insert_raw(&self, key: ArchiveKey, bytes: Vec<u8>) {
        self.lock().insert(key, bytes);
    }

    /// Read raw bytes, bypassing faults and counters.
    pub fn raw(&self, key: &ArchiveKey) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ArchiveStoreStats {
        ArchiveStoreStats {
            exists: self.counters.exists.load(Ordering::Relaxed),
            gets: self.counters.gets.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ArchiveKey, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn inject_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn exists(&self, key: &ArchiveKey) -> Result<bool, StoreError> {
        self.counters.exists.fetch_add(1, Ordering::Relaxed);
        self.inject_latency().await;
        self.faults.check(StoreOp::Exists)?;
        Ok(self.lock().contains_key(key))
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.inject_latency().await;
        self.faults.check(StoreOp::Get)?;
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &ArchiveKey, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.inject_latency().await;
        self.faults.check(StoreOp::Put)?;
        self.lock().insert(key.clone(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &ArchiveKey) -> Result<bool, StoreError> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.inject_latency().await;
        self.faults.check(StoreOp::Delete)?;
        Ok(self.lock().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiered_archive_common::RecordId;

    fn key(id: &str) -> ArchiveKey {
        ArchiveKey::for_record(&RecordId::new(id))
    }

    #[tokio::test]
    async fn test_put_is_idempotent_overwrite() {
        let store = MemoryArchiveStore::new();
        store.put(&key("R1"), b"one".to_vec()).await.unwrap();
        store.put(&key("R1"), b"one".to_vec()).await.unwrap();
        assert_eq!(store.len(), 1);

        store.put(&key("R1"), b"two".to_vec()).await.unwrap();
        assert_eq!(store.get(&key("R1")).await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_exists_and_delete() {
        let store = MemoryArchiveStore::new();
        assert!(!store.exists(&key("R1")).await.unwrap());
        store.put(&key("R1"), vec![1]).await.unwrap();
        assert!(store.exists(&key("R1")).await.unwrap());
        assert!(store.delete(&key("R1")).await.unwrap());
        assert!(!store.exists(&key("R1")).await.unwrap());
        assert_eq!(
            store.stats(),
            ArchiveStoreStats {
                exists: 3,
                gets: 0,
                puts: 1,
                deletes: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failed_put_leaves_nothing() {
        let store = MemoryArchiveStore::new();
        store.faults().fail_next(StoreOp::Put, 1);
        assert!(store.put(&key("R1"), vec![1]).await.is_err());
        assert!(store.raw(&key("R1")).is_none());
    }
}
