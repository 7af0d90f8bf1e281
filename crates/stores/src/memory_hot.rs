use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tiered_archive_common::clock::duration_millis;
use tiered_archive_common::{Clock, HotStore, Record, RecordId, StoreError, Timestamp};

use crate::faults::{FaultInjector, StoreOp};

/// In-memory hot store with clock-driven entry expiry.
///
/// Entries written with a TTL vanish once the clock passes their expiry,
/// the same way a managed key-value store drops TTL'd items.
pub struct MemoryHotStore {
    clock: Arc<dyn Clock>,
    records: Mutex<BTreeMap<RecordId, Record>>,
    faults: FaultInjector,
    counters: HotCounters,
}

#[derive(Debug, Default)]
struct HotCounters {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,
}

/// Snapshot of operation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HotStoreStats {
    pub gets: u64,
    pub puts: u64,
    pub deletes: u64,
    pub scans: u64,
}

impl MemoryHotStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: Mutex::new(BTreeMap::new()),
            faults: FaultInjector::default(),
            counters: HotCounters::default(),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Insert a record directly, bypassing fault injection and counters.
    /// Stands in for the upstream write path.
    pub fn seed(&self, record: Record) {
        self.lock().insert(record.id.clone(), record);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.lock().values().filter(|r| r.is_live_at(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HotStoreStats {
        HotStoreStats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            scans: self.counters.scans.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RecordId, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop entries whose TTL has elapsed.
    fn purge_expired(records: &mut BTreeMap<RecordId, Record>, now: Timestamp) {
        records.retain(|_, r| r.is_live_at(now));
    }
}

#[async_trait]
impl HotStore for MemoryHotStore {
    async fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.faults.check(StoreOp::Get)?;

        let now = self.clock.now();
        let mut records = self.lock();
        match records.get(id) {
            Some(record) if record.is_live_at(now) => Ok(Some(record.clone())),
            Some(_) => {
                records.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: &Record, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.faults.check(StoreOp::Put)?;

        if record.partition_key.is_empty() {
            return Err(StoreError::MalformedKey(format!(
                "record {} has an empty partition key",
                record.id
            )));
        }

        let mut stored = record.clone();
        if let Some(ttl) = ttl {
            stored.expires_at = Some(self.clock.now().saturating_add(duration_millis(ttl)));
        }
        self.lock().insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> Result<bool, StoreError> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.faults.check(StoreOp::Delete)?;
        Ok(self.lock().remove(id).is_some())
    }

    async fn scan_older_than(
        &self,
        cutoff: Timestamp,
        start_after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        self.faults.check(StoreOp::Scan)?;

        let now = self.clock.now();
        let mut records = self.lock();
        Self::purge_expired(&mut records, now);

        let lower = match start_after {
            Some(id) => Bound::Excluded(id.clone()),
            None => Bound::Unbounded,
        };
        Ok(records
            .range((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| r.timestamp <= cutoff)
            .take(limit)
            .cloned()
            .collect())
    }
}
