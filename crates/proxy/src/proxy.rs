use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tiered_archive_common::format::decode_record_for;
use tiered_archive_common::retry::retry_transient;
use tiered_archive_common::{ArchiveKey, ArchiveStore, Clock, HotStore, Record, RecordId, StoreError, Tier, Timestamp};
use tiered_archive_policy::{RetryPolicy, TierPolicy};
use tokio::time::Instant;

use crate::single_flight::SingleFlight;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Repopulate the hot store with a TTL'd copy after an archive hit.
    pub write_back: bool,
    /// Deadline applied to `get_record` and `lookup`. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// How long a read waits for its write-back. A slower put finishes in
    /// the background and the read returns without a cache expiry.
    pub write_back_timeout: Duration,
}

pub const DEFAULT_WRITE_BACK_TIMEOUT: Duration = Duration::from_millis(250);

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            write_back: true,
            request_timeout: None,
            write_back_timeout: DEFAULT_WRITE_BACK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("record {0} not found in any tier")]
    NotFound(RecordId),

    #[error("{tier} store unavailable while reading {id}: {message}")]
    Transient { id: RecordId, tier: Tier, message: String },

    #[error("{tier} store rejected the read of {id}: {message}")]
    Store { id: RecordId, tier: Tier, message: String },

    #[error("archive entry for {id} is corrupt: {reason}")]
    CorruptArchiveEntry { id: RecordId, reason: String },

    #[error("lookup of {0} did not finish before its deadline")]
    Timeout(RecordId),
}

impl ProxyError {
    fn from_store(id: &RecordId, tier: Tier, e: StoreError) -> Self {
        let (id, message) = (id.clone(), e.to_string());
        if e.is_transient() {
            ProxyError::Transient { id, tier, message }
        } else {
            ProxyError::Store { id, tier, message }
        }
    }

    /// Whether the caller may reasonably try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::Transient { .. } | ProxyError::Timeout(_))
    }
}

/// A successful lookup and where it was served from.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    /// The record in its authoritative form, without cache attributes.
    pub record: Record,
    pub tier: Tier,
    /// Expiry of the hot cache copy this lookup wrote, if any. Lookups that
    /// joined another caller's archive fetch report `None`.
    pub cached_until: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub hot_hits: u64,
    pub archive_hits: u64,
    pub misses: u64,
    pub corrupt_entries: u64,
    pub write_backs: u64,
    pub write_back_failures: u64,
    /// Lookups that waited on another caller's archive fetch.
    pub coalesced: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    hot_hits: AtomicU64,
    archive_hits: AtomicU64,
    misses: AtomicU64,
    corrupt_entries: AtomicU64,
    write_backs: AtomicU64,
    write_back_failures: AtomicU64,
    coalesced: AtomicU64,
    timeouts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Serves record reads from whichever tier holds the record.
///
/// Reads go to the hot store first. On a miss the archive is consulted,
/// and an archive hit is optionally written back to the hot store with the
/// policy's rehydration TTL. Concurrent archive fallbacks for the same id
/// share one fetch.
///
/// Deadlines bound the reads only. The write-back runs after the record is
/// in hand and is bounded by [`ProxyConfig::write_back_timeout`].
pub struct RehydrationProxy {
    hot: Arc<dyn HotStore>,
    archive: Arc<dyn ArchiveStore>,
    clock: Arc<dyn Clock>,
    policy: TierPolicy,
    retry: RetryPolicy,
    config: ProxyConfig,
    in_flight: SingleFlight<RecordId, Result<Record, ProxyError>>,
    counters: Counters,
}

impl RehydrationProxy {
    pub fn new(
        hot: Arc<dyn HotStore>,
        archive: Arc<dyn ArchiveStore>,
        clock: Arc<dyn Clock>,
        policy: TierPolicy,
        retry: RetryPolicy,
        config: ProxyConfig,
    ) -> Self {
        Self {
            hot,
            archive,
            clock,
            policy,
            retry,
            config,
            in_flight: SingleFlight::new(),
            counters: Counters::default(),
        }
    }

    /// Fetch a record regardless of its tier.
    pub async fn get_record(&self, id: &RecordId) -> Result<Record, ProxyError> {
        self.lookup(id).await.map(|found| found.record)
    }

    /// Like [`get_record`](Self::get_record), but also reports the tier.
    pub async fn lookup(&self, id: &RecordId) -> Result<Lookup, ProxyError> {
        let deadline = self.config.request_timeout.map(|limit| Instant::now() + limit);
        self.lookup_until(id, deadline).await
    }

    /// Fetch a record, giving up with `Timeout` at `deadline`. Store calls
    /// still in progress at the deadline are dropped.
    pub async fn get_record_with_deadline(&self, id: &RecordId, deadline: Instant) -> Result<Record, ProxyError> {
        self.lookup_until(id, Some(deadline)).await.map(|found| found.record)
    }

    pub fn stats(&self) -> ProxyStats {
        let c = &self.counters;
        ProxyStats {
            hot_hits: c.hot_hits.load(Ordering::Relaxed),
            archive_hits: c.archive_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            corrupt_entries: c.corrupt_entries.load(Ordering::Relaxed),
            write_backs: c.write_backs.load(Ordering::Relaxed),
            write_back_failures: c.write_back_failures.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Archive fetches currently in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.in_flight()
    }

    async fn lookup_until(&self, id: &RecordId, deadline: Option<Instant>) -> Result<Lookup, ProxyError> {
        let read = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.read(id)).await {
                Ok(result) => result?,
                Err(_) => {
                    bump(&self.counters.timeouts);
                    tracing::warn!(id = %id, "record lookup timed out");
                    return Err(ProxyError::Timeout(id.clone()));
                }
            },
            None => self.read(id).await?,
        };

        match read {
            Read::Hot(found) => Ok(found),
            Read::Archive { record, shared } => {
                let cached_until = if self.config.write_back && !shared {
                    self.write_back(&record).await
                } else {
                    None
                };
                tracing::debug!(id = %id, rehydrated = cached_until.is_some(), shared, "served from archive");
                Ok(Lookup {
                    record,
                    tier: Tier::Cold,
                    cached_until,
                })
            }
        }
    }

    async fn read(&self, id: &RecordId) -> Result<Read, ProxyError> {
        let hot = retry_transient(&self.retry, "hot.get", || self.hot.get(id))
            .await
            .map_err(|e| ProxyError::from_store(id, Tier::Hot, e))?;

        if let Some(mut record) = hot {
            bump(&self.counters.hot_hits);
            let cached_until = record.expires_at.take();
            tracing::debug!(id = %id, cached = cached_until.is_some(), "served from hot store");
            return Ok(Read::Hot(Lookup {
                record,
                tier: Tier::Hot,
                cached_until,
            }));
        }

        let (result, shared) = self.in_flight.run(id.clone(), || self.fetch_archived(id)).await;
        if shared {
            bump(&self.counters.coalesced);
            tracing::debug!(id = %id, "joined in-flight archive fetch");
        }
        Ok(Read::Archive { record: result?, shared })
    }

    /// Archive fallback: fetch and decode.
    async fn fetch_archived(&self, id: &RecordId) -> Result<Record, ProxyError> {
        let key = ArchiveKey::for_record(id);
        let bytes = retry_transient(&self.retry, "archive.get", || self.archive.get(&key))
            .await
            .map_err(|e| ProxyError::from_store(id, Tier::Cold, e))?;

        let Some(bytes) = bytes else {
            bump(&self.counters.misses);
            tracing::debug!(id = %id, "record not found in either tier");
            return Err(ProxyError::NotFound(id.clone()));
        };

        let record = decode_record_for(id, &bytes).map_err(|e| {
            bump(&self.counters.corrupt_entries);
            tracing::error!(id = %id, key = %key, error = %e, "corrupt archive entry");
            ProxyError::CorruptArchiveEntry {
                id: id.clone(),
                reason: e.to_string(),
            }
        })?;
        bump(&self.counters.archive_hits);
        Ok(record)
    }

    /// Best effort: a failed or slow write-back never fails the read. The
    /// put runs on its own task so one that outlives the wait still lands.
    async fn write_back(&self, record: &Record) -> Option<Timestamp> {
        let expires_at = self.policy.rehydration_expiry(self.clock.now());
        let copy = record.as_cache_copy(expires_at);
        let ttl = self.policy.rehydration_ttl();
        let hot = self.hot.clone();
        let put = tokio::spawn(async move { hot.put(&copy, Some(ttl)).await });

        let failure = match tokio::time::timeout(self.config.write_back_timeout, put).await {
            Ok(Ok(Ok(()))) => {
                bump(&self.counters.write_backs);
                return Some(expires_at);
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(join)) => join.to_string(),
            Err(_) => "still pending, left to finish in the background".to_string(),
        };
        bump(&self.counters.write_back_failures);
        tracing::warn!(id = %record.id, error = %failure, "hot store write-back failed");
        None
    }
}

/// Outcome of the deadline-bound part of a lookup.
enum Read {
    Hot(Lookup),
    Archive { record: Record, shared: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tiered_archive_common::format::encode_record;
    use tiered_archive_common::ManualClock;
    use tiered_archive_policy::{DAY, DEFAULT_REHYDRATION_TTL};
    use tiered_archive_stores::{MemoryArchiveStore, MemoryHotStore, StoreOp};

    const NOW: Timestamp = 1_800_000_000_000;

    struct Harness {
        clock: Arc<ManualClock>,
        hot: Arc<MemoryHotStore>,
        archive: Arc<MemoryArchiveStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_archive(MemoryArchiveStore::new())
        }

        fn with_archive(archive: MemoryArchiveStore) -> Self {
            let clock = Arc::new(ManualClock::new(NOW));
            let hot = Arc::new(MemoryHotStore::new(clock.clone()));
            Self {
                clock,
                hot,
                archive: Arc::new(archive),
            }
        }

        fn proxy(&self, config: ProxyConfig) -> RehydrationProxy {
            RehydrationProxy::new(
                self.hot.clone(),
                self.archive.clone(),
                self.clock.clone(),
                TierPolicy::default(),
                RetryPolicy::no_retry(),
                config,
            )
        }

        fn archive_record(&self, record: &Record) {
            let bytes = encode_record(record).unwrap();
            self.archive.insert_raw(ArchiveKey::for_record(&record.id), bytes);
        }
    }

    fn old_record(id: &str) -> Record {
        Record::new(id, NOW - 91 * DAY.as_millis() as u64, json!({"id": id, "amount": 12.5}))
    }

    #[tokio::test]
    async fn test_hot_hit_skips_archive() {
        let h = Harness::new();
        let record = Record::new("R1", NOW, json!({"v": 1}));
        h.hot.seed(record.clone());
        let proxy = h.proxy(ProxyConfig::default());

        let found = proxy.lookup(&record.id).await.unwrap();
        assert_eq!(found.tier, Tier::Hot);
        assert_eq!(found.record, record);
        assert_eq!(h.archive.stats().gets, 0);
        assert_eq!(proxy.stats().hot_hits, 1);
    }

    #[tokio::test]
    async fn test_archive_fallback_writes_back() {
        let h = Harness::new();
        let record = old_record("R1");
        h.archive_record(&record);
        let proxy = h.proxy(ProxyConfig::default());

        let found = proxy.lookup(&record.id).await.unwrap();
        assert_eq!(found.tier, Tier::Cold);
        assert_eq!(found.record, record);
        let expiry = NOW + DEFAULT_REHYDRATION_TTL.as_millis() as u64;
        assert_eq!(found.cached_until, Some(expiry));

        // Second read within the TTL is a hot hit with the same content.
        let again = proxy.lookup(&record.id).await.unwrap();
        assert_eq!(again.tier, Tier::Hot);
        assert_eq!(again.record, record);
        assert_eq!(again.cached_until, Some(expiry));
        assert_eq!(h.archive.stats().gets, 1);
    }

    #[tokio::test]
    async fn test_expired_cache_copy_falls_back_to_archive() {
        let h = Harness::new();
        let record = old_record("R1");
        h.archive_record(&record);
        let proxy = h.proxy(ProxyConfig::default());

        proxy.get_record(&record.id).await.unwrap();
        h.clock.advance(DEFAULT_REHYDRATION_TTL);

        let found = proxy.lookup(&record.id).await.unwrap();
        assert_eq!(found.tier, Tier::Cold);
        assert_eq!(h.archive.stats().gets, 2);
        assert_eq!(proxy.stats().write_backs, 2);
    }

    #[tokio::test]
    async fn test_write_back_disabled() {
        let h = Harness::new();
        let record = old_record("R1");
        h.archive_record(&record);
        let proxy = h.proxy(ProxyConfig {
            write_back: false,
            ..Default::default()
        });

        let found = proxy.lookup(&record.id).await.unwrap();
        assert_eq!(found.cached_until, None);
        assert!(h.hot.is_empty());
        assert_eq!(h.hot.stats().puts, 0);
    }

    #[tokio::test]
    async fn test_absent_everywhere_is_not_found() {
        let h = Harness::new();
        let proxy = h.proxy(ProxyConfig::default());
        let id = RecordId::new("R2");

        let err = proxy.get_record(&id).await.unwrap_err();
        assert_eq!(err, ProxyError::NotFound(id));
        assert!(!err.is_retryable());
        assert!(h.hot.is_empty());
        assert_eq!(proxy.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_not_written_back() {
        let h = Harness::new();
        let id = RecordId::new("R1");
        h.archive
            .insert_raw(ArchiveKey::for_record(&id), b"{\"format_version\": 1".to_vec());
        let proxy = h.proxy(ProxyConfig::default());

        let err = proxy.get_record(&id).await.unwrap_err();
        assert!(matches!(err, ProxyError::CorruptArchiveEntry { .. }));
        assert_eq!(h.hot.stats().puts, 0);
        assert_eq!(h.archive.stats().gets, 1);
        assert_eq!(proxy.stats().corrupt_entries, 1);
    }

    #[tokio::test]
    async fn test_entry_for_another_id_is_corrupt() {
        let h = Harness::new();
        let stray = old_record("R9");
        h.archive
            .insert_raw(ArchiveKey::for_record(&RecordId::new("R1")), encode_record(&stray).unwrap());
        let proxy = h.proxy(ProxyConfig::default());

        let err = proxy.get_record(&RecordId::new("R1")).await.unwrap_err();
        assert!(matches!(err, ProxyError::CorruptArchiveEntry { .. }));
    }

    #[tokio::test]
    async fn test_failed_write_back_still_returns_record() {
        let h = Harness::new();
        let record = old_record("R1");
        h.archive_record(&record);
        h.hot.faults().fail_next(StoreOp::Put, 1);
        let proxy = h.proxy(ProxyConfig::default());

        let found = proxy.lookup(&record.id).await.unwrap();
        assert_eq!(found.record, record);
        assert_eq!(found.cached_until, None);
        assert_eq!(proxy.stats().write_back_failures, 1);
        assert!(h.hot.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_surface() {
        let h = Harness::new();
        let record = Record::new("R1", NOW, json!({}));
        h.hot.seed(record.clone());
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let proxy = RehydrationProxy::new(
            h.hot.clone(),
            h.archive.clone(),
            h.clock.clone(),
            TierPolicy::default(),
            retry,
            ProxyConfig::default(),
        );

        h.hot.faults().fail_next(StoreOp::Get, 2);
        assert_eq!(proxy.get_record(&record.id).await.unwrap(), record);

        h.hot.faults().set_outage(true);
        let err = proxy.get_record(&record.id).await.unwrap_err();
        assert!(matches!(err, ProxyError::Transient { tier: Tier::Hot, .. }));
        assert!(err.is_retryable());
        // A hot store fault never turns into an archive lookup.
        assert_eq!(h.archive.stats().gets, 0);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let h = Harness::with_archive(MemoryArchiveStore::with_latency(Duration::from_secs(10)));
        let record = old_record("R1");
        h.archive_record(&record);
        let proxy = h.proxy(ProxyConfig::default());

        let deadline = Instant::now() + Duration::from_millis(30);
        let err = proxy.get_record_with_deadline(&record.id, deadline).await.unwrap_err();
        assert_eq!(err, ProxyError::Timeout(record.id.clone()));
        assert_eq!(proxy.in_flight(), 0);
        assert_eq!(proxy.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_request_timeout_from_config() {
        let h = Harness::with_archive(MemoryArchiveStore::with_latency(Duration::from_secs(10)));
        let proxy = h.proxy(ProxyConfig {
            request_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let err = proxy.get_record(&RecordId::new("R1")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(_)));
    }

    /// Delegates to a memory hot store, but every `put` takes `delay`.
    struct SlowPutHotStore {
        inner: Arc<MemoryHotStore>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl HotStore for SlowPutHotStore {
        async fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
            self.inner.get(id).await
        }

        async fn put(&self, record: &Record, ttl: Option<Duration>) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.put(record, ttl).await
        }

        async fn delete(&self, id: &RecordId) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }

        async fn scan_older_than(
            &self,
            cutoff: Timestamp,
            start_after: Option<&RecordId>,
            limit: usize,
        ) -> Result<Vec<Record>, StoreError> {
            self.inner.scan_older_than(cutoff, start_after, limit).await
        }
    }

    #[tokio::test]
    async fn test_slow_write_back_does_not_fail_read() {
        let h = Harness::new();
        let record = old_record("R1");
        h.archive_record(&record);
        let slow = Arc::new(SlowPutHotStore {
            inner: h.hot.clone(),
            delay: Duration::from_secs(10),
        });
        let proxy = RehydrationProxy::new(
            slow,
            h.archive.clone(),
            h.clock.clone(),
            TierPolicy::default(),
            RetryPolicy::no_retry(),
            ProxyConfig {
                write_back_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let deadline = Instant::now() + Duration::from_millis(200);
        let found = proxy.get_record_with_deadline(&record.id, deadline).await.unwrap();
        assert_eq!(found, record);

        let stats = proxy.stats();
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.archive_hits, 1);
        assert_eq!(stats.write_back_failures, 1);
        assert_eq!(proxy.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_slow_write_back_past_deadline_still_returns_record() {
        let h = Harness::new();
        let record = old_record("R1");
        h.archive_record(&record);
        let slow = Arc::new(SlowPutHotStore {
            inner: h.hot.clone(),
            delay: Duration::from_millis(60),
        });
        let proxy = RehydrationProxy::new(
            slow,
            h.archive.clone(),
            h.clock.clone(),
            TierPolicy::default(),
            RetryPolicy::no_retry(),
            ProxyConfig::default(),
        );

        // The put outlives the deadline but fits the write-back wait.
        let deadline = Instant::now() + Duration::from_millis(10);
        let found = proxy.lookup_until(&record.id, Some(deadline)).await.unwrap();
        assert_eq!(found.record, record);
        assert!(found.cached_until.is_some());
        assert_eq!(proxy.stats().write_backs, 1);
        assert!(h.hot.get(&record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let h = Harness::with_archive(MemoryArchiveStore::with_latency(Duration::from_millis(50)));
        let record = old_record("R1");
        h.archive_record(&record);
        let proxy = Arc::new(h.proxy(ProxyConfig::default()));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let proxy = proxy.clone();
            let id = record.id.clone();
            tasks.push(tokio::spawn(async move { proxy.get_record(&id).await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), record);
        }

        assert_eq!(h.archive.stats().gets, 1);
        assert_eq!(h.hot.stats().puts, 1);
        assert_eq!(proxy.stats().coalesced, 9);
        assert_eq!(proxy.in_flight(), 0);
    }
}
