use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod clock;
pub mod format;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Milliseconds since the unix epoch.
pub type Timestamp = u64;

/// Separator between the partition prefix and the rest of an identifier,
/// e.g. `acct-17#inv-2024-001`.
pub const PARTITION_SEPARATOR: char = '#';

/// Globally unique record identifier, as assigned by the upstream write path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Partition key implied by the identifier: the prefix before the first
    /// `#`, or the whole identifier when there is none.
    pub fn derived_partition_key(&self) -> &str {
        match self.0.split_once(PARTITION_SEPARATOR) {
            Some((prefix, _)) => prefix,
            None => &self.0,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which tier served (or holds) a record. Never persisted on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Hot,
    Cold,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A business record as stored in the hot tier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    /// Hot-store addressing key. Defaults to the identifier's prefix.
    pub partition_key: String,
    /// Creation/event time.
    pub timestamp: Timestamp,
    /// Opaque structured payload.
    pub payload: serde_json::Value,
    /// Set only on rehydrated cache copies; the hot store drops the entry
    /// once `now >= expires_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, timestamp: Timestamp, payload: serde_json::Value) -> Self {
        let id = id.into();
        let partition_key = id.derived_partition_key().to_string();
        Self {
            id,
            partition_key,
            timestamp,
            payload,
            expires_at: None,
        }
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = partition_key.into();
        self
    }

    /// True for rehydrated copies written back by the proxy.
    pub fn is_cache_copy(&self) -> bool {
        self.expires_at.is_some()
    }

    /// Whether the entry is still visible at `now`.
    pub fn is_live_at(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |expiry| now < expiry)
    }

    /// Cache copy of this record that expires at `expires_at`.
    pub fn as_cache_copy(&self, expires_at: Timestamp) -> Record {
        Record {
            expires_at: Some(expires_at),
            ..self.clone()
        }
    }

    /// The authoritative form of the record, without cache attributes.
    pub fn without_expiry(&self) -> Record {
        Record {
            expires_at: None,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Archive keys
// ---------------------------------------------------------------------------

/// Blob name in the archive store. One blob per record identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    pub fn for_record(id: &RecordId) -> Self {
        Self(format!("{}.json", id.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Store traits: the proxy/migrator <-> storage boundary
// ---------------------------------------------------------------------------

/// Low-latency key-value store holding recent records.
#[async_trait]
pub trait HotStore: Send + Sync {
    /// Look up a record. Expired cache copies read as `None`.
    async fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError>;

    /// Insert or replace a record. With a TTL, the store expires the entry
    /// on its own after `ttl`.
    async fn put(&self, record: &Record, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a record. Returns `false` if it was already absent.
    async fn delete(&self, id: &RecordId) -> Result<bool, StoreError>;

    /// One page of records with `timestamp <= cutoff`, ordered by id and
    /// starting strictly after `start_after`. Not a snapshot: records may
    /// appear or vanish between pages.
    async fn scan_older_than(
        &self,
        cutoff: Timestamp,
        start_after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;
}

/// High-latency blob store holding archived records.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn exists(&self, key: &ArchiveKey) -> Result<bool, StoreError>;

    async fn get(&self, key: &ArchiveKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a blob. Overwriting an existing key is always allowed.
    async fn put(&self, key: &ArchiveKey, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Remove a blob. Optional; stores that never delete keep the default.
    async fn delete(&self, _key: &ArchiveKey) -> Result<bool, StoreError> {
        Err(StoreError::Unsupported("delete"))
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Throttled { .. } => true,
            StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partition_key_from_prefix() {
        let id = RecordId::new("acct-17#inv-001");
        assert_eq!(id.derived_partition_key(), "acct-17");

        let plain = RecordId::new("R1");
        assert_eq!(plain.derived_partition_key(), "R1");
    }

    #[test]
    fn test_record_new_derives_partition_key() {
        let record = Record::new("acct-9#x", 10, json!({"amount": 5}));
        assert_eq!(record.partition_key, "acct-9");
        assert!(!record.is_cache_copy());
    }

    #[test]
    fn test_cache_copy_liveness() {
        let record = Record::new("R1", 0, json!(null)).as_cache_copy(100);
        assert!(record.is_cache_copy());
        assert!(record.is_live_at(99));
        assert!(!record.is_live_at(100));
        assert_eq!(record.without_expiry().expires_at, None);
    }

    #[test]
    fn test_archive_key_mapping() {
        let key = ArchiveKey::for_record(&RecordId::new("R1"));
        assert_eq!(key.as_str(), "R1.json");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::Throttled { retry_after: None }.is_transient());
        assert!(!StoreError::MalformedKey("".into()).is_transient());
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(StoreError::Io(timeout).is_transient());
        let missing = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(!StoreError::Io(missing).is_transient());
    }

    #[test]
    fn test_expiry_not_serialized_when_absent() {
        let record = Record::new("R1", 1, json!({"a": 1}));
        let text = serde_json::to_string(&record).unwrap();
        assert!(!text.contains("expires_at"));
    }
}
