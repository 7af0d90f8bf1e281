//! Tier policy: age cutoff, rehydration lifetime and retry schedule.
//!
//! Everything here is a pure function of its inputs. Callers pass `now`
//! explicitly so decisions are reproducible in tests.

use std::time::Duration;

use tiered_archive_common::clock::duration_millis;
use tiered_archive_common::retry::Backoff;
use tiered_archive_common::{Record, Timestamp};

pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Default age beyond which records leave the hot tier.
pub const DEFAULT_CUTOFF: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Default lifetime of a rehydrated hot copy.
pub const DEFAULT_REHYDRATION_TTL: Duration = Duration::from_secs(60 * 60);

/// True when a record created at `timestamp` is at least `cutoff` old at
/// `now`. The boundary is inclusive; future timestamps are never expired.
pub fn is_expired_for_hot(timestamp: Timestamp, now: Timestamp, cutoff: Duration) -> bool {
    match now.checked_sub(timestamp) {
        Some(age) => age >= duration_millis(cutoff),
        None => false,
    }
}

/// Timestamp of something created `days` before `now`, clamped at the epoch.
pub fn days_before(now: Timestamp, days: u64) -> Timestamp {
    now.saturating_sub(duration_millis(DAY).saturating_mul(days))
}

/// Cutoff and rehydration settings shared by the migrator and the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    cutoff: Duration,
    rehydration_ttl: Duration,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CUTOFF, DEFAULT_REHYDRATION_TTL)
    }
}

impl TierPolicy {
    pub fn new(cutoff: Duration, rehydration_ttl: Duration) -> Self {
        Self {
            cutoff,
            rehydration_ttl,
        }
    }

    pub fn cutoff(&self) -> Duration {
        self.cutoff
    }

    /// Lifetime of a cache copy written back to the hot store. The hot
    /// store's own expiry enforces it.
    pub fn rehydration_ttl(&self) -> Duration {
        self.rehydration_ttl
    }

    /// Expiry instant for a cache copy written at `now`.
    pub fn rehydration_expiry(&self, now: Timestamp) -> Timestamp {
        now.saturating_add(duration_millis(self.rehydration_ttl))
    }

    pub fn is_expired_for_hot(&self, timestamp: Timestamp, now: Timestamp) -> bool {
        is_expired_for_hot(timestamp, now, self.cutoff)
    }

    /// Newest timestamp that is old enough to migrate at `now`.
    pub fn cutoff_timestamp(&self, now: Timestamp) -> Timestamp {
        now.saturating_sub(duration_millis(self.cutoff))
    }

    /// Whether the migrator should archive `record`. Rehydrated cache
    /// copies carry an old timestamp but are never re-archived; the hot
    /// store expires them instead.
    pub fn is_migration_candidate(&self, record: &Record, now: Timestamp) -> bool {
        !record.is_cache_copy() && self.is_expired_for_hot(record.timestamp, now)
    }
}

/// Exponential backoff schedule for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A schedule that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Backoff for RetryPolicy {
    fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_for(attempt)
    }
}
