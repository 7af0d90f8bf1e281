use std::fmt;

use tiered_archive_common::RecordId;

/// How a migration run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Every candidate was archived and removed from the hot store.
    Complete,
    /// Some records failed and stay hot until the next run.
    PartialFailure,
    /// Stopped early by the cancellation signal.
    Cancelled,
}

/// A record the run could not migrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub id: RecordId,
    pub reason: String,
    pub transient: bool,
}

/// Per-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Records returned by the age scan.
    pub scanned: u64,
    /// Newly written to the archive.
    pub archived: u64,
    /// Found in the archive from an earlier, interrupted run.
    pub already_archived: u64,
    /// Removed from the hot store.
    pub deleted: u64,
    /// Gone from the hot store before the run got to them.
    pub vanished: u64,
    /// No longer past the cutoff when re-read.
    pub skipped_young: u64,
    /// Rehydrated cache copies, left to expire.
    pub skipped_cache_copies: u64,
    pub failed: Vec<FailedRecord>,
    pub batches: u64,
    pub cancelled: bool,
    /// Set when the run continued from a checkpoint.
    pub resumed_after: Option<RecordId>,
}

impl MigrationReport {
    pub fn outcome(&self) -> MigrationOutcome {
        if self.cancelled {
            MigrationOutcome::Cancelled
        } else if !self.failed.is_empty() {
            MigrationOutcome::PartialFailure
        } else {
            MigrationOutcome::Complete
        }
    }

    /// Records the run made a decision about.
    pub fn processed(&self) -> u64 {
        self.deleted
            + self.vanished
            + self.skipped_young
            + self.skipped_cache_copies
            + self.failed.len() as u64
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned={} archived={} already_archived={} deleted={} vanished={} \
             skipped_young={} skipped_cache={} failed={} batches={}",
            self.scanned,
            self.archived,
            self.already_archived,
            self.deleted,
            self.vanished,
            self.skipped_young,
            self.skipped_cache_copies,
            self.failed.len(),
            self.batches,
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome() {
        let mut report = MigrationReport::default();
        assert_eq!(report.outcome(), MigrationOutcome::Complete);

        report.failed.push(FailedRecord {
            id: RecordId::new("R1"),
            reason: "down".into(),
            transient: true,
        });
        assert_eq!(report.outcome(), MigrationOutcome::PartialFailure);

        report.cancelled = true;
        assert_eq!(report.outcome(), MigrationOutcome::Cancelled);
    }

    #[test]
    fn test_display() {
        let report = MigrationReport {
            scanned: 2,
            archived: 2,
            deleted: 2,
            batches: 1,
            ..Default::default()
        };
        assert_eq!(
            report.to_string(),
            "scanned=2 archived=2 already_archived=0 deleted=2 vanished=0 \
             skipped_young=0 skipped_cache=0 failed=0 batches=1"
        );
        assert_eq!(report.processed(), 2);
    }
}
