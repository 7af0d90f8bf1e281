use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tiered_archive_common::format::{encode_record, FormatError};
use tiered_archive_common::retry::retry_transient;
use tiered_archive_common::{ArchiveKey, ArchiveStore, Clock, HotStore, Record, RecordId, StoreError, Timestamp};
use tiered_archive_policy::{RetryPolicy, TierPolicy};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cursor::{CursorFile, MigrationCursor};
use crate::report::{FailedRecord, MigrationOutcome, MigrationReport};

/// Tuning for migration runs.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Records fetched per scan page.
    pub batch_size: usize,
    /// Confirm each archive write with `exists` before deleting the hot copy.
    pub verify_writes: bool,
    /// Transient record failures in a row that count as a store outage.
    pub max_consecutive_failures: u32,
    /// Where to checkpoint the cursor. `None` disables resumption.
    pub cursor_path: Option<PathBuf>,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            verify_writes: true,
            max_consecutive_failures: 5,
            cursor_path: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("a migration run is already in progress")]
    AlreadyRunning,

    #[error("hot store scan failed: {source}")]
    ScanFailed {
        #[source]
        source: StoreError,
        report: Box<MigrationReport>,
    },

    #[error("aborted after {failures} consecutive transient failures, last: {last_error}")]
    Outage {
        failures: u32,
        last_error: String,
        report: Box<MigrationReport>,
    },
}

impl MigrationError {
    /// Progress made before the run stopped.
    pub fn report(&self) -> Option<&MigrationReport> {
        match self {
            MigrationError::AlreadyRunning => None,
            MigrationError::ScanFailed { report, .. } | MigrationError::Outage { report, .. } => Some(report),
        }
    }
}

/// What happened to one scanned record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Migrated { uploaded: bool, deleted: bool },
    Vanished,
    SkippedYoung,
    SkippedCacheCopy,
}

#[derive(Debug, thiserror::Error)]
enum RecordError {
    #[error("{stage} failed: {source}")]
    Store {
        stage: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("archive encoding failed: {0}")]
    Encode(#[from] FormatError),

    #[error("archive write to {0} was not confirmed")]
    Unconfirmed(ArchiveKey),

    #[error("record has an empty partition key")]
    MalformedKey,
}

impl RecordError {
    fn store(stage: &'static str) -> impl FnOnce(StoreError) -> RecordError {
        move |source| RecordError::Store { stage, source }
    }

    fn is_transient(&self) -> bool {
        match self {
            RecordError::Store { source, .. } => source.is_transient(),
            RecordError::Unconfirmed(_) => true,
            RecordError::Encode(_) | RecordError::MalformedKey => false,
        }
    }
}

/// Moves aged records from the hot store to the archive store.
///
/// Per record the order is always: archive write, confirmation, hot delete.
/// A record whose write is not confirmed is left in the hot store for the
/// next run.
///
/// Runs of one `Migrator` never overlap. The run lock is in-process only:
/// separate processes sharing the same stores must rely on the scheduler
/// starting at most one instance at a time.
///
/// A run resumed from a checkpoint scans from the saved cursor to the end
/// of the key space, then wraps around and covers the ids up to the cursor,
/// so a completed run has seen every aged record.
pub struct Migrator {
    hot: Arc<dyn HotStore>,
    archive: Arc<dyn ArchiveStore>,
    clock: Arc<dyn Clock>,
    policy: TierPolicy,
    retry: RetryPolicy,
    config: MigratorConfig,
    cursor_file: Option<CursorFile>,
    run_lock: Mutex<()>,
}

impl Migrator {
    pub fn new(
        hot: Arc<dyn HotStore>,
        archive: Arc<dyn ArchiveStore>,
        clock: Arc<dyn Clock>,
        policy: TierPolicy,
        retry: RetryPolicy,
        config: MigratorConfig,
    ) -> Self {
        let cursor_file = config.cursor_path.clone().map(CursorFile::new);
        Self {
            hot,
            archive,
            clock,
            policy,
            retry,
            config,
            cursor_file,
            run_lock: Mutex::new(()),
        }
    }

    /// Run one migration pass. Returns `AlreadyRunning` if another pass
    /// holds the run lock.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<MigrationReport, MigrationError> {
        let _running = self.run_lock.try_lock().map_err(|_| MigrationError::AlreadyRunning)?;

        let now = self.clock.now();
        let cutoff = self.policy.cutoff_timestamp(now);
        let batch_size = self.config.batch_size.max(1);
        let mut report = MigrationReport::default();
        let mut cursor = self.resume_or_start(now, cutoff, &mut report).await;
        // Set once the scan has wrapped; ids past it were covered by the tail.
        let mut wrap_until: Option<RecordId> = None;
        let mut pending_wrap = report.resumed_after.clone();
        let mut consecutive_transient = 0u32;

        tracing::info!(
            cutoff,
            batch_size,
            resumed_after = ?report.resumed_after,
            "migration run starting"
        );

        'scan: loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let start_after = cursor.last_key.clone();
            let page = retry_transient(&self.retry, "hot.scan_older_than", || {
                self.hot.scan_older_than(cutoff, start_after.as_ref(), batch_size)
            })
            .await;
            let page = match page {
                Ok(page) => page,
                Err(source) => {
                    tracing::error!(error = %source, "hot store scan failed, aborting migration run");
                    self.checkpoint(&cursor).await;
                    return Err(MigrationError::ScanFailed {
                        source,
                        report: Box::new(report),
                    });
                }
            };

            let mut reached_end = page.len() < batch_size;

            for candidate in page {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'scan;
                }
                if wrap_until.as_ref().is_some_and(|stop| candidate.id > *stop) {
                    reached_end = true;
                    break;
                }

                report.scanned += 1;
                let id = candidate.id.clone();
                match self.migrate_one(candidate, now).await {
                    Ok(step) => {
                        consecutive_transient = 0;
                        record_step(&mut report, step);
                    }
                    Err(e) => {
                        let transient = e.is_transient();
                        tracing::warn!(id = %id, error = %e, transient, "record not migrated, it stays hot");
                        report.failed.push(FailedRecord {
                            id: id.clone(),
                            reason: e.to_string(),
                            transient,
                        });

                        if transient {
                            consecutive_transient += 1;
                            if consecutive_transient >= self.config.max_consecutive_failures.max(1) {
                                // Checkpoint before this record so the next run retries it.
                                self.checkpoint(&cursor).await;
                                tracing::error!(
                                    failures = consecutive_transient,
                                    "store outage suspected, aborting migration run"
                                );
                                return Err(MigrationError::Outage {
                                    failures: consecutive_transient,
                                    last_error: e.to_string(),
                                    report: Box::new(report),
                                });
                            }
                        }
                    }
                }
                cursor.last_key = Some(id);
            }

            report.batches += 1;
            cursor.batches_completed += 1;

            if reached_end {
                let Some(stop) = pending_wrap.take() else {
                    break;
                };
                tracing::info!(until = %stop, "reached end of scan, wrapping around to the checkpoint");
                cursor.last_key = None;
                wrap_until = Some(stop);
            }
            self.checkpoint(&cursor).await;
        }

        if report.cancelled {
            self.checkpoint(&cursor).await;
        } else {
            self.clear_checkpoint().await;
        }

        match report.outcome() {
            MigrationOutcome::Complete => tracing::info!(%report, "migration run complete"),
            MigrationOutcome::PartialFailure => {
                tracing::warn!(%report, "migration run finished with failures, they will be retried next run")
            }
            MigrationOutcome::Cancelled => tracing::info!(%report, "migration run cancelled"),
        }
        Ok(report)
    }

    /// Run passes every `every` until `cancel` fires. Scheduling in
    /// production belongs to an external scheduler; this serves local use.
    pub async fn run_periodic(&self, every: Duration, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.run(&cancel).await {
                tracing::error!(error = %e, "migration run failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(every) => {}
            }
        }
    }

    /// Archive-then-delete for a single scanned record.
    async fn migrate_one(&self, candidate: Record, now: Timestamp) -> Result<Step, RecordError> {
        if candidate.is_cache_copy() {
            return Ok(Step::SkippedCacheCopy);
        }
        if !self.policy.is_migration_candidate(&candidate, now) {
            return Ok(Step::SkippedYoung);
        }

        // Re-read: the scan page may be stale.
        let id = &candidate.id;
        let current = retry_transient(&self.retry, "hot.get", || self.hot.get(id))
            .await
            .map_err(RecordError::store("hot.get"))?;
        let Some(record) = current else {
            return Ok(Step::Vanished);
        };
        if record.is_cache_copy() {
            return Ok(Step::SkippedCacheCopy);
        }
        if !self.policy.is_migration_candidate(&record, now) {
            return Ok(Step::SkippedYoung);
        }
        if record.partition_key.is_empty() {
            return Err(RecordError::MalformedKey);
        }

        let key = ArchiveKey::for_record(&record.id);
        let already_archived = retry_transient(&self.retry, "archive.exists", || self.archive.exists(&key))
            .await
            .map_err(RecordError::store("archive.exists"))?;

        if !already_archived {
            let bytes = encode_record(&record)?;
            retry_transient(&self.retry, "archive.put", || self.archive.put(&key, bytes.clone()))
                .await
                .map_err(RecordError::store("archive.put"))?;

            if self.config.verify_writes {
                let confirmed = retry_transient(&self.retry, "archive.exists", || self.archive.exists(&key))
                    .await
                    .map_err(RecordError::store("archive.exists"))?;
                if !confirmed {
                    return Err(RecordError::Unconfirmed(key));
                }
            }
        }

        let deleted = retry_transient(&self.retry, "hot.delete", || self.hot.delete(&record.id))
            .await
            .map_err(RecordError::store("hot.delete"))?;

        tracing::debug!(id = %record.id, key = %key, uploaded = !already_archived, deleted, "record migrated");
        Ok(Step::Migrated {
            uploaded: !already_archived,
            deleted,
        })
    }

    async fn resume_or_start(
        &self,
        now: Timestamp,
        cutoff: Timestamp,
        report: &mut MigrationReport,
    ) -> MigrationCursor {
        let mut cursor = MigrationCursor::start(now, cutoff);
        let Some(file) = &self.cursor_file else {
            return cursor;
        };
        match file.load().await {
            Ok(Some(saved)) => {
                tracing::info!(
                    last_key = ?saved.last_key,
                    batches = saved.batches_completed,
                    "resuming migration from checkpoint"
                );
                report.resumed_after = saved.last_key.clone();
                cursor.last_key = saved.last_key;
            }
            Ok(None) => {}
            Err(e) => {
                // Starting over is always safe.
                tracing::warn!(path = %file.path().display(), error = %e, "ignoring unreadable migration checkpoint");
            }
        }
        cursor
    }

    async fn checkpoint(&self, cursor: &MigrationCursor) {
        if let Some(file) = &self.cursor_file {
            if let Err(e) = file.save(cursor).await {
                tracing::warn!(path = %file.path().display(), error = %e, "failed to checkpoint migration cursor");
            }
        }
    }

    async fn clear_checkpoint(&self) {
        if let Some(file) = &self.cursor_file {
            if let Err(e) = file.clear().await {
                tracing::warn!(path = %file.path().display(), error = %e, "failed to clear migration cursor");
            }
        }
    }
}

fn record_step(report: &mut MigrationReport, step: Step) {
    match step {
        Step::Migrated { uploaded, deleted } => {
            if uploaded {
                report.archived += 1;
            } else {
                report.already_archived += 1;
            }
            if deleted {
                report.deleted += 1;
            } else {
                report.vanished += 1;
            }
        }
        Step::Vanished => report.vanished += 1,
        Step::SkippedYoung => report.skipped_young += 1,
        Step::SkippedCacheCopy => report.skipped_cache_copies += 1,
    }
}
