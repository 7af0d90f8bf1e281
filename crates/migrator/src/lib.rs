//! Archival pipeline: drains aged records from the hot store into the
//! archive store, archive-then-delete, one record at a time.

pub mod cursor;
pub mod migrator;
pub mod report;

pub use cursor::{CursorFile, MigrationCursor};
pub use migrator::{MigrationError, Migrator, MigratorConfig};
pub use report::{FailedRecord, MigrationOutcome, MigrationReport};
