//! Versioned schema migration for an embedded SQLite store.
//!
//! A [`StepRegistry`] lists the steps of every release in version order. The
//! [`MigrationRunner`] applies the pending ones, one transaction per step, persisting
//! the version as each step commits and auditing foreign keys once at the end. Steps
//! build on [`rebuild`] for structural changes SQLite cannot make in place and on
//! [`repair`] to heal data ahead of a tightened constraint.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod error;
pub mod rebuild;
pub mod registry;
pub mod repair;
pub mod runner;
pub mod step;
pub mod steps;
pub mod version;

use std::path::Path;

use rusqlite::Connection;

pub use audit::{audit, ForeignKeyViolation, ViolationReport};
pub use catalog::{CatalogReader, Dependent, DependentKind, SqliteCatalog, StaticCatalog};
pub use config::MigrationConfig;
pub use error::{MigrateError, PayloadError, Result};
pub use rebuild::{ColumnMapping, RebuildOutcome, RebuildPlan, RowProjection, TableRebuilder};
pub use registry::StepRegistry;
pub use runner::{MigrationRunner, MigrationSummary, SchemaStatus};
pub use step::{DeclarativeStep, MigrationStep, Operation, ProceduralStep, StepContext};
pub use version::{applied_history, read_schema_version, AppliedStep};

/// Open a store file with the pragmas every connection to it expects.
///
/// # Errors
/// Returns an error when the database cannot be opened or the pragmas cannot be applied.
pub fn open_store(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

/// Upgrade `conn` from `old_version` to `new_version` with the built-in release history
/// and default settings.
///
/// # Errors
/// See [`MigrationRunner::run`].
pub fn migrate(
    conn: &mut Connection,
    old_version: i64,
    new_version: i64,
) -> Result<MigrationSummary> {
    MigrationRunner::new(steps::builtin_registry()?, MigrationConfig::default()).run(
        conn,
        old_version,
        new_version,
    )
}
