use std::fs;
use std::path::Path;
use std::time::Instant;

use rusqlite::{Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::audit;
use crate::catalog::{foreign_keys_enabled, CatalogReader, SqliteCatalog};
use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::registry::StepRegistry;
use crate::step::{MigrationStep, StepContext};
use crate::version::{persist_schema_version, read_schema_version};

/// What a completed run did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationSummary {
    pub from_version: i64,
    pub to_version: i64,
    pub applied_versions: Vec<i64>,
    /// True when the store was already at the requested version.
    pub skipped: bool,
}

/// Where a store stands relative to a registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Drives a [`StepRegistry`] against one store.
pub struct MigrationRunner {
    registry: StepRegistry,
    config: MigrationConfig,
    catalog: Box<dyn CatalogReader>,
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MigrationRunner {
    #[must_use]
    pub fn new(registry: StepRegistry, config: MigrationConfig) -> Self {
        Self { registry, config, catalog: Box::new(SqliteCatalog) }
    }

    /// Replace the catalog steps read dependents through.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Box<dyn CatalogReader>) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Target versions `run` would apply, without touching the store.
    ///
    /// # Errors
    /// Returns [`MigrateError::Downgrade`] when `new_version < old_version`.
    pub fn plan(&self, old_version: i64, new_version: i64) -> Result<Vec<i64>> {
        check_direction(old_version, new_version)?;
        Ok(self
            .registry
            .pending_between(old_version, new_version)
            .map(|step| step.target_version())
            .collect())
    }

    /// Current stored version, the registry's latest version and the steps in between.
    ///
    /// # Errors
    /// Returns an error when the stored version cannot be read.
    pub fn status(&self, conn: &Connection) -> Result<SchemaStatus> {
        let current_version = read_schema_version(conn)?;
        let target_version = self.registry.latest_version().max(current_version);
        Ok(SchemaStatus {
            current_version,
            target_version,
            pending_versions: self.plan(current_version, target_version)?,
        })
    }

    /// Upgrade the store from `old_version` to `new_version`.
    ///
    /// Each step commits in its own transaction together with its version bump, so a
    /// failure leaves the store at the last completed step. The foreign key audit runs
    /// once at the end and any violation fails the run.
    ///
    /// # Errors
    /// Returns [`MigrateError::Downgrade`] for a backwards request, [`MigrateError::Corruption`]
    /// when the pre-flight integrity check fails, [`MigrateError::StepFailed`] wrapping
    /// the first failing step, and [`MigrateError::ForeignKeyViolations`] when the audit
    /// finds dangling references.
    pub fn run(
        &self,
        conn: &mut Connection,
        old_version: i64,
        new_version: i64,
    ) -> Result<MigrationSummary> {
        check_direction(old_version, new_version)?;
        if old_version == new_version {
            debug!(version = old_version, "schema already at requested version");
            return Ok(MigrationSummary {
                from_version: old_version,
                to_version: new_version,
                applied_versions: Vec::new(),
                skipped: true,
            });
        }
        self.config.validate()?;

        let started = Instant::now();
        info!(from = old_version, to = new_version, "starting schema migration");

        if self.config.integrity_check_first {
            integrity_check(conn)?;
        }
        if let Some(path) = &self.config.backup_path {
            backup_store(conn, path)?;
        }

        let mut applied_versions = Vec::new();
        for step in self.registry.pending_between(old_version, new_version) {
            let version = step.target_version();
            self.apply_step(conn, step)
                .map_err(|source| MigrateError::StepFailed { version, source: Box::new(source) })?;
            applied_versions.push(version);
        }

        let reached = applied_versions.last().copied().unwrap_or(old_version);
        if new_version > reached {
            let tx = conn.transaction()?;
            persist_schema_version(&tx, new_version, None)?;
            tx.commit()?;
            debug!(from = reached, to = new_version, "advanced version across retired steps");
        }

        let report = audit(conn)?;
        if !report.is_empty() {
            for violation in report.iter() {
                warn!(
                    table = %violation.table,
                    rowid = ?violation.rowid,
                    referenced_table = %violation.referenced_table,
                    "foreign key violation after migration"
                );
            }
            return Err(MigrateError::ForeignKeyViolations(report));
        }

        info!(
            from = old_version,
            to = new_version,
            steps = applied_versions.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "schema migration complete"
        );
        Ok(MigrationSummary {
            from_version: old_version,
            to_version: new_version,
            applied_versions,
            skipped: false,
        })
    }

    fn apply_step(&self, conn: &mut Connection, step: &dyn MigrationStep) -> Result<()> {
        // SQLite ignores this pragma inside a transaction, so it is toggled around it.
        let restore = if step.requires_constraints_disabled() {
            let previous = foreign_keys_enabled(conn)?;
            set_foreign_keys(conn, false)?;
            Some(previous)
        } else {
            None
        };

        let result = self.apply_in_transaction(conn, step);

        if let Some(previous) = restore {
            let restored = set_foreign_keys(conn, previous);
            result?;
            restored?;
            return Ok(());
        }
        result
    }

    fn apply_in_transaction(&self, conn: &mut Connection, step: &dyn MigrationStep) -> Result<()> {
        let started = Instant::now();
        let ctx = StepContext { config: &self.config, catalog: self.catalog.as_ref() };

        let tx = conn.transaction()?;
        step.apply(&tx, &ctx)?;
        persist_schema_version(&tx, step.target_version(), Some(&step.fingerprint()))?;
        tx.commit()?;

        info!(
            version = step.target_version(),
            name = step.name(),
            constraints_disabled = step.requires_constraints_disabled(),
            elapsed_ms = started.elapsed().as_millis(),
            "applied migration step"
        );
        Ok(())
    }
}

fn check_direction(old_version: i64, new_version: i64) -> Result<()> {
    if new_version < old_version {
        return Err(MigrateError::Downgrade { from: old_version, to: new_version });
    }
    Ok(())
}

fn set_foreign_keys(conn: &Connection, enabled: bool) -> Result<()> {
    let sql = if enabled { "PRAGMA foreign_keys = ON" } else { "PRAGMA foreign_keys = OFF" };
    conn.execute_batch(sql)?;
    Ok(())
}

/// Fail with [`MigrateError::Corruption`] unless `PRAGMA integrity_check` reports `ok`.
///
/// # Errors
/// Returns an error when the check cannot run or reports problems.
pub fn integrity_check(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let messages = rows.collect::<rusqlite::Result<Vec<String>>>()?;
    if messages.len() == 1 && messages[0] == "ok" {
        return Ok(());
    }
    Err(MigrateError::Corruption(messages.join("; ")))
}

/// Online backup of the main database to `out_file`.
///
/// # Errors
/// Returns an error when the parent directory cannot be created or the backup fails.
pub fn backup_store(conn: &Connection, out_file: &Path) -> Result<()> {
    if let Some(parent) = out_file.parent() {
        fs::create_dir_all(parent)?;
    }
    conn.backup(DatabaseName::Main, out_file, None)?;
    info!(path = %out_file.display(), "wrote pre-migration backup");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::step::{DeclarativeStep, Operation, ProceduralStep};
    use crate::version::applied_history;

    fn open() -> anyhow::Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(conn)
    }

    fn base_steps() -> Vec<Box<dyn MigrationStep>> {
        vec![
            Box::new(DeclarativeStep::new(
                1,
                "CREATE_THREAD",
                vec![Operation::create_table("thread", "_id INTEGER PRIMARY KEY, title TEXT")],
            )),
            Box::new(DeclarativeStep::new(
                2,
                "CREATE_MESSAGE",
                vec![Operation::create_table(
                    "message",
                    "_id INTEGER PRIMARY KEY, thread_id INTEGER REFERENCES thread (_id)",
                )],
            )),
        ]
    }

    fn runner(steps: Vec<Box<dyn MigrationStep>>) -> anyhow::Result<MigrationRunner> {
        Ok(MigrationRunner::new(StepRegistry::new(steps)?, MigrationConfig::default()))
    }

    #[test]
    fn applies_pending_steps_and_records_history() -> anyhow::Result<()> {
        let mut conn = open()?;
        let summary = runner(base_steps())?.run(&mut conn, 0, 2)?;

        assert_eq!(summary.applied_versions, vec![1, 2]);
        assert!(!summary.skipped);
        assert_eq!(read_schema_version(&conn)?, 2);
        let history = applied_history(&conn)?;
        assert_eq!(history.iter().map(|step| step.version).collect::<Vec<_>>(), vec![1, 2]);
        assert!(history
            .iter()
            .all(|step| step.fingerprint.as_deref().is_some_and(|f| f.starts_with("sha256:"))));
        Ok(())
    }

    #[test]
    fn failing_step_leaves_previous_version_committed() -> anyhow::Result<()> {
        let mut conn = open()?;
        let mut steps = base_steps();
        steps.push(Box::new(ProceduralStep::new(3, "BROKEN", |conn, _ctx| {
            conn.execute_batch("CREATE TABLE half_done (_id INTEGER PRIMARY KEY)")?;
            conn.execute_batch("INSERT INTO missing_table VALUES (1)")?;
            Ok(())
        })));

        let err = runner(steps)?.run(&mut conn, 0, 3).err();
        assert!(matches!(err, Some(MigrateError::StepFailed { version: 3, .. })));
        assert_eq!(read_schema_version(&conn)?, 2);
        assert!(!crate::catalog::table_exists(&conn, "half_done")?);
        Ok(())
    }

    #[test]
    fn constraints_are_disabled_only_for_flagged_steps() -> anyhow::Result<()> {
        let mut conn = open()?;
        let seen_flagged = Rc::new(Cell::new(None));
        let seen_plain = Rc::new(Cell::new(None));
        let flagged = Rc::clone(&seen_flagged);
        let plain = Rc::clone(&seen_plain);

        let steps: Vec<Box<dyn MigrationStep>> = vec![
            Box::new(
                ProceduralStep::new(1, "FLAGGED", move |conn, _ctx| {
                    flagged.set(Some(foreign_keys_enabled(conn)?));
                    Ok(())
                })
                .with_constraints_disabled(),
            ),
            Box::new(ProceduralStep::new(2, "PLAIN", move |conn, _ctx| {
                plain.set(Some(foreign_keys_enabled(conn)?));
                Ok(())
            })),
        ];
        runner(steps)?.run(&mut conn, 0, 2)?;

        assert_eq!(seen_flagged.get(), Some(false));
        assert_eq!(seen_plain.get(), Some(true));
        assert!(foreign_keys_enabled(&conn)?);
        Ok(())
    }

    #[test]
    fn enforcement_is_restored_after_a_failing_flagged_step() -> anyhow::Result<()> {
        let mut conn = open()?;
        let steps: Vec<Box<dyn MigrationStep>> = vec![Box::new(
            ProceduralStep::new(1, "BROKEN", |conn, _ctx| {
                conn.execute_batch("SELECT * FROM nowhere")?;
                Ok(())
            })
            .with_constraints_disabled(),
        )];
        assert!(runner(steps)?.run(&mut conn, 0, 1).is_err());
        assert!(foreign_keys_enabled(&conn)?);
        Ok(())
    }

    #[test]
    fn residual_violations_are_fatal() -> anyhow::Result<()> {
        let mut conn = open()?;
        let mut steps = base_steps();
        steps.push(Box::new(
            ProceduralStep::new(3, "SEED_DANGLING", |conn, _ctx| {
                conn.execute_batch("INSERT INTO message (_id, thread_id) VALUES (13, 99)")?;
                Ok(())
            })
            .with_constraints_disabled(),
        ));

        let err = runner(steps)?.run(&mut conn, 0, 3).err();
        let report = err.as_ref().and_then(MigrateError::violations);
        assert_eq!(report.map(|report| report.render()), Some("(message, 13, thread)".to_string()));
        assert!(err.is_some_and(|err| err.is_data_integrity()));
        assert_eq!(read_schema_version(&conn)?, 3);
        Ok(())
    }

    #[test]
    fn trailing_gap_advances_version() -> anyhow::Result<()> {
        let mut conn = open()?;
        let summary = runner(base_steps())?.run(&mut conn, 0, 5)?;
        assert_eq!(summary.applied_versions, vec![1, 2]);
        assert_eq!(read_schema_version(&conn)?, 5);
        Ok(())
    }

    #[test]
    fn rerun_at_target_version_is_a_no_op() -> anyhow::Result<()> {
        let mut conn = open()?;
        let runner = runner(base_steps())?;
        runner.run(&mut conn, 0, 2)?;

        let before: i64 = conn.query_row("SELECT total_changes()", [], |row| row.get(0))?;
        let summary = runner.run(&mut conn, 2, 2)?;
        let after: i64 = conn.query_row("SELECT total_changes()", [], |row| row.get(0))?;
        assert!(summary.skipped);
        assert!(summary.applied_versions.is_empty());
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn downgrade_is_rejected_before_any_write() -> anyhow::Result<()> {
        let mut conn = open()?;
        let runner = runner(base_steps())?;
        let result = runner.run(&mut conn, 2, 1);
        assert!(matches!(result, Err(MigrateError::Downgrade { from: 2, to: 1 })));
        assert!(matches!(runner.plan(2, 1), Err(MigrateError::Downgrade { .. })));
        assert_eq!(read_schema_version(&conn)?, 0);
        Ok(())
    }

    #[test]
    fn plan_lists_versions_without_writing() -> anyhow::Result<()> {
        let conn = open()?;
        let runner = runner(base_steps())?;
        assert_eq!(runner.plan(0, 2)?, vec![1, 2]);
        assert_eq!(runner.plan(1, 9)?, vec![2]);
        assert_eq!(read_schema_version(&conn)?, 0);
        Ok(())
    }

    #[test]
    fn status_reports_pending_versions() -> anyhow::Result<()> {
        let mut conn = open()?;
        let runner = runner(base_steps())?;
        assert_eq!(
            runner.status(&conn)?,
            SchemaStatus { current_version: 0, target_version: 2, pending_versions: vec![1, 2] }
        );
        runner.run(&mut conn, 0, 1)?;
        assert_eq!(runner.status(&conn)?.pending_versions, vec![2]);
        Ok(())
    }

    #[test]
    fn backup_is_written_before_first_step() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backup = dir.path().join("backups").join("pre-migration.sqlite3");
        let config =
            MigrationConfig { backup_path: Some(backup.clone()), ..MigrationConfig::default() };
        let mut conn = open()?;
        conn.execute_batch("CREATE TABLE legacy (_id INTEGER PRIMARY KEY)")?;

        MigrationRunner::new(StepRegistry::new(base_steps())?, config).run(&mut conn, 0, 2)?;

        let copy = Connection::open(&backup)?;
        assert!(crate::catalog::table_exists(&copy, "legacy")?);
        assert!(!crate::catalog::table_exists(&copy, "thread")?);
        Ok(())
    }
}
