//! The persisted schema version. `PRAGMA user_version` is authoritative; the
//! `schema_migrations` table is an applied-step history kept for diagnostics.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{MigrateError, Result};

pub(crate) const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL,
  fingerprint TEXT
);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedStep {
    pub version: i64,
    pub applied_at: String,
    pub fingerprint: Option<String>,
}

/// # Errors
/// Returns an error when the pragma cannot be read.
pub fn read_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))?;
    Ok(version)
}

/// Record `version` as the store's schema version. Refuses to move backwards.
///
/// # Errors
/// Returns [`MigrateError::VersionRegression`] when `version` is below the stored one,
/// or an error when the write fails.
pub fn persist_schema_version(
    conn: &Connection,
    version: i64,
    fingerprint: Option<&str>,
) -> Result<()> {
    let current = read_schema_version(conn)?;
    if version < current {
        return Err(MigrateError::VersionRegression { current, attempted: version });
    }

    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
    let applied_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
    conn.execute(
        "INSERT INTO schema_migrations(version, applied_at, fingerprint) VALUES (?1, ?2, ?3)
         ON CONFLICT(version) DO UPDATE SET
           applied_at = excluded.applied_at,
           fingerprint = excluded.fingerprint",
        params![version, applied_at, fingerprint],
    )?;
    // user_version does not accept bound parameters; `version` is an integer.
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))?;
    Ok(())
}

/// Applied-step history in ascending version order.
///
/// # Errors
/// Returns an error when the history table cannot be read.
pub fn applied_history(conn: &Connection) -> Result<Vec<AppliedStep>> {
    if !crate::catalog::table_exists(conn, "schema_migrations")? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT version, applied_at, fingerprint FROM schema_migrations ORDER BY version ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(AppliedStep { version: row.get(0)?, applied_at: row.get(1)?, fingerprint: row.get(2)? })
    })?;
    let mut history = Vec::new();
    for row in rows {
        history.push(row?);
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_reports_version_zero() -> anyhow::Result<()> {
        let conn = Connection::open_in_memory()?;
        assert_eq!(read_schema_version(&conn)?, 0);
        assert!(applied_history(&conn)?.is_empty());
        Ok(())
    }

    #[test]
    fn persist_records_version_and_history() -> anyhow::Result<()> {
        let conn = Connection::open_in_memory()?;
        persist_schema_version(&conn, 3, Some("abc"))?;
        persist_schema_version(&conn, 3, Some("abc"))?;
        persist_schema_version(&conn, 7, None)?;

        assert_eq!(read_schema_version(&conn)?, 7);
        let history = applied_history(&conn)?;
        let versions: Vec<i64> = history.iter().map(|step| step.version).collect();
        assert_eq!(versions, vec![3, 7]);
        assert_eq!(history[0].fingerprint.as_deref(), Some("abc"));
        Ok(())
    }

    #[test]
    fn persist_rejects_regression() -> anyhow::Result<()> {
        let conn = Connection::open_in_memory()?;
        persist_schema_version(&conn, 5, None)?;
        let err = match persist_schema_version(&conn, 4, None) {
            Ok(()) => return Err(anyhow::anyhow!("expected version regression to fail")),
            Err(err) => err,
        };
        assert!(matches!(err, MigrateError::VersionRegression { current: 5, attempted: 4 }));
        assert_eq!(read_schema_version(&conn)?, 5);
        Ok(())
    }
}
