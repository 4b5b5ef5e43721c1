//! Entity merge: collapse rows that describe the same entity into the most recently
//! active one, re-point references and remember the stale identifiers.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::info;

use super::{for_each_shared_key, where_clause};
use crate::catalog::quote_ident;
use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::{MigrateError, Result};

/// Column definitions of every remap ledger table.
pub const LEDGER_COLUMNS: &str =
    "_id INTEGER PRIMARY KEY AUTOINCREMENT, old_id INTEGER UNIQUE, new_id INTEGER";

/// Durable `old_id -> new_id` table written by [`merge_entities`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapLedger {
    table: String,
}

impl RemapLedger {
    #[must_use]
    pub fn new(table: &str) -> Self {
        Self { table: table.to_string() }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn create_sql(&self) -> String {
        format!("CREATE TABLE IF NOT EXISTS {} ({LEDGER_COLUMNS})", quote_ident(&self.table))
    }

    /// Record `old_id -> new_id` and rewrite entries that pointed at `old_id`, so every
    /// stale identifier resolves in one hop.
    fn record(&self, conn: &Connection, old_id: i64, new_id: i64) -> Result<()> {
        let table = quote_ident(&self.table);
        conn.execute(
            &format!("UPDATE {table} SET new_id = ?1 WHERE new_id = ?2"),
            params![new_id, old_id],
        )?;
        conn.execute(
            &format!(
                "INSERT INTO {table} (old_id, new_id) VALUES (?1, ?2)
                 ON CONFLICT (old_id) DO UPDATE SET new_id = excluded.new_id"
            ),
            params![old_id, new_id],
        )?;
        Ok(())
    }
}

/// Rows sharing `group_columns` are the same entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMerge {
    pub table: String,
    pub id_column: String,
    pub group_columns: Vec<String>,
    /// Higher value means more recent; NULL sorts as least recent.
    pub activity_column: String,
    /// `(table, column)` pairs referencing `id_column`, re-pointed in this order.
    pub dependents: Vec<(String, String)>,
    pub ledger: Option<RemapLedger>,
    /// Groups read per query.
    pub batch_size: usize,
}

impl EntityMerge {
    #[must_use]
    pub fn new(
        table: &str,
        id_column: &str,
        group_columns: &[&str],
        activity_column: &str,
    ) -> Self {
        Self {
            table: table.to_string(),
            id_column: id_column.to_string(),
            group_columns: group_columns.iter().map(ToString::to_string).collect(),
            activity_column: activity_column.to_string(),
            dependents: Vec::new(),
            ledger: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_dependent(mut self, table: &str, column: &str) -> Self {
        self.dependents.push((table.to_string(), column.to_string()));
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_ledger(mut self, table: &str) -> Self {
        self.ledger = Some(RemapLedger::new(table));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub groups: usize,
    pub merged: usize,
    pub repointed: usize,
}

/// Merge every group of `plan.table` with more than one row into its primary: the row
/// with the latest activity, ties broken by the highest identifier.
///
/// # Errors
/// Returns [`MigrateError::Config`] when the plan has no group columns and
/// [`MigrateError::Sqlite`] when a statement fails.
pub fn merge_entities(conn: &Connection, plan: &EntityMerge) -> Result<MergeCounts> {
    if plan.group_columns.is_empty() {
        return Err(MigrateError::Config(format!(
            "entity merge on `{}` has no group columns",
            plan.table
        )));
    }
    if let Some(ledger) = &plan.ledger {
        conn.execute_batch(&ledger.create_sql())?;
    }

    let table = quote_ident(&plan.table);
    let id = quote_ident(&plan.id_column);
    let members_sql = format!(
        "SELECT {id} FROM {table} WHERE {filter} ORDER BY {activity} DESC, {id} DESC",
        filter = where_clause(&plan.group_columns, 1),
        activity = quote_ident(&plan.activity_column),
    );
    let delete_sql = format!("DELETE FROM {table} WHERE {id} = ?1");

    let mut counts = MergeCounts::default();
    // Merging only deletes rows, so a visited group never reappears.
    for_each_shared_key(conn, &plan.table, &plan.group_columns, plan.batch_size, |group| {
        let members = {
            let mut stmt = conn.prepare(&members_sql)?;
            let rows = stmt.query_map(params_from_iter(group.iter()), |row| row.get::<_, i64>(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        };
        let Some((&primary, secondaries)) = members.split_first() else {
            return Ok(());
        };
        counts.groups += 1;

        for &secondary in secondaries {
            for (dependent_table, dependent_column) in &plan.dependents {
                counts.repointed += conn.execute(
                    &format!(
                        "UPDATE {} SET {column} = ?1 WHERE {column} = ?2",
                        quote_ident(dependent_table),
                        column = quote_ident(dependent_column),
                    ),
                    params![primary, secondary],
                )?;
            }
            if let Some(ledger) = &plan.ledger {
                ledger.record(conn, secondary, primary)?;
            }
            conn.execute(&delete_sql, [secondary])?;
            counts.merged += 1;
        }
        Ok(())
    })?;

    if counts.groups > 0 {
        info!(
            table = %plan.table,
            groups = counts.groups,
            merged = counts.merged,
            repointed = counts.repointed,
            "merged duplicate entities"
        );
    }
    Ok(counts)
}

/// The identifier `id` was merged into, or `id` itself when it was never remapped.
///
/// # Errors
/// Returns [`MigrateError::Sqlite`] when the ledger cannot be read.
pub fn resolve_remapped(conn: &Connection, ledger: &RemapLedger, id: i64) -> Result<i64> {
    let remapped: Option<i64> = conn
        .query_row(
            &format!("SELECT new_id FROM {} WHERE old_id = ?1", quote_ident(ledger.table())),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(remapped.unwrap_or(id))
}
