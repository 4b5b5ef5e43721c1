use rusqlite::Connection;
use tracing::info;

use crate::catalog::quote_ident;
use crate::error::{MigrateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DanglingPolicy {
    Delete,
    SetNull,
}

/// `table.column` must point at an existing `referenced_table.referenced_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub table: String,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    pub policy: DanglingPolicy,
}

impl DanglingReference {
    #[must_use]
    pub fn delete(
        table: &str,
        column: &str,
        referenced_table: &str,
        referenced_column: &str,
    ) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            referenced_table: referenced_table.to_string(),
            referenced_column: referenced_column.to_string(),
            policy: DanglingPolicy::Delete,
        }
    }

    #[must_use]
    pub fn set_null(
        table: &str,
        column: &str,
        referenced_table: &str,
        referenced_column: &str,
    ) -> Self {
        let rule = Self::delete(table, column, referenced_table, referenced_column);
        Self { policy: DanglingPolicy::SetNull, ..rule }
    }

    /// Rowids of at most `?1` dangling rows. NULL references are not dangling.
    fn batch_selector(&self) -> String {
        format!(
            "SELECT child.rowid FROM {table} AS child
             WHERE child.{column} IS NOT NULL
               AND NOT EXISTS (
                 SELECT 1 FROM {parent} AS parent WHERE parent.{parent_column} = child.{column}
               )
             LIMIT ?1",
            table = quote_ident(&self.table),
            column = quote_ident(&self.column),
            parent = quote_ident(&self.referenced_table),
            parent_column = quote_ident(&self.referenced_column),
        )
    }
}

/// Remove or detach every row of `rule.table` whose reference has no parent row,
/// `batch_size` rows per statement. Returns the number of rows touched.
///
/// # Errors
/// Returns [`MigrateError::Config`] for a zero batch size and [`MigrateError::Sqlite`]
/// when a statement fails.
pub fn remove_dangling(
    conn: &Connection,
    rule: &DanglingReference,
    batch_size: usize,
) -> Result<usize> {
    let limit = i64::try_from(batch_size)
        .ok()
        .filter(|limit| *limit > 0)
        .ok_or_else(|| MigrateError::Config(format!("invalid batch size {batch_size}")))?;

    let table = quote_ident(&rule.table);
    let statement = match rule.policy {
        DanglingPolicy::Delete => {
            format!("DELETE FROM {table} WHERE rowid IN ({})", rule.batch_selector())
        }
        DanglingPolicy::SetNull => format!(
            "UPDATE {table} SET {column} = NULL WHERE rowid IN ({})",
            rule.batch_selector(),
            column = quote_ident(&rule.column),
        ),
    };

    let mut stmt = conn.prepare(&statement)?;
    let mut touched = 0;
    loop {
        let changed = stmt.execute([limit])?;
        touched += changed;
        if changed == 0 {
            break;
        }
    }

    if touched > 0 {
        info!(
            table = %rule.table,
            column = %rule.column,
            referenced_table = %rule.referenced_table,
            policy = ?rule.policy,
            rows = touched,
            "removed dangling references"
        );
    }
    Ok(touched)
}

/// Apply `rules` in declared order, parents first, returning one count per rule.
///
/// # Errors
/// Stops at the first failing rule; see [`remove_dangling`].
pub fn remove_dangling_all(
    conn: &Connection,
    rules: &[DanglingReference],
    batch_size: usize,
) -> Result<Vec<usize>> {
    rules.iter().map(|rule| remove_dangling(conn, rule, batch_size)).collect()
}
