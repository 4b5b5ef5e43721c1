use std::fmt;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One row whose foreign key has no matching parent row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    /// `None` for `WITHOUT ROWID` tables.
    pub rowid: Option<i64>,
    pub referenced_table: String,
    pub fk_index: i64,
}

impl fmt::Display for ForeignKeyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rowid {
            Some(rowid) => write!(f, "({}, {rowid}, {})", self.table, self.referenced_table),
            None => write!(f, "({}, -, {})", self.table, self.referenced_table),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViolationReport {
    pub violations: Vec<ForeignKeyViolation>,
}

impl ViolationReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForeignKeyViolation> {
        self.violations.iter()
    }

    /// One `(table, rowId, referencedTable)` line per violation.
    #[must_use]
    pub fn render(&self) -> String {
        self.violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
    }
}

/// Scan every declared foreign key in the store. Read-only.
///
/// # Errors
/// Returns an error when `PRAGMA foreign_key_check` cannot be run.
pub fn audit(conn: &Connection) -> Result<ViolationReport> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            referenced_table: row.get(2)?,
            fk_index: row.get(3)?,
        })
    })?;

    let mut violations = Vec::new();
    for row in rows {
        violations.push(row?);
    }
    Ok(ViolationReport { violations })
}
