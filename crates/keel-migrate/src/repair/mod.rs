//! Data repairs that must run before a tightened constraint is introduced.
//!
//! Every repair is deterministic and idempotent: a second run over repaired data finds
//! nothing to do and writes nothing.

pub mod dedupe;
pub mod merge;
pub mod orphans;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::catalog::quote_ident;
use crate::error::{MigrateError, Result};

pub use dedupe::{
    resolve, ColumnsEqual, DedupeCounts, DuplicateRepair, JsonFieldsEqual, PayloadEquality,
};
pub use merge::{
    merge_entities, resolve_remapped, EntityMerge, MergeCounts, RemapLedger, LEDGER_COLUMNS,
};
pub use orphans::{remove_dangling, remove_dangling_all, DanglingPolicy, DanglingReference};

/// One row as loaded by a repair scan: its stable identifier plus the columns the
/// repair needs, in the order they were requested.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSnapshot {
    pub id: i64,
    pub values: Vec<(String, Value)>,
}

impl RowSnapshot {
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }
}

fn where_clause(columns: &[String], first_param: usize) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(offset, column)| format!("{} = ?{}", quote_ident(column), first_param + offset))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|column| quote_ident(column)).collect::<Vec<_>>().join(", ")
}

fn not_null_clause(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| format!("{} IS NOT NULL", quote_ident(column)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Visit every key tuple of `columns` shared by more than one row of `table`, in key
/// order, reading at most `batch_size` tuples per query. Tuples with a NULL component
/// are skipped.
///
/// `visit` may rewrite the rows of the tuple it is given as long as every rewritten key
/// sorts below it; paging resumes strictly after the last visited tuple.
fn for_each_shared_key<F>(
    conn: &Connection,
    table: &str,
    columns: &[String],
    batch_size: usize,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(&[Value]) -> Result<()>,
{
    if batch_size == 0 {
        return Err(MigrateError::Config(format!(
            "batch size for `{table}` must be greater than zero"
        )));
    }
    let keys = column_list(columns);
    let table = quote_ident(table);
    let not_null = not_null_clause(columns);
    let width = columns.len();
    let limit = Value::Integer(i64::try_from(batch_size).unwrap_or(i64::MAX));

    let mut after: Option<Vec<Value>> = None;
    loop {
        let sql = match &after {
            None => format!(
                "SELECT {keys} FROM {table} WHERE {not_null} \
                 GROUP BY {keys} HAVING COUNT(*) > 1 ORDER BY {keys} LIMIT ?1"
            ),
            Some(_) => format!(
                "SELECT {keys} FROM {table} WHERE {not_null} AND ({keys}) > ({cursor}) \
                 GROUP BY {keys} HAVING COUNT(*) > 1 ORDER BY {keys} LIMIT ?{limit_param}",
                cursor = (1..=width).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", "),
                limit_param = width + 1,
            ),
        };
        let bound = after.iter().flatten().chain(std::iter::once(&limit));
        let mut page = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(bound), |row| {
                (0..width).map(|i| row.get::<_, Value>(i)).collect::<rusqlite::Result<Vec<_>>>()
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for key in &page {
            visit(key)?;
        }
        if page.len() < batch_size {
            return Ok(());
        }
        after = page.pop();
    }
}

/// Number of key tuples of `columns` still shared by more than one row.
fn count_shared_keys(conn: &Connection, table: &str, columns: &[String]) -> Result<usize> {
    let keys = column_list(columns);
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {table} WHERE {not_null} \
             GROUP BY {keys} HAVING COUNT(*) > 1)",
            table = quote_ident(table),
            not_null = not_null_clause(columns),
        ),
        [],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or(0))
}
