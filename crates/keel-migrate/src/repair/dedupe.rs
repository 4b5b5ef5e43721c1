//! Duplicate resolution ahead of a new uniqueness constraint.
//!
//! Rows sharing the key tuple are split into payload-equivalence classes. Within a
//! class the smallest identifier survives and the rest are deleted. When several
//! classes survive, the most recent row (highest identifier) keeps the key and the
//! others get the perturbed key component walked downwards until the whole table has
//! no row with that tuple.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use super::{column_list, count_shared_keys, for_each_shared_key, where_clause, RowSnapshot};
use crate::catalog::{self, quote_ident};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::{MigrateError, PayloadError, Result};

/// Decides whether two rows colliding on the key carry the same payload.
pub trait PayloadEquality {
    /// # Errors
    /// Returns [`PayloadError`] when either payload cannot be interpreted. The repair
    /// logs it and treats the pair as distinct.
    fn equivalent(&self, a: &RowSnapshot, b: &RowSnapshot) -> Result<bool, PayloadError>;
}

impl<F> PayloadEquality for F
where
    F: Fn(&RowSnapshot, &RowSnapshot) -> bool,
{
    fn equivalent(&self, a: &RowSnapshot, b: &RowSnapshot) -> Result<bool, PayloadError> {
        Ok(self(a, b))
    }
}

/// Equal when the selected columns (all loaded payload columns by default) are equal.
#[derive(Debug, Clone, Default)]
pub struct ColumnsEqual {
    columns: Option<Vec<String>>,
}

impl ColumnsEqual {
    #[must_use]
    pub fn all() -> Self {
        Self { columns: None }
    }

    #[must_use]
    pub fn only(columns: &[&str]) -> Self {
        Self { columns: Some(columns.iter().map(ToString::to_string).collect()) }
    }
}

impl PayloadEquality for ColumnsEqual {
    fn equivalent(&self, a: &RowSnapshot, b: &RowSnapshot) -> Result<bool, PayloadError> {
        match &self.columns {
            None => Ok(a.values.iter().map(|(_, v)| v).eq(b.values.iter().map(|(_, v)| v))),
            Some(columns) => Ok(columns.iter().all(|column| a.get(column) == b.get(column))),
        }
    }
}

/// Equal when a JSON text column parses to the same document once `ignored` top-level
/// keys are removed. Unparseable payloads are reported as anomalies.
#[derive(Debug, Clone)]
pub struct JsonFieldsEqual {
    column: String,
    ignored: Vec<String>,
}

impl JsonFieldsEqual {
    #[must_use]
    pub fn new(column: &str, ignored: &[&str]) -> Self {
        let ignored = ignored.iter().map(ToString::to_string).collect();
        Self { column: column.to_string(), ignored }
    }

    fn parse(&self, row: &RowSnapshot) -> Result<JsonValue, PayloadError> {
        let raw = match row.get(&self.column) {
            Some(Value::Text(raw)) => raw,
            Some(Value::Null) => return Ok(JsonValue::Null),
            Some(other) => {
                return Err(PayloadError::new(
                    row.id,
                    format!("column `{}` holds {other:?}, expected JSON text", self.column),
                ))
            }
            None => {
                let reason = format!("column `{}` was not loaded", self.column);
                return Err(PayloadError::new(row.id, reason))
            }
        };
        let mut parsed: JsonValue = serde_json::from_str(raw)
            .map_err(|err| PayloadError::new(row.id, format!("invalid JSON payload: {err}")))?;
        if let JsonValue::Object(map) = &mut parsed {
            for key in &self.ignored {
                map.remove(key);
            }
        }
        Ok(parsed)
    }
}

impl PayloadEquality for JsonFieldsEqual {
    fn equivalent(&self, a: &RowSnapshot, b: &RowSnapshot) -> Result<bool, PayloadError> {
        Ok(self.parse(a)? == self.parse(b)?)
    }
}

/// A uniqueness constraint about to be introduced over `key_columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateRepair {
    pub table: String,
    pub key_columns: Vec<String>,
    pub identity_column: String,
    /// Integer key component adjusted for colliding rows with distinct payloads.
    pub perturb_column: String,
    /// Columns loaded for the payload predicate; empty means every non-key column.
    pub payload_columns: Vec<String>,
    /// Conflict groups read per query.
    pub batch_size: usize,
}

impl DuplicateRepair {
    /// Perturbs the last key column and loads every non-key column as payload.
    #[must_use]
    pub fn new(table: &str, key_columns: &[&str], identity_column: &str) -> Self {
        let key_columns: Vec<String> = key_columns.iter().map(ToString::to_string).collect();
        Self {
            table: table.to_string(),
            perturb_column: key_columns.last().cloned().unwrap_or_default(),
            key_columns,
            identity_column: identity_column.to_string(),
            payload_columns: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn perturbing(mut self, column: &str) -> Self {
        self.perturb_column = column.to_string();
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, columns: &[&str]) -> Self {
        self.payload_columns = columns.iter().map(ToString::to_string).collect();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.key_columns.is_empty() {
            return Err(MigrateError::Config(format!(
                "duplicate repair on `{}` has no key columns",
                self.table
            )));
        }
        if self.perturb_index().is_none() {
            return Err(MigrateError::Config(format!(
                "perturbed column `{}` is not part of the key of `{}`",
                self.perturb_column, self.table
            )));
        }
        Ok(())
    }

    fn perturb_index(&self) -> Option<usize> {
        self.key_columns.iter().position(|column| column.eq_ignore_ascii_case(&self.perturb_column))
    }

    fn payload(&self, conn: &Connection) -> Result<Vec<String>> {
        if !self.payload_columns.is_empty() {
            return Ok(self.payload_columns.clone());
        }
        let excluded = |name: &String| {
            name.eq_ignore_ascii_case(&self.identity_column)
                || self.key_columns.iter().any(|key| key.eq_ignore_ascii_case(name))
        };
        let columns = catalog::table_columns(conn, &self.table)?;
        Ok(columns.into_iter().filter(|name| !excluded(name)).collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupeCounts {
    pub groups: usize,
    pub deleted: usize,
    pub perturbed: usize,
}

/// Resolve every conflict group of `repair` so a unique index over its key can be created.
///
/// # Errors
/// Returns [`MigrateError::UnresolvedDuplicates`] when collisions remain after the
/// repair, [`MigrateError::Config`] for an inconsistent repair description, and
/// [`MigrateError::Sqlite`] when a statement fails.
pub fn resolve(
    conn: &Connection,
    repair: &DuplicateRepair,
    predicate: &dyn PayloadEquality,
) -> Result<DedupeCounts> {
    repair.validate()?;
    let payload = repair.payload(conn)?;
    let mut counts = DedupeCounts::default();

    // Perturbed keys only ever move below the group being resolved.
    for_each_shared_key(conn, &repair.table, &repair.key_columns, repair.batch_size, |key| {
        counts.groups += 1;
        let rows = load_group(conn, repair, &payload, key)?;
        let classes = partition(&rows, predicate);

        for class in &classes {
            for duplicate in &class[1..] {
                delete_row(conn, repair, duplicate.id)?;
                counts.deleted += 1;
            }
        }

        let mut survivors: Vec<&RowSnapshot> = classes.iter().map(|class| class[0]).collect();
        survivors.sort_by(|a, b| b.id.cmp(&a.id));
        for survivor in survivors.iter().skip(1) {
            if perturb(conn, repair, key, survivor.id)? {
                counts.perturbed += 1;
            }
        }
        Ok(())
    })?;

    let remaining = count_shared_keys(conn, &repair.table, &repair.key_columns)?;
    if remaining > 0 {
        return Err(MigrateError::UnresolvedDuplicates {
            table: repair.table.clone(),
            groups: remaining,
        });
    }

    if counts.groups > 0 {
        info!(
            table = %repair.table,
            groups = counts.groups,
            deleted = counts.deleted,
            perturbed = counts.perturbed,
            "resolved duplicate keys"
        );
    }
    Ok(counts)
}

fn load_group(
    conn: &Connection,
    repair: &DuplicateRepair,
    payload: &[String],
    key: &[Value],
) -> Result<Vec<RowSnapshot>> {
    let mut selected = vec![repair.identity_column.clone()];
    selected.extend(payload.iter().cloned());
    let sql = format!(
        "SELECT {columns} FROM {table} WHERE {filter} ORDER BY {id} ASC",
        columns = column_list(&selected),
        table = quote_ident(&repair.table),
        filter = where_clause(&repair.key_columns, 1),
        id = quote_ident(&repair.identity_column),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(key.iter()), |row| {
        let mut values = Vec::with_capacity(payload.len());
        for (offset, column) in payload.iter().enumerate() {
            values.push((column.clone(), row.get::<_, Value>(offset + 1)?));
        }
        Ok(RowSnapshot { id: row.get(0)?, values })
    })?;
    let mut group = Vec::new();
    for row in rows {
        group.push(row?);
    }
    Ok(group)
}

/// Rows arrive ordered by ascending id, so each class's first member is its smallest id.
fn partition<'r>(
    rows: &'r [RowSnapshot],
    predicate: &dyn PayloadEquality,
) -> Vec<Vec<&'r RowSnapshot>> {
    let mut classes: Vec<Vec<&RowSnapshot>> = Vec::new();
    for row in rows {
        let home = classes.iter_mut().find(|class| match predicate.equivalent(class[0], row) {
            Ok(same) => same,
            Err(err) => {
                warn!(error = %err, "skipping payload comparison for unreadable row");
                false
            }
        });
        match home {
            Some(class) => class.push(row),
            None => classes.push(vec![row]),
        }
    }
    classes
}

fn delete_row(conn: &Connection, repair: &DuplicateRepair, id: i64) -> Result<()> {
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(&repair.table),
            quote_ident(&repair.identity_column)
        ),
        [id],
    )?;
    Ok(())
}

/// Move row `id` to the nearest free value below its current perturbed component.
/// Returns false when the row's component is not an integer (logged as an anomaly).
fn perturb(conn: &Connection, repair: &DuplicateRepair, key: &[Value], id: i64) -> Result<bool> {
    let Some(index) = repair.perturb_index() else {
        return Ok(false);
    };
    let Value::Integer(original) = key[index] else {
        warn!(
            table = %repair.table,
            row_id = id,
            column = %repair.perturb_column,
            "cannot perturb a non-integer key component"
        );
        return Ok(false);
    };

    let probe = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {})",
        quote_ident(&repair.table),
        where_clause(&repair.key_columns, 1)
    );
    let mut candidate_key = key.to_vec();
    let mut candidate = original;
    loop {
        let Some(next) = candidate.checked_sub(1) else {
            warn!(table = %repair.table, row_id = id, "no free key value below {original}");
            return Ok(false);
        };
        candidate = next;
        candidate_key[index] = Value::Integer(candidate);
        let taken: bool =
            conn.query_row(&probe, params_from_iter(candidate_key.iter()), |row| row.get(0))?;
        if !taken {
            break;
        }
    }

    conn.execute(
        &format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote_ident(&repair.table),
            quote_ident(&repair.perturb_column),
            quote_ident(&repair.identity_column)
        ),
        rusqlite::params![candidate, id],
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rusqlite::params;

    use super::*;

    fn message_table() -> anyhow::Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE message (
               _id INTEGER PRIMARY KEY,
               address TEXT,
               thread_id INTEGER,
               date_sent INTEGER,
               body TEXT
             );",
        )?;
        Ok(conn)
    }

    fn insert(
        conn: &Connection,
        id: i64,
        address: &str,
        thread: i64,
        date: i64,
        body: &str,
    ) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO message (_id, address, thread_id, date_sent, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, address, thread, date, body],
        )?;
        Ok(())
    }

    fn repair() -> DuplicateRepair {
        DuplicateRepair::new("message", &["address", "thread_id", "date_sent"], "_id")
    }

    fn rows(conn: &Connection) -> anyhow::Result<Vec<(i64, i64)>> {
        let mut stmt = conn.prepare("SELECT _id, date_sent FROM message ORDER BY _id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn total_changes(conn: &Connection) -> anyhow::Result<i64> {
        Ok(conn.query_row("SELECT total_changes()", [], |row| row.get(0))?)
    }

    #[test]
    fn identical_payloads_keep_smallest_identifier() -> anyhow::Result<()> {
        let conn = message_table()?;
        insert(&conn, 1, "A", 1, 500, "hello")?;
        insert(&conn, 2, "A", 1, 500, "hello")?;

        let counts = resolve(&conn, &repair(), &ColumnsEqual::all())?;
        assert_eq!(counts, DedupeCounts { groups: 1, deleted: 1, perturbed: 0 });
        assert_eq!(rows(&conn)?, vec![(1, 500)]);
        Ok(())
    }

    #[test]
    fn distinct_payloads_are_perturbed_around_existing_rows() -> anyhow::Result<()> {
        let conn = message_table()?;
        insert(&conn, 5, "A", 1, 1000, "first")?;
        insert(&conn, 7, "A", 1, 999, "unrelated")?;
        insert(&conn, 9, "A", 1, 1000, "second")?;

        let counts = resolve(&conn, &repair(), &ColumnsEqual::all())?;
        assert_eq!(counts, DedupeCounts { groups: 1, deleted: 0, perturbed: 1 });
        assert_eq!(rows(&conn)?, vec![(5, 998), (7, 999), (9, 1000)]);
        assert_eq!(crate::repair::count_shared_keys(&conn, "message", &repair().key_columns)?, 0);
        Ok(())
    }

    #[test]
    fn mixed_group_deletes_then_perturbs() -> anyhow::Result<()> {
        let conn = message_table()?;
        insert(&conn, 1, "B", 2, 50, "x")?;
        insert(&conn, 2, "B", 2, 50, "y")?;
        insert(&conn, 3, "B", 2, 50, "x")?;
        insert(&conn, 4, "B", 2, 50, "z")?;

        let counts = resolve(&conn, &repair(), &ColumnsEqual::only(&["body"]))?;
        assert_eq!(counts, DedupeCounts { groups: 1, deleted: 1, perturbed: 2 });
        // 4 keeps 50; walking down from the highest survivor: 2 -> 49, 1 -> 48.
        assert_eq!(rows(&conn)?, vec![(1, 48), (2, 49), (4, 50)]);
        Ok(())
    }

    #[test]
    fn conflict_groups_are_read_one_page_at_a_time() -> anyhow::Result<()> {
        let conn = message_table()?;
        insert(&conn, 1, "A", 1, 10, "a")?;
        insert(&conn, 2, "A", 1, 10, "b")?;
        insert(&conn, 3, "A", 1, 20, "a")?;
        insert(&conn, 4, "A", 1, 20, "b")?;
        insert(&conn, 5, "A", 1, 30, "a")?;
        insert(&conn, 6, "A", 1, 30, "a")?;

        let counts = resolve(&conn, &repair().with_batch_size(1), &ColumnsEqual::all())?;
        assert_eq!(counts, DedupeCounts { groups: 3, deleted: 1, perturbed: 2 });
        assert_eq!(rows(&conn)?, vec![(1, 9), (2, 10), (3, 19), (4, 20), (5, 30)]);

        let zero = resolve(&conn, &repair().with_batch_size(0), &ColumnsEqual::all());
        assert!(matches!(zero, Err(MigrateError::Config(_))));
        Ok(())
    }

    #[test]
    fn null_key_components_are_not_conflicts() -> anyhow::Result<()> {
        let conn = message_table()?;
        conn.execute_batch(
            "INSERT INTO message (_id, address, thread_id, date_sent, body) VALUES
               (1, NULL, 1, 10, 'a'), (2, NULL, 1, 10, 'a');",
        )?;
        let counts = resolve(&conn, &repair(), &ColumnsEqual::all())?;
        assert_eq!(counts, DedupeCounts::default());
        assert_eq!(rows(&conn)?.len(), 2);
        Ok(())
    }

    #[test]
    fn second_run_performs_no_writes() -> anyhow::Result<()> {
        let conn = message_table()?;
        insert(&conn, 1, "A", 1, 10, "a")?;
        insert(&conn, 2, "A", 1, 10, "a")?;
        insert(&conn, 3, "A", 1, 10, "b")?;
        resolve(&conn, &repair(), &ColumnsEqual::all())?;

        let before = total_changes(&conn)?;
        let counts = resolve(&conn, &repair(), &ColumnsEqual::all())?;
        assert_eq!(counts, DedupeCounts::default());
        assert_eq!(total_changes(&conn)?, before);
        Ok(())
    }

    #[test]
    fn closures_and_json_predicates_are_pluggable() -> anyhow::Result<()> {
        let conn = message_table()?;
        insert(&conn, 1, "A", 1, 10, r#"{"text":"hi","rendered_at":1}"#)?;
        insert(&conn, 2, "A", 1, 10, r#"{"rendered_at":2,"text":"hi"}"#)?;
        let json = JsonFieldsEqual::new("body", &["rendered_at"]);
        let counts = resolve(&conn, &repair(), &json)?;
        assert_eq!(counts.deleted, 1);

        insert(&conn, 3, "C", 1, 10, "Hello")?;
        insert(&conn, 4, "C", 1, 10, "HELLO")?;
        let case_insensitive = |a: &RowSnapshot, b: &RowSnapshot| {
            match (a.get("body"), b.get("body")) {
                (Some(Value::Text(x)), Some(Value::Text(y))) => x.eq_ignore_ascii_case(y),
                _ => false,
            }
        };
        let counts = resolve(&conn, &repair(), &case_insensitive)?;
        assert_eq!(counts.deleted, 1);
        assert_eq!(rows(&conn)?.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 3]);
        Ok(())
    }

    #[test]
    fn unreadable_payload_is_kept_and_perturbed() -> anyhow::Result<()> {
        let conn = message_table()?;
        insert(&conn, 1, "A", 1, 10, "not json")?;
        insert(&conn, 2, "A", 1, 10, "not json")?;

        let counts = resolve(&conn, &repair(), &JsonFieldsEqual::new("body", &[]))?;
        assert_eq!(counts, DedupeCounts { groups: 1, deleted: 0, perturbed: 1 });
        assert_eq!(rows(&conn)?, vec![(1, 9), (2, 10)]);
        Ok(())
    }

    #[test]
    fn non_integer_perturb_column_aborts() -> anyhow::Result<()> {
        let conn = message_table()?;
        insert(&conn, 1, "A", 1, 10, "a")?;
        insert(&conn, 2, "A", 1, 10, "b")?;
        let by_address = repair().perturbing("address");

        let result = resolve(&conn, &by_address, &ColumnsEqual::all());
        assert!(matches!(result, Err(MigrateError::UnresolvedDuplicates { groups: 1, .. })));
        Ok(())
    }

    #[test]
    fn rejects_perturb_column_outside_key() -> anyhow::Result<()> {
        let conn = message_table()?;
        let bad = repair().perturbing("body");
        assert!(matches!(resolve(&conn, &bad, &ColumnsEqual::all()), Err(MigrateError::Config(_))));
        Ok(())
    }

    proptest! {
        #[test]
        fn true_duplicates_reduce_to_one_row_per_group(
            sizes in prop::collection::vec(1_usize..5, 1..8)
        ) {
            let outcome = (|| -> anyhow::Result<(usize, Vec<i64>, Vec<i64>)> {
                let conn = message_table()?;
                let mut next_id = 1_i64;
                let mut expected_survivors = Vec::new();
                for (group, size) in sizes.iter().enumerate() {
                    let date = i64::try_from(group)? * 10;
                    expected_survivors.push(next_id);
                    for _ in 0..*size {
                        insert(&conn, next_id, "A", 1, date, "same")?;
                        next_id += 1;
                    }
                }
                resolve(&conn, &repair(), &ColumnsEqual::all())?;
                let remaining = rows(&conn)?.into_iter().map(|(id, _)| id).collect::<Vec<_>>();
                Ok((remaining.len(), remaining, expected_survivors))
            })();
            let (count, remaining, expected) =
                outcome.map_err(|err| TestCaseError::fail(err.to_string()))?;
            let total: usize = sizes.iter().sum();
            let removed: usize = sizes.iter().map(|k| k - 1).sum();
            prop_assert_eq!(count, total - removed);
            prop_assert_eq!(remaining, expected);
        }
    }
}
