//! Schema introspection: existence probes used by step preconditions, and the
//! [`CatalogReader`] capability the table rebuilder uses to discover dependents.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
/// Declared in recreation order: a view may select from another view and a trigger body
/// may name a view.
pub enum DependentKind {
    Index,
    View,
    Trigger,
}

impl DependentKind {
    fn from_catalog_type(raw: &str) -> Option<Self> {
        match raw {
            "index" => Some(Self::Index),
            "trigger" => Some(Self::Trigger),
            "view" => Some(Self::View),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_sql_keyword(self) -> &'static str {
        match self {
            Self::Index => "INDEX",
            Self::Trigger => "TRIGGER",
            Self::View => "VIEW",
        }
    }
}

/// A schema object that references a table by name and must be recreated after a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dependent {
    pub kind: DependentKind,
    pub name: String,
    pub sql: String,
}

impl Dependent {
    #[must_use]
    pub fn new(kind: DependentKind, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self { kind, name: name.into(), sql: sql.into() }
    }

    pub(crate) fn drop_sql(&self) -> String {
        format!("DROP {} IF EXISTS {}", self.kind.as_sql_keyword(), quote_ident(&self.name))
    }
}

/// Enumerates every dependent of a table. Implementations must be exhaustive: a
/// dependent that is not reported is not recreated after a rebuild.
pub trait CatalogReader {
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    fn dependents(&self, conn: &Connection, table: &str) -> Result<Vec<Dependent>>;
}

/// Reads dependents from `sqlite_master`.
///
/// Reports the table's own indexes, every view that selects from the table or from
/// another reported view, and every trigger attached to or naming any of them, in the
/// order they can be recreated: indexes, then views with their bases first, then
/// triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteCatalog;

struct SchemaObject {
    kind: DependentKind,
    name: String,
    tbl_name: String,
    sql: String,
}

impl SchemaObject {
    fn to_dependent(&self) -> Dependent {
        Dependent::new(self.kind, self.name.clone(), self.sql.clone())
    }
}

fn schema_objects(conn: &Connection) -> Result<Vec<SchemaObject>> {
    let mut stmt = conn.prepare(
        "SELECT type, name, tbl_name, sql FROM sqlite_master
         WHERE type IN ('index', 'trigger', 'view') AND sql IS NOT NULL
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut objects = Vec::new();
    for row in rows {
        let (raw_kind, name, tbl_name, sql) = row?;
        if let Some(kind) = DependentKind::from_catalog_type(&raw_kind) {
            objects.push(SchemaObject { kind, name, tbl_name, sql });
        }
    }
    Ok(objects)
}

impl CatalogReader for SqliteCatalog {
    fn dependents(&self, conn: &Connection, table: &str) -> Result<Vec<Dependent>> {
        let objects = schema_objects(conn)?;

        let mut dependents: Vec<Dependent> = objects
            .iter()
            .filter(|object| {
                object.kind == DependentKind::Index && object.tbl_name.eq_ignore_ascii_case(table)
            })
            .map(SchemaObject::to_dependent)
            .collect();

        // Names whose disappearance breaks a view or trigger: the table and every
        // view found so far.
        let mut names = vec![table.to_string()];
        let mut views: Vec<&SchemaObject> = Vec::new();
        let mut cursor = 0;
        while cursor < names.len() {
            let name = names[cursor].clone();
            cursor += 1;
            for object in objects.iter().filter(|object| object.kind == DependentKind::View) {
                let known = views.iter().any(|view| view.name == object.name);
                if !known && references_identifier(&object.sql, &name) {
                    names.push(object.name.clone());
                    views.push(object);
                }
            }
        }
        dependents.extend(bases_first(&views).into_iter().map(SchemaObject::to_dependent));

        dependents.extend(
            objects
                .iter()
                .filter(|object| object.kind == DependentKind::Trigger)
                .filter(|trigger| {
                    names.iter().any(|name| {
                        trigger.tbl_name.eq_ignore_ascii_case(name)
                            || references_identifier(&trigger.sql, name)
                    })
                })
                .map(SchemaObject::to_dependent),
        );
        Ok(dependents)
    }
}

/// Order `views` so that each one follows every other view it selects from.
fn bases_first<'a>(views: &[&'a SchemaObject]) -> Vec<&'a SchemaObject> {
    let mut ordered: Vec<&SchemaObject> = Vec::with_capacity(views.len());
    let mut pending: Vec<&SchemaObject> = views.to_vec();
    while !pending.is_empty() {
        let ready = pending.iter().position(|view| {
            pending.iter().all(|other| {
                other.name == view.name || !references_identifier(&view.sql, &other.name)
            })
        });
        // A cycle cannot come out of a valid schema; keep discovery order if one does.
        let next = pending.remove(ready.unwrap_or(0));
        ordered.push(next);
    }
    ordered
}

/// Canned dependents keyed by table name, for tests and for callers that already know
/// the full dependent list.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: BTreeMap<String, Vec<Dependent>>,
}

impl StaticCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, table: &str, dependents: Vec<Dependent>) -> Self {
        self.entries.insert(table.to_string(), dependents);
        self
    }
}

impl CatalogReader for StaticCatalog {
    fn dependents(&self, _conn: &Connection, table: &str) -> Result<Vec<Dependent>> {
        Ok(self.entries.get(table).cloned().unwrap_or_default())
    }
}

/// True when `sql` mentions `name` as a standalone identifier (bare or quoted).
fn references_identifier(sql: &str, name: &str) -> bool {
    let mut token = String::new();
    let flush = |token: &mut String| {
        let hit = token.eq_ignore_ascii_case(name);
        token.clear();
        hit
    };
    for ch in sql.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            token.push(ch);
        } else if flush(&mut token) {
            return true;
        }
    }
    flush(&mut token)
}

#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// # Errors
/// Returns an error when `sqlite_master` cannot be queried.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    object_exists(conn, "table", table)
}

/// # Errors
/// Returns an error when `sqlite_master` cannot be queried.
pub fn index_exists(conn: &Connection, index: &str) -> Result<bool> {
    object_exists(conn, "index", index)
}

fn object_exists(conn: &Connection, kind: &str, name: &str) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2 COLLATE NOCASE)",
        params![kind, name],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

/// Column names of `table` in declaration order; empty when the table does not exist.
///
/// # Errors
/// Returns an error when `PRAGMA table_info` fails.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

/// # Errors
/// Returns an error when `PRAGMA table_info` fails.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table)?.iter().any(|name| name.eq_ignore_ascii_case(column)))
}

/// Tables referenced by the declared foreign keys of `table`, one entry per key column.
///
/// # Errors
/// Returns an error when `PRAGMA foreign_key_list` fails.
pub fn foreign_key_targets(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(2))?;
    let mut targets = Vec::new();
    for row in rows {
        targets.push(row?);
    }
    Ok(targets)
}

/// Tables whose declared foreign keys point at `table`, including `table` itself when
/// it references its own rows.
///
/// # Errors
/// Returns an error when the catalog or `PRAGMA foreign_key_list` cannot be read.
pub fn referencing_tables(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut referencing = Vec::new();
    for name in names {
        let name = name?;
        let targets = foreign_key_targets(conn, &name)?;
        if targets.iter().any(|target| target.eq_ignore_ascii_case(table)) {
            referencing.push(name);
        }
    }
    Ok(referencing)
}

/// # Errors
/// Returns an error when the pragma cannot be read.
pub fn foreign_keys_enabled(conn: &Connection) -> Result<bool> {
    Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get::<_, i64>(0))? != 0)
}

/// # Errors
/// Returns an error when the count query fails.
pub fn row_count(conn: &Connection, table: &str) -> Result<i64> {
    let count =
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |row| {
            row.get::<_, i64>(0)
        })?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> anyhow::Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE thread (_id INTEGER PRIMARY KEY, date INTEGER, snippet TEXT);
             CREATE TABLE thread_archive (_id INTEGER PRIMARY KEY, thread_id INTEGER UNIQUE);
             CREATE INDEX thread_date_index ON thread (date);
             CREATE TRIGGER thread_touch AFTER UPDATE ON thread BEGIN SELECT 1; END;
             CREATE VIEW recent_threads AS SELECT _id FROM thread WHERE date > 0;
             CREATE VIEW archived AS SELECT thread_id FROM thread_archive;",
        )?;
        Ok(conn)
    }

    #[test]
    fn sqlite_catalog_lists_indexes_triggers_and_referencing_views() -> anyhow::Result<()> {
        let conn = fixture()?;
        let dependents = SqliteCatalog.dependents(&conn, "thread")?;
        let names: Vec<_> = dependents.iter().map(|d| (d.kind, d.name.as_str())).collect();
        assert_eq!(
            names,
            vec![
                (DependentKind::Index, "thread_date_index"),
                (DependentKind::View, "recent_threads"),
                (DependentKind::Trigger, "thread_touch"),
            ]
        );
        Ok(())
    }

    #[test]
    fn sqlite_catalog_follows_cross_table_triggers_and_stacked_views() -> anyhow::Result<()> {
        let conn = fixture()?;
        conn.execute_batch(
            "CREATE TABLE message (_id INTEGER PRIMARY KEY, thread_id INTEGER, body TEXT);
             CREATE INDEX message_thread_index ON message (thread_id);
             CREATE VIEW a_recent_ids AS SELECT _id FROM recent_threads;
             CREATE VIEW a_recent_counts AS SELECT COUNT(*) AS n FROM a_recent_ids;
             CREATE VIEW message_bodies AS SELECT body FROM message;
             CREATE TRIGGER message_touch_thread AFTER INSERT ON message BEGIN
               UPDATE thread SET date = date + 1 WHERE _id = NEW.thread_id;
             END;
             CREATE TRIGGER message_count_recent AFTER DELETE ON message BEGIN
               SELECT n FROM a_recent_counts;
             END;
             CREATE TRIGGER message_plain AFTER UPDATE ON message BEGIN SELECT 1; END;",
        )?;

        let dependents = SqliteCatalog.dependents(&conn, "thread")?;
        let names: Vec<_> = dependents.iter().map(|d| (d.kind, d.name.as_str())).collect();
        assert_eq!(
            names,
            vec![
                (DependentKind::Index, "thread_date_index"),
                (DependentKind::View, "recent_threads"),
                (DependentKind::View, "a_recent_ids"),
                (DependentKind::View, "a_recent_counts"),
                (DependentKind::Trigger, "message_count_recent"),
                (DependentKind::Trigger, "message_touch_thread"),
                (DependentKind::Trigger, "thread_touch"),
            ]
        );
        Ok(())
    }

    #[test]
    fn referencing_tables_and_enforcement() -> anyhow::Result<()> {
        let conn = fixture()?;
        conn.execute_batch(
            "CREATE TABLE message (
               _id INTEGER PRIMARY KEY,
               thread_id INTEGER REFERENCES thread (_id) ON DELETE CASCADE
             );
             CREATE TABLE reply (_id INTEGER PRIMARY KEY, parent INTEGER REFERENCES reply (_id));",
        )?;
        assert_eq!(referencing_tables(&conn, "thread")?, vec!["message".to_string()]);
        assert_eq!(referencing_tables(&conn, "reply")?, vec!["reply".to_string()]);
        assert!(referencing_tables(&conn, "message")?.is_empty());

        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        assert!(!foreign_keys_enabled(&conn)?);
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        assert!(foreign_keys_enabled(&conn)?);
        Ok(())
    }

    #[test]
    fn identifier_match_ignores_prefixed_names() {
        assert!(references_identifier("SELECT * FROM thread", "thread"));
        assert!(references_identifier("SELECT * FROM \"thread\" t", "thread"));
        assert!(!references_identifier("SELECT * FROM thread_archive", "thread"));
    }

    #[test]
    fn existence_probes() -> anyhow::Result<()> {
        let conn = fixture()?;
        assert!(table_exists(&conn, "thread")?);
        assert!(!table_exists(&conn, "message")?);
        assert!(index_exists(&conn, "thread_date_index")?);
        assert!(column_exists(&conn, "thread", "snippet")?);
        assert!(!column_exists(&conn, "thread", "pinned")?);
        assert!(table_columns(&conn, "missing")?.is_empty());
        Ok(())
    }

    #[test]
    fn foreign_key_targets_follow_declarations() -> anyhow::Result<()> {
        let conn = fixture()?;
        conn.execute_batch(
            "CREATE TABLE message (
               _id INTEGER PRIMARY KEY,
               thread_id INTEGER REFERENCES thread (_id)
             )",
        )?;
        assert_eq!(foreign_key_targets(&conn, "message")?, vec!["thread".to_string()]);
        assert!(foreign_key_targets(&conn, "thread")?.is_empty());
        Ok(())
    }
}
