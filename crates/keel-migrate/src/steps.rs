//! Built-in release history of the messaging store.
//!
//! Structural changes are declarative. Repairs and rebuilds are procedural, and each
//! one probes its postcondition first so that applying it twice writes nothing.

use rusqlite::Connection;
use tracing::debug;

use crate::catalog::{self, Dependent, DependentKind};
use crate::error::Result;
use crate::rebuild::{ColumnMapping, RebuildPlan, RowProjection, TableRebuilder};
use crate::registry::StepRegistry;
use crate::repair::{
    dedupe, merge, orphans, ColumnsEqual, DanglingReference, DuplicateRepair, EntityMerge,
    LEDGER_COLUMNS,
};
use crate::step::{DeclarativeStep, MigrationStep, Operation, ProceduralStep, StepContext};

pub const INITIAL_SCHEMA: i64 = 1;
pub const QUOTE_MISSING: i64 = 2;
pub const REMAPPED_RECORDS: i64 = 3;
// 4 was retired before release.
pub const ABANDONED_MESSAGE_CLEANUP: i64 = 5;
pub const THREAD_MERGE: i64 = 6;
pub const MESSAGE_DUPE_INDEX: i64 = 7;
pub const THREAD_AUTOINCREMENT: i64 = 8;
pub const MESSAGE_FOREIGN_KEYS: i64 = 9;

pub const LATEST_VERSION: i64 = MESSAGE_FOREIGN_KEYS;

/// Every built-in step in release order.
#[must_use]
pub fn builtin_steps() -> Vec<Box<dyn MigrationStep>> {
    vec![
        Box::new(initial_schema()),
        Box::new(DeclarativeStep::new(
            QUOTE_MISSING,
            "QUOTE_MISSING",
            vec![Operation::add_column("message", "quote_missing", "INTEGER DEFAULT 0")],
        )),
        Box::new(DeclarativeStep::new(
            REMAPPED_RECORDS,
            "REMAPPED_RECORDS",
            vec![
                Operation::create_table("remapped_recipients", LEDGER_COLUMNS),
                Operation::create_table("remapped_threads", LEDGER_COLUMNS),
            ],
        )),
        Box::new(ProceduralStep::new(
            ABANDONED_MESSAGE_CLEANUP,
            "ABANDONED_MESSAGE_CLEANUP",
            abandoned_message_cleanup,
        )),
        Box::new(ProceduralStep::new(THREAD_MERGE, "THREAD_MERGE", thread_merge)),
        Box::new(ProceduralStep::new(MESSAGE_DUPE_INDEX, "MESSAGE_DUPE_INDEX", message_dupe_index)),
        Box::new(
            ProceduralStep::new(THREAD_AUTOINCREMENT, "THREAD_AUTOINCREMENT", thread_autoincrement)
                .with_constraints_disabled(),
        ),
        Box::new(
            ProceduralStep::new(MESSAGE_FOREIGN_KEYS, "MESSAGE_FOREIGN_KEYS", message_foreign_keys)
                .with_constraints_disabled(),
        ),
    ]
}

/// # Errors
/// Returns [`crate::MigrateError::InvalidRegistry`] if the built-in history is misordered.
pub fn builtin_registry() -> Result<StepRegistry> {
    StepRegistry::new(builtin_steps())
}

fn initial_schema() -> DeclarativeStep {
    DeclarativeStep::new(
        INITIAL_SCHEMA,
        "INITIAL_SCHEMA",
        vec![
            Operation::create_table(
                "recipient",
                "_id INTEGER PRIMARY KEY, e164 TEXT UNIQUE, display_name TEXT",
            ),
            Operation::create_table(
                "thread",
                "_id INTEGER PRIMARY KEY,
                 date INTEGER DEFAULT 0,
                 recipient_ids INTEGER,
                 snippet TEXT,
                 snippet_cs INTEGER DEFAULT 0,
                 read INTEGER DEFAULT 1",
            ),
            Operation::create_table(
                "message",
                "_id INTEGER PRIMARY KEY,
                 thread_id INTEGER,
                 address INTEGER,
                 date_sent INTEGER,
                 date_received INTEGER,
                 type INTEGER DEFAULT 0,
                 body TEXT",
            ),
            Operation::create_table(
                "part",
                "_id INTEGER PRIMARY KEY,
                 mid INTEGER,
                 content_type TEXT,
                 data_size INTEGER DEFAULT 0",
            ),
            Operation::create_index("thread_recipient_ids_index", "thread", "recipient_ids"),
            Operation::create_index("thread_date_index", "thread", "date"),
            Operation::create_index(
                "message_thread_date_index",
                "message",
                "thread_id, date_received",
            ),
            Operation::create_index("part_mid_index", "part", "mid"),
            Operation::execute(
                "CREATE VIEW IF NOT EXISTS unread_threads AS
                 SELECT _id, date, snippet FROM thread WHERE read = 0",
            ),
        ],
    )
}

fn abandoned_message_cleanup(conn: &Connection, ctx: &StepContext<'_>) -> Result<()> {
    orphans::remove_dangling_all(
        conn,
        &[
            DanglingReference::delete("thread", "recipient_ids", "recipient", "_id"),
            DanglingReference::delete("message", "thread_id", "thread", "_id"),
            DanglingReference::delete("part", "mid", "message", "_id"),
        ],
        ctx.config.batch_size,
    )?;
    Ok(())
}

fn thread_merge(conn: &Connection, ctx: &StepContext<'_>) -> Result<()> {
    let plan = EntityMerge::new("thread", "_id", &["recipient_ids"], "date")
        .with_dependent("message", "thread_id")
        .with_ledger("remapped_threads")
        .with_batch_size(ctx.config.batch_size);
    merge::merge_entities(conn, &plan)?;

    Operation::drop_index("thread_recipient_ids_index").apply(conn)?;
    Operation::create_unique_index("thread_recipient_unique_index", "thread", "recipient_ids")
        .apply(conn)
}

fn message_dupe_index(conn: &Connection, ctx: &StepContext<'_>) -> Result<()> {
    let repair = DuplicateRepair::new("message", &["address", "thread_id", "date_sent"], "_id")
        .with_payload(&["body", "type"])
        .with_batch_size(ctx.config.batch_size);
    let counts = dedupe::resolve(conn, &repair, &ColumnsEqual::all())?;
    if counts.deleted > 0 {
        orphans::remove_dangling(
            conn,
            &DanglingReference::delete("part", "mid", "message", "_id"),
            ctx.config.batch_size,
        )?;
    }

    Operation::create_unique_index(
        "message_unique_sent_index",
        "message",
        "address, thread_id, date_sent",
    )
    .apply(conn)
}

const THREAD_COLUMNS: &str = "_id INTEGER PRIMARY KEY AUTOINCREMENT,
    date INTEGER DEFAULT 0,
    thread_recipient_id INTEGER,
    snippet TEXT,
    read INTEGER DEFAULT 1";

fn thread_autoincrement(conn: &Connection, ctx: &StepContext<'_>) -> Result<()> {
    if catalog::column_exists(conn, "thread", "thread_recipient_id")? {
        debug!(table = "thread", "thread already rebuilt, skipping");
        return Ok(());
    }

    let plan = RebuildPlan::new("thread", THREAD_COLUMNS)
        .with_projection(RowProjection::Columns(vec![
            ColumnMapping::copy("_id"),
            ColumnMapping::copy("date"),
            ColumnMapping::rename("recipient_ids", "thread_recipient_id"),
            ColumnMapping::copy("snippet"),
            ColumnMapping::copy("read"),
        ]))
        .replace_dependent(Dependent::new(
            DependentKind::Index,
            "thread_recipient_unique_index",
            "CREATE UNIQUE INDEX thread_recipient_unique_index ON thread (thread_recipient_id)",
        ));
    TableRebuilder::new(ctx.config).rebuild_with_catalog(conn, &plan, ctx.catalog)?;
    Ok(())
}

const MESSAGE_COLUMNS: &str = "_id INTEGER PRIMARY KEY,
    thread_id INTEGER REFERENCES thread (_id) ON DELETE CASCADE,
    address INTEGER,
    date_sent INTEGER,
    date_received INTEGER,
    type INTEGER DEFAULT 0,
    body TEXT,
    quote_missing INTEGER DEFAULT 0";

const PART_COLUMNS: &str = "_id INTEGER PRIMARY KEY,
    mid INTEGER REFERENCES message (_id) ON DELETE CASCADE,
    content_type TEXT,
    data_size INTEGER DEFAULT 0";

fn message_foreign_keys(conn: &Connection, ctx: &StepContext<'_>) -> Result<()> {
    let rebuilder = TableRebuilder::new(ctx.config);
    for (table, columns, reference) in [
        (
            "message",
            MESSAGE_COLUMNS,
            DanglingReference::delete("message", "thread_id", "thread", "_id"),
        ),
        ("part", PART_COLUMNS, DanglingReference::delete("part", "mid", "message", "_id")),
    ] {
        if !catalog::foreign_key_targets(conn, table)?.is_empty() {
            debug!(table, "foreign keys already declared, skipping");
            continue;
        }
        orphans::remove_dangling(conn, &reference, ctx.config.batch_size)?;
        rebuilder.rebuild_with_catalog(conn, &RebuildPlan::new(table, columns), ctx.catalog)?;
    }
    Ok(())
}
