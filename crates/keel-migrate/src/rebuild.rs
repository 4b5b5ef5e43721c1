//! Structural table changes SQLite cannot apply in place.
//!
//! A rebuild creates a shadow table with the target schema, copies every row through a
//! [`RowProjection`] in bounded batches, drops the original, renames the shadow into
//! place and recreates every dependent (index, trigger, view) that named the original.
//!
//! Dependents must be listed exhaustively: one that is left out is silently lost.
//! Views and triggers are dropped before the original table and recreated after indexes,
//! so a trigger on another table that names this one survives the rebuild.
//! A table other tables reference can only be rebuilt with foreign key enforcement off;
//! dropping it with enforcement on would cascade into the referencing rows.
//! Tightened constraints (NOT NULL, UNIQUE, new foreign keys) must be preceded by the
//! matching repair in [`crate::repair`], or the row copy fails.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::catalog::{self, quote_ident, CatalogReader, Dependent, DependentKind};
use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};

/// How a target column is filled from the source row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub target: String,
    /// SQL expression evaluated against the source row.
    pub source: String,
}

impl ColumnMapping {
    #[must_use]
    pub fn copy(column: &str) -> Self {
        Self { target: column.to_string(), source: quote_ident(column) }
    }

    #[must_use]
    pub fn rename(from: &str, to: &str) -> Self {
        Self { target: to.to_string(), source: quote_ident(from) }
    }

    #[must_use]
    pub fn expr(target: &str, expression: &str) -> Self {
        Self { target: target.to_string(), source: expression.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RowProjection {
    /// Every target column that also exists in the source, matched by name. Target
    /// columns absent from the source take their declared defaults.
    #[default]
    Identity,
    /// Explicit mappings; source columns not mentioned are dropped.
    Columns(Vec<ColumnMapping>),
}

/// The target shape of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildPlan {
    pub table: String,
    /// Column and table-constraint definitions, without the surrounding parentheses.
    pub columns: String,
    pub projection: RowProjection,
    replacements: Vec<Dependent>,
    skipped: Vec<String>,
}

impl RebuildPlan {
    #[must_use]
    pub fn new(table: &str, columns: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.to_string(),
            projection: RowProjection::Identity,
            replacements: Vec::new(),
            skipped: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_projection(mut self, projection: RowProjection) -> Self {
        self.projection = projection;
        self
    }

    /// Recreate `dependent` in place of the same-named one, or in addition when no
    /// dependent has that name.
    #[must_use]
    pub fn replace_dependent(mut self, dependent: Dependent) -> Self {
        self.replacements.push(dependent);
        self
    }

    /// Do not recreate the named dependent, e.g. an index over a dropped column.
    #[must_use]
    pub fn skip_dependent(mut self, name: &str) -> Self {
        self.skipped.push(name.to_string());
        self
    }

    fn effective_dependents(&self, dependents: &[Dependent]) -> Vec<Dependent> {
        let mut effective: Vec<Dependent> = dependents
            .iter()
            .filter(|dependent| !self.skipped.iter().any(|name| name == &dependent.name))
            .map(|dependent| {
                self.replacements
                    .iter()
                    .find(|replacement| replacement.name == dependent.name)
                    .cloned()
                    .unwrap_or_else(|| dependent.clone())
            })
            .collect();
        for replacement in &self.replacements {
            if !effective.iter().any(|dependent| dependent.name == replacement.name) {
                effective.push(replacement.clone());
            }
        }
        effective
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebuildOutcome {
    pub rows_copied: i64,
    pub batches: usize,
    pub dependents_recreated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShadowState {
    Created,
    Populated,
    Promoted,
}

/// The temporary table of a rebuild. Dropped again unless it was promoted.
struct ShadowTable<'c> {
    conn: &'c Connection,
    name: String,
    state: ShadowState,
}

impl<'c> ShadowTable<'c> {
    fn create(conn: &'c Connection, name: String, columns: &str) -> Result<Self> {
        if catalog::table_exists(conn, &name)? {
            warn!(shadow = %name, "discarding stale shadow table from an earlier attempt");
            conn.execute_batch(&format!("DROP TABLE {}", quote_ident(&name)))?;
        }
        conn.execute_batch(&format!("CREATE TABLE {} ({columns})", quote_ident(&name)))?;
        Ok(Self { conn, name, state: ShadowState::Created })
    }

    fn populate(
        &mut self,
        source: &str,
        mappings: &[ColumnMapping],
        batch_size: i64,
    ) -> Result<(i64, usize)> {
        let targets =
            mappings.iter().map(|mapping| quote_ident(&mapping.target)).collect::<Vec<_>>();
        let sources = mappings.iter().map(|mapping| mapping.source.as_str()).collect::<Vec<_>>();
        let source_ident = quote_ident(source);

        let insert = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {source_ident} WHERE rowid > ?1 AND rowid <= ?2",
            quote_ident(&self.name),
            targets.join(", "),
            sources.join(", "),
        );
        let next_bound = format!(
            "SELECT MAX(rowid) FROM (
               SELECT rowid FROM {source_ident} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2
             )"
        );

        let mut copied = 0_i64;
        let mut batches = 0_usize;
        let mut low = i64::MIN;
        while let Some(high) = self
            .conn
            .query_row(&next_bound, params![low, batch_size], |row| row.get::<_, Option<i64>>(0))
            .optional()?
            .flatten()
        {
            let inserted = self.conn.execute(&insert, params![low, high])?;
            copied += i64::try_from(inserted).unwrap_or(i64::MAX);
            batches += 1;
            low = high;
        }

        self.state = ShadowState::Populated;
        Ok((copied, batches))
    }

    /// Swap the shadow in for `target`, dropping `detached` first. Runs under a savepoint
    /// so a failed swap leaves the original table and its dependents in place.
    fn promote(mut self, target: &str, detached: &[&Dependent]) -> Result<()> {
        if self.state != ShadowState::Populated {
            return Err(MigrateError::rebuild(
                target,
                "shadow table promoted before it was populated",
            ));
        }
        // Nothing may run between the drop and the rename.
        let mut batch = String::from("SAVEPOINT keel_promote;\n");
        for dependent in detached {
            batch.push_str(&dependent.drop_sql());
            batch.push_str(";\n");
        }
        batch.push_str(&format!(
            "DROP TABLE {target};\nALTER TABLE {shadow} RENAME TO {target};\n",
            target = quote_ident(target),
            shadow = quote_ident(&self.name),
        ));
        batch.push_str("RELEASE keel_promote;");
        if let Err(err) = self.conn.execute_batch(&batch) {
            match self.conn.execute_batch("ROLLBACK TO keel_promote; RELEASE keel_promote;") {
                Ok(()) => {
                    return Err(MigrateError::rebuild(
                        target,
                        format!("promotion of `{}` rolled back: {err}", self.name),
                    ));
                }
                Err(rollback) => {
                    warn!(table = target, error = %rollback, "failed to roll back promotion");
                }
            }
            if !catalog::table_exists(self.conn, target)? {
                // The original is gone; the shadow now holds the only copy of the rows.
                self.state = ShadowState::Promoted;
                return Err(MigrateError::rebuild(
                    target,
                    format!(
                        "rename of `{}` failed after the original was dropped: {err}",
                        self.name
                    ),
                ));
            }
            return Err(err.into());
        }
        self.state = ShadowState::Promoted;
        Ok(())
    }
}

impl Drop for ShadowTable<'_> {
    fn drop(&mut self) {
        if self.state == ShadowState::Promoted {
            return;
        }
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&self.name));
        if let Err(err) = self.conn.execute_batch(&sql) {
            warn!(shadow = %self.name, error = %err, "failed to discard shadow table");
        }
    }
}

/// Runs rebuilds with the batch size and shadow naming of a [`MigrationConfig`].
#[derive(Debug, Clone)]
pub struct TableRebuilder {
    batch_size: i64,
    shadow_suffix: String,
}

impl TableRebuilder {
    #[must_use]
    pub fn new(config: &MigrationConfig) -> Self {
        Self { batch_size: config.batch_limit(), shadow_suffix: config.shadow_suffix.clone() }
    }

    #[must_use]
    pub fn shadow_name(&self, table: &str) -> String {
        format!("{table}{}", self.shadow_suffix)
    }

    /// Rebuild `plan.table`, recreating exactly `dependents` (after the plan's
    /// replacements and skips) once the shadow is in place.
    ///
    /// # Errors
    /// Returns [`MigrateError::Rebuild`] when the plan does not fit the source table or
    /// the row count changes, and [`MigrateError::Sqlite`] when a statement fails. On
    /// error the shadow table is discarded and the original is untouched unless the
    /// failure happened after promotion.
    pub fn rebuild(
        &self,
        conn: &Connection,
        plan: &RebuildPlan,
        dependents: &[Dependent],
    ) -> Result<RebuildOutcome> {
        let table = plan.table.as_str();
        let source_columns = catalog::table_columns(conn, table)?;
        if source_columns.is_empty() {
            return Err(MigrateError::rebuild(table, "table does not exist"));
        }
        if catalog::foreign_keys_enabled(conn)? {
            let referencing = catalog::referencing_tables(conn, table)?;
            if !referencing.is_empty() {
                return Err(MigrateError::rebuild(
                    table,
                    format!(
                        "rebuild of a referenced table requires constraints disabled \
                         (referenced by {})",
                        referencing.join(", ")
                    ),
                ));
            }
        }
        let source_rows = catalog::row_count(conn, table)?;

        let mut shadow = ShadowTable::create(conn, self.shadow_name(table), &plan.columns)?;
        let target_columns = catalog::table_columns(conn, &shadow.name)?;
        let mappings =
            resolve_projection(table, &plan.projection, &source_columns, &target_columns)?;

        let (rows_copied, batches) = shadow.populate(table, &mappings, self.batch_size)?;
        debug!(table, rows_copied, batches, "shadow table populated");

        let mut recreated = plan.effective_dependents(dependents);
        recreated.sort_by_key(|dependent| dependent.kind);
        // Triggers first, then views with the ones built on others ahead of their bases.
        // Skipped views and triggers still have to go before the rename.
        let mut detached: Vec<&Dependent> = recreated
            .iter()
            .rev()
            .filter(|dependent| dependent.kind != DependentKind::Index)
            .collect();
        for dependent in dependents {
            let known = detached.iter().any(|other| other.name == dependent.name);
            if dependent.kind != DependentKind::Index && !known {
                detached.push(dependent);
            }
        }
        shadow.promote(table, &detached)?;

        for dependent in &recreated {
            conn.execute_batch(&dependent.sql).map_err(|err| {
                MigrateError::rebuild(
                    table,
                    format!(
                        "failed to recreate {} `{}`: {err}",
                        dependent.kind.as_sql_keyword(),
                        dependent.name
                    ),
                )
            })?;
        }

        let promoted_rows = catalog::row_count(conn, table)?;
        if promoted_rows != source_rows {
            return Err(MigrateError::rebuild(
                table,
                format!("row count changed from {source_rows} to {promoted_rows}"),
            ));
        }

        info!(table, rows_copied, batches, dependents = recreated.len(), "table rebuilt");
        Ok(RebuildOutcome { rows_copied, batches, dependents_recreated: recreated.len() })
    }

    /// [`rebuild`](Self::rebuild) with dependents read through `catalog`.
    ///
    /// # Errors
    /// Same as [`rebuild`](Self::rebuild), plus catalog read failures.
    pub fn rebuild_with_catalog(
        &self,
        conn: &Connection,
        plan: &RebuildPlan,
        catalog: &dyn CatalogReader,
    ) -> Result<RebuildOutcome> {
        let dependents = catalog.dependents(conn, &plan.table)?;
        self.rebuild(conn, plan, &dependents)
    }
}

fn resolve_projection(
    table: &str,
    projection: &RowProjection,
    source_columns: &[String],
    target_columns: &[String],
) -> Result<Vec<ColumnMapping>> {
    let has = |columns: &[String], name: &str| columns.iter().any(|c| c.eq_ignore_ascii_case(name));

    let mappings = match projection {
        RowProjection::Identity => target_columns
            .iter()
            .filter(|column| has(source_columns, column))
            .map(|column| ColumnMapping::copy(column))
            .collect::<Vec<_>>(),
        RowProjection::Columns(mappings) => {
            if let Some(unknown) = mappings.iter().find(|m| !has(target_columns, &m.target)) {
                return Err(MigrateError::rebuild(
                    table,
                    format!("projection targets unknown column `{}`", unknown.target),
                ));
            }
            mappings.clone()
        }
    };

    if mappings.is_empty() {
        return Err(MigrateError::rebuild(table, "projection maps no columns"));
    }
    Ok(mappings)
}
