use std::fmt;

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::catalog::{self, quote_ident, CatalogReader};
use crate::config::MigrationConfig;
use crate::error::Result;

/// Everything a step may use besides the connection itself.
pub struct StepContext<'a> {
    pub config: &'a MigrationConfig,
    pub catalog: &'a dyn CatalogReader,
}

/// One versioned migration unit.
///
/// Steps must be re-entrant: when a step's postcondition already holds (for example
/// after a crash between its commit and a later step), applying it again must not
/// write anything.
pub trait MigrationStep {
    fn target_version(&self) -> i64;

    fn name(&self) -> &str;

    /// Steps that transiently violate a foreign key mid-step (rebuilds of referenced
    /// tables, mostly) run with enforcement switched off.
    fn requires_constraints_disabled(&self) -> bool {
        false
    }

    /// Stable digest recorded in the applied-step history.
    fn fingerprint(&self) -> String {
        sha256_hex([self.name()])
    }

    /// # Errors
    /// Returns an error when any statement of the step fails; the runner rolls the
    /// step's transaction back.
    fn apply(&self, conn: &Connection, ctx: &StepContext<'_>) -> Result<()>;
}

impl fmt::Debug for dyn MigrationStep + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("target_version", &self.target_version())
            .field("name", &self.name())
            .field("requires_constraints_disabled", &self.requires_constraints_disabled())
            .finish()
    }
}

fn sha256_hex<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0_u8]);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// A purely structural schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Raw SQL batch. Must be safe to repeat (`IF NOT EXISTS` and friends).
    Execute(String),
    CreateTable { name: String, columns: String },
    /// Skipped when the column already exists.
    AddColumn { table: String, column: String, definition: String },
    CreateIndex { name: String, table: String, columns: String, unique: bool },
    DropIndex { name: String },
    DropTable { name: String },
}

impl Operation {
    #[must_use]
    pub fn execute(sql: &str) -> Self {
        Self::Execute(sql.to_string())
    }

    #[must_use]
    pub fn create_table(name: &str, columns: &str) -> Self {
        Self::CreateTable { name: name.to_string(), columns: columns.to_string() }
    }

    #[must_use]
    pub fn add_column(table: &str, column: &str, definition: &str) -> Self {
        Self::AddColumn {
            table: table.to_string(),
            column: column.to_string(),
            definition: definition.to_string(),
        }
    }

    #[must_use]
    pub fn create_index(name: &str, table: &str, columns: &str) -> Self {
        Self::CreateIndex {
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.to_string(),
            unique: false,
        }
    }

    #[must_use]
    pub fn create_unique_index(name: &str, table: &str, columns: &str) -> Self {
        Self::CreateIndex {
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.to_string(),
            unique: true,
        }
    }

    #[must_use]
    pub fn drop_index(name: &str) -> Self {
        Self::DropIndex { name: name.to_string() }
    }

    #[must_use]
    pub fn drop_table(name: &str) -> Self {
        Self::DropTable { name: name.to_string() }
    }

    /// The statement this operation executes when its precondition does not hold.
    #[must_use]
    pub fn to_sql(&self) -> String {
        match self {
            Self::Execute(sql) => sql.clone(),
            Self::CreateTable { name, columns } => {
                format!("CREATE TABLE IF NOT EXISTS {} ({columns})", quote_ident(name))
            }
            Self::AddColumn { table, column, definition } => format!(
                "ALTER TABLE {} ADD COLUMN {} {definition}",
                quote_ident(table),
                quote_ident(column)
            ),
            Self::CreateIndex { name, table, columns, unique } => format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({columns})",
                if *unique { "UNIQUE " } else { "" },
                quote_ident(name),
                quote_ident(table)
            ),
            Self::DropIndex { name } => format!("DROP INDEX IF EXISTS {}", quote_ident(name)),
            Self::DropTable { name } => format!("DROP TABLE IF EXISTS {}", quote_ident(name)),
        }
    }

    /// # Errors
    /// Returns an error when the precondition probe or the statement fails.
    pub fn apply(&self, conn: &Connection) -> Result<()> {
        if let Self::AddColumn { table, column, .. } = self {
            if catalog::column_exists(conn, table, column)? {
                debug!(table = %table, column = %column, "column already exists, skipping");
                return Ok(());
            }
        }
        conn.execute_batch(&self.to_sql())?;
        Ok(())
    }
}

/// A step expressed as data: an ordered list of structural operations.
#[derive(Debug, Clone)]
pub struct DeclarativeStep {
    version: i64,
    name: String,
    operations: Vec<Operation>,
}

impl DeclarativeStep {
    #[must_use]
    pub fn new(version: i64, name: &str, operations: Vec<Operation>) -> Self {
        Self { version, name: name.to_string(), operations }
    }

    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }
}

impl MigrationStep for DeclarativeStep {
    fn target_version(&self) -> i64 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> String {
        let statements: Vec<String> = self.operations.iter().map(Operation::to_sql).collect();
        sha256_hex(std::iter::once(self.name.as_str()).chain(statements.iter().map(String::as_str)))
    }

    fn apply(&self, conn: &Connection, _ctx: &StepContext<'_>) -> Result<()> {
        for operation in &self.operations {
            operation.apply(conn)?;
        }
        Ok(())
    }
}

type StepBody = dyn Fn(&Connection, &StepContext<'_>) -> Result<()>;

/// A step with a hand-written body, reserved for repairs and rebuilds.
pub struct ProceduralStep {
    version: i64,
    name: String,
    constraints_disabled: bool,
    body: Box<StepBody>,
}

impl ProceduralStep {
    pub fn new<F>(version: i64, name: &str, body: F) -> Self
    where
        F: Fn(&Connection, &StepContext<'_>) -> Result<()> + 'static,
    {
        Self { version, name: name.to_string(), constraints_disabled: false, body: Box::new(body) }
    }

    #[must_use]
    pub fn with_constraints_disabled(mut self) -> Self {
        self.constraints_disabled = true;
        self
    }
}

impl fmt::Debug for ProceduralStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProceduralStep")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("constraints_disabled", &self.constraints_disabled)
            .finish_non_exhaustive()
    }
}

impl MigrationStep for ProceduralStep {
    fn target_version(&self) -> i64 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn requires_constraints_disabled(&self) -> bool {
        self.constraints_disabled
    }

    fn apply(&self, conn: &Connection, ctx: &StepContext<'_>) -> Result<()> {
        (self.body)(conn, ctx)
    }
}
