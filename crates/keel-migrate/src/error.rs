use thiserror::Error;

use crate::audit::ViolationReport;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to format timestamp: {0}")]
    Time(#[from] time::error::Format),
    #[error("invalid step registry: {0}")]
    InvalidRegistry(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("downgrade from version {from} to {to} is not supported")]
    Downgrade { from: i64, to: i64 },
    #[error("schema version may not decrease (current {current}, attempted {attempted})")]
    VersionRegression { current: i64, attempted: i64 },
    #[error("rebuild of table `{table}` failed: {reason}")]
    Rebuild { table: String, reason: String },
    #[error("{groups} duplicate group(s) remain in `{table}` after repair")]
    UnresolvedDuplicates { table: String, groups: usize },
    #[error("database corruption detected: {0}")]
    Corruption(String),
    #[error("{} foreign key violation(s) remain after migration", .0.len())]
    ForeignKeyViolations(ViolationReport),
    #[error("migration step {version} failed: {source}")]
    StepFailed {
        version: i64,
        #[source]
        source: Box<MigrateError>,
    },
}

impl MigrateError {
    pub(crate) fn rebuild(table: &str, reason: impl Into<String>) -> Self {
        Self::Rebuild { table: table.to_string(), reason: reason.into() }
    }

    /// True for conditions where the store holds data the engine refuses to carry forward.
    #[must_use]
    pub fn is_data_integrity(&self) -> bool {
        match self {
            Self::ForeignKeyViolations(_)
            | Self::UnresolvedDuplicates { .. }
            | Self::Corruption(_) => true,
            Self::StepFailed { source, .. } => source.is_data_integrity(),
            _ => false,
        }
    }

    /// The residual violation report, when this error carries one.
    #[must_use]
    pub fn violations(&self) -> Option<&ViolationReport> {
        match self {
            Self::ForeignKeyViolations(report) => Some(report),
            Self::StepFailed { source, .. } => source.violations(),
            _ => None,
        }
    }
}

/// A single row whose payload could not be interpreted during a repair scan.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("row {row_id}: {reason}")]
pub struct PayloadError {
    pub row_id: i64,
    pub reason: String,
}

impl PayloadError {
    #[must_use]
    pub fn new(row_id: i64, reason: impl Into<String>) -> Self {
        Self { row_id, reason: reason.into() }
    }
}

pub type Result<T, E = MigrateError> = std::result::Result<T, E>;
