use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_SHADOW_SUFFIX: &str = "_tmp";

/// Tunables for a migration run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    /// Upper bound on rows touched per statement during copies and cleanups.
    pub batch_size: usize,
    /// Appended to a table name to form its shadow table during a rebuild.
    pub shadow_suffix: String,
    /// Run `PRAGMA integrity_check` before the first step.
    pub integrity_check_first: bool,
    /// Where to write an online backup of the store before the first step.
    pub backup_path: Option<PathBuf>,
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            shadow_suffix: DEFAULT_SHADOW_SUFFIX.to_string(),
            integrity_check_first: true,
            backup_path: None,
            log_filter: "info".to_string(),
        }
    }
}

impl MigrationConfig {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    /// Returns [`MigrateError::Config`] when the document is malformed or fails validation.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| MigrateError::Config(format!("failed to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or its content is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// # Errors
    /// Returns [`MigrateError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MigrateError::Config("batch_size must be greater than zero".into()));
        }
        if self.shadow_suffix.is_empty()
            || !self.shadow_suffix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(MigrateError::Config(format!(
                "shadow_suffix must be non-empty and contain only [A-Za-z0-9_], got {:?}",
                self.shadow_suffix
            )));
        }
        Ok(())
    }

    /// Batch size as a SQL `LIMIT`/range bound.
    #[must_use]
    pub fn batch_limit(&self) -> i64 {
        i64::try_from(self.batch_size).unwrap_or(i64::MAX)
    }
}
