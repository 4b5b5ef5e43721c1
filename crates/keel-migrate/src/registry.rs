use crate::error::{MigrateError, Result};
use crate::step::MigrationStep;

/// Steps ordered by strictly increasing target version. Gaps between versions are legal.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: Vec<Box<dyn MigrationStep>>,
}

impl StepRegistry {
    /// Build a registry, checking the ordering invariant before anything touches data.
    ///
    /// # Errors
    /// Returns [`MigrateError::InvalidRegistry`] when a version is below 1 or the
    /// versions are not strictly increasing in declaration order.
    pub fn new(steps: Vec<Box<dyn MigrationStep>>) -> Result<Self> {
        let mut previous: Option<(i64, &str)> = None;
        for step in &steps {
            let version = step.target_version();
            if version < 1 {
                return Err(MigrateError::InvalidRegistry(format!(
                    "step `{}` targets version {version}; versions start at 1",
                    step.name()
                )));
            }
            if let Some((prev_version, prev_name)) = previous {
                if version <= prev_version {
                    return Err(MigrateError::InvalidRegistry(format!(
                        "step `{}` (version {version}) must come after `{prev_name}` \
                         (version {prev_version}) with a strictly greater version",
                        step.name()
                    )));
                }
            }
            previous = Some((version, step.name()));
        }
        Ok(Self { steps })
    }

    /// Steps with a target version above `old_version`, ascending.
    pub fn pending(&self, old_version: i64) -> impl Iterator<Item = &dyn MigrationStep> {
        self.steps
            .iter()
            .map(|step| step.as_ref())
            .filter(move |step| step.target_version() > old_version)
    }

    /// Steps with `old_version < target <= new_version`, ascending.
    pub fn pending_between(
        &self,
        old_version: i64,
        new_version: i64,
    ) -> impl Iterator<Item = &dyn MigrationStep> {
        self.pending(old_version).take_while(move |step| step.target_version() <= new_version)
    }

    #[must_use]
    pub fn latest_version(&self) -> i64 {
        self.steps.last().map_or(0, |step| step.target_version())
    }

    #[must_use]
    pub fn versions(&self) -> Vec<i64> {
        self.steps.iter().map(|step| step.target_version()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
