//! Config loading entry point.

use super::merge::builder_with_defaults;
use super::sources;
use super::WorkerConfig;
use crate::error::WorkerError;
use std::collections::HashMap;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a worker started in `workspace_root`.
    ///
    /// Precedence (lowest to highest): defaults, user file, workspace file,
    /// `explicit` file, environment.
    pub fn load(workspace_root: &Path, explicit: Option<&Path>) -> Result<WorkerConfig, WorkerError> {
        Self::load_with_env(workspace_root, explicit, None)
    }

    /// Load a single file on top of the defaults, ignoring other sources.
    pub fn load_from_file(path: &Path) -> Result<WorkerConfig, WorkerError> {
        let builder = sources::add_explicit_file(builder_with_defaults()?, path)?;
        let config: WorkerConfig = builder.build()?.try_deserialize()?;
        Self::validated(config)
    }

    pub(crate) fn load_with_env(
        workspace_root: &Path,
        explicit: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<WorkerConfig, WorkerError> {
        let mut builder = builder_with_defaults()?;
        builder = sources::add_user_file(builder)?;
        builder = sources::add_workspace_file(builder, workspace_root)?;
        if let Some(path) = explicit {
            builder = sources::add_explicit_file(builder, path)?;
        }
        builder = sources::add_environment(builder, env);

        let config: WorkerConfig = builder.build()?.try_deserialize()?;
        Self::validated(config)
    }

    fn validated(config: WorkerConfig) -> Result<WorkerConfig, WorkerError> {
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            WorkerError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;
        Ok(config)
    }
}
