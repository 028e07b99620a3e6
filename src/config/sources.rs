//! Config sources: user-level file, workspace file, explicit file, environment.

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::{Environment, File};
use directories::ProjectDirs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_PREFIX: &str = "GENWORKER";
pub const ENV_SEPARATOR: &str = "__";

/// User-level config file, e.g. `~/.config/genworker/config.toml` on Linux.
pub fn user_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "genworker").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Add the user-level config file to the builder if it exists.
pub fn add_user_file(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    match user_config_path() {
        Some(path) if path.exists() => {
            debug!(config_path = %path.display(), "Using user config file");
            Ok(builder.add_source(File::from(path).required(false)))
        }
        _ => Ok(builder),
    }
}

/// Add `config/genworker.toml` under the working directory if it exists.
pub fn add_workspace_file(
    builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let path = workspace_root.join("config").join("genworker.toml");
    if path.exists() {
        debug!(config_path = %path.display(), "Using workspace config file");
        return Ok(builder.add_source(File::from(path).required(false)));
    }
    Ok(builder)
}

/// Add an explicitly requested file; it must exist.
pub fn add_explicit_file(
    builder: ConfigBuilder<DefaultState>,
    path: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Ok(builder.add_source(File::from(path.to_path_buf()).required(true)))
}

/// Add `GENWORKER__SECTION__KEY` overrides. `vars` replaces the process
/// environment when given.
pub fn add_environment(
    builder: ConfigBuilder<DefaultState>,
    vars: Option<HashMap<String, String>>,
) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(vars),
    )
}
