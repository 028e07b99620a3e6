//! Merge rules: defaults first, later sources override earlier ones.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with the storage defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("storage.db_path", ".genworker/db")?
        .set_default("storage.artifacts_path", ".genworker/artifacts")?
        .set_default("storage.templates_path", "templates")?
        .set_default("storage.seeds_path", "seeds")
}
