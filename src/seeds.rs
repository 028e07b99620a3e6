//! Seed record sources.

use crate::error::WorkerError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Read-only ordered list of seed records.
pub trait SeedSource: Send + Sync {
    fn load(&self, seed_ref: &str) -> Result<Vec<serde_json::Value>, WorkerError>;
}

/// JSON Lines files resolved relative to a root directory.
pub struct FsSeedSource {
    root: PathBuf,
}

impl FsSeedSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, seed_ref: &str) -> Result<PathBuf, WorkerError> {
        let relative = Path::new(seed_ref);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if seed_ref.is_empty() || escapes {
            return Err(WorkerError::SeedError(format!(
                "seed reference must be a relative path inside the seed root: {:?}",
                seed_ref
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl SeedSource for FsSeedSource {
    fn load(&self, seed_ref: &str) -> Result<Vec<serde_json::Value>, WorkerError> {
        let path = self.resolve(seed_ref)?;
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            WorkerError::SeedError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let seeds = parse_jsonl(&contents)
            .map_err(|e| WorkerError::SeedError(format!("{}: {}", path.display(), e)))?;
        debug!(seed_ref, count = seeds.len(), "Loaded seed records");
        Ok(seeds)
    }
}

/// Parse JSON Lines, skipping blank lines. An empty set is an error.
pub fn parse_jsonl(contents: &str) -> Result<Vec<serde_json::Value>, String> {
    let mut seeds = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(line)
            .map_err(|e| format!("line {}: {}", line_no + 1, e))?;
        seeds.push(value);
    }
    if seeds.is_empty() {
        return Err("no seed records".to_string());
    }
    Ok(seeds)
}
