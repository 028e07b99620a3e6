//! Template sources.

use super::Template;
use crate::error::TemplateError;
use crate::job::TemplateRef;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read-only, versioned template lookup.
pub trait TemplateSource: Send + Sync {
    /// Load and validate a template.
    fn load(&self, template: &TemplateRef) -> Result<Template, TemplateError>;
}

/// Templates stored as `{root}/{id}/{version}.json` or `.toml`.
pub struct FsTemplateSource {
    root: PathBuf,
}

impl FsTemplateSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn candidates(&self, template: &TemplateRef) -> Result<[PathBuf; 2], TemplateError> {
        for part in [&template.id, &template.version] {
            if part.is_empty() || part.contains('/') || part.contains('\\') || part.starts_with('.') {
                return Err(TemplateError::NotFound(format!(
                    "{} (invalid name component {:?})",
                    template, part
                )));
            }
        }
        let dir = self.root.join(&template.id);
        Ok([
            dir.join(format!("{}.json", template.version)),
            dir.join(format!("{}.toml", template.version)),
        ])
    }
}

impl TemplateSource for FsTemplateSource {
    fn load(&self, template: &TemplateRef) -> Result<Template, TemplateError> {
        let name = template.to_string();
        let path = self
            .candidates(template)?
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| TemplateError::NotFound(name.clone()))?;

        let contents = std::fs::read_to_string(&path).map_err(|e| TemplateError::Malformed {
            template: name.clone(),
            message: format!("failed to read {}: {}", path.display(), e),
        })?;

        let parsed: Result<Template, String> = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents).map_err(|e| e.to_string()),
            _ => serde_json::from_str(&contents).map_err(|e| e.to_string()),
        };
        let mut loaded = parsed.map_err(|message| TemplateError::Malformed {
            template: name.clone(),
            message,
        })?;

        loaded.id = template.id.clone();
        loaded.version = template.version.clone();
        loaded.validate()?;
        debug!(template = %name, steps = loaded.steps.len(), path = %path.display(), "Loaded template");
        Ok(loaded)
    }
}
