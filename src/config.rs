//! Configuration System
//!
//! Worker configuration with layered sources: built-in defaults, an optional
//! user-level file, an optional workspace file, an explicit file, then
//! `GENWORKER__SECTION__KEY` environment overrides.

use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerConfig {
    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub preemption: PreemptionConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Generation loop and claim settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Prefix of the claimant id recorded on claimed jobs
    #[serde(default = "default_owner_prefix")]
    pub owner_prefix: String,

    /// Records between batch flushes and checkpoint saves
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// How long a claim stays valid without a checkpoint renewing it
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Consecutive abandoned records before the job is failed
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,

    /// Queue entries inspected per claim attempt
    #[serde(default = "default_claim_scan_limit")]
    pub claim_scan_limit: usize,
}

fn default_owner_prefix() -> String {
    "genworker".to_string()
}

fn default_checkpoint_interval() -> u64 {
    50
}

fn default_lease_secs() -> u64 {
    15 * 60
}

fn default_max_consecutive_failures() -> usize {
    25
}

fn default_claim_scan_limit() -> usize {
    8
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            owner_prefix: default_owner_prefix(),
            checkpoint_interval: default_checkpoint_interval(),
            lease_secs: default_lease_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            claim_scan_limit: default_claim_scan_limit(),
        }
    }
}

impl WorkerSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

/// Termination notice handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreemptionConfig {
    /// Grace period the host grants after a termination notice
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Safety margin kept below the grace period for the hard deadline
    #[serde(default = "default_deadline_margin_secs")]
    pub deadline_margin_secs: u64,
}

fn default_grace_period_secs() -> u64 {
    120
}

fn default_deadline_margin_secs() -> u64 {
    20
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            deadline_margin_secs: default_deadline_margin_secs(),
        }
    }
}

impl PreemptionConfig {
    /// Time after a shutdown request at which the process self-terminates.
    pub fn hard_deadline(&self) -> Duration {
        Duration::from_secs(
            self.grace_period_secs
                .saturating_sub(self.deadline_margin_secs),
        )
    }
}

/// Conditional-write retry policy for checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled database holding jobs, queue, checkpoints and the cost ledger
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Root of batch files and export artifacts
    #[serde(default = "default_artifacts_path")]
    pub artifacts_path: PathBuf,

    /// Root of versioned template files
    #[serde(default = "default_templates_path")]
    pub templates_path: PathBuf,

    /// Root that seed references are resolved against
    #[serde(default = "default_seeds_path")]
    pub seeds_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".genworker/db")
}

fn default_artifacts_path() -> PathBuf {
    PathBuf::from(".genworker/artifacts")
}

fn default_templates_path() -> PathBuf {
    PathBuf::from("templates")
}

fn default_seeds_path() -> PathBuf {
    PathBuf::from("seeds")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            artifacts_path: default_artifacts_path(),
            templates_path: default_templates_path(),
            seeds_path: default_seeds_path(),
        }
    }
}

impl StorageConfig {
    /// Resolve relative locations against `root`.
    pub fn resolved(&self, root: &Path) -> StorageConfig {
        let resolve = |path: &PathBuf| {
            if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            }
        };
        StorageConfig {
            db_path: resolve(&self.db_path),
            artifacts_path: resolve(&self.artifacts_path),
            templates_path: resolve(&self.templates_path),
            seeds_path: resolve(&self.seeds_path),
        }
    }
}

/// Inference endpoint (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Model used by steps that do not name one
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "http://localhost:8080/v1".to_string()
}

fn default_model() -> String {
    "default".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            default_model: default_model(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Cost model applied to every inference invocation (currency units)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub per_invocation: f64,

    #[serde(default = "default_input_price")]
    pub input_per_1k_tokens: f64,

    #[serde(default = "default_output_price")]
    pub output_per_1k_tokens: f64,
}

fn default_input_price() -> f64 {
    0.003
}

fn default_output_price() -> f64 {
    0.015
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            per_invocation: 0.0,
            input_per_1k_tokens: default_input_price(),
            output_per_1k_tokens: default_output_price(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Worker(String),
    Preemption(String),
    Checkpoint(String),
    Storage(String),
    Inference(String),
    Pricing(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Worker(msg) => write!(f, "worker: {}", msg),
            ValidationError::Preemption(msg) => write!(f, "preemption: {}", msg),
            ValidationError::Checkpoint(msg) => write!(f, "checkpoint: {}", msg),
            ValidationError::Storage(msg) => write!(f, "storage: {}", msg),
            ValidationError::Inference(msg) => write!(f, "inference: {}", msg),
            ValidationError::Pricing(msg) => write!(f, "pricing: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl WorkerConfig {
    /// Validate the entire configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.worker.checkpoint_interval == 0 {
            errors.push(ValidationError::Worker(
                "checkpoint_interval must be at least 1".to_string(),
            ));
        }
        if self.worker.max_consecutive_failures == 0 {
            errors.push(ValidationError::Worker(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.worker.lease_secs == 0 {
            errors.push(ValidationError::Worker("lease_secs must be positive".to_string()));
        }
        if self.worker.claim_scan_limit == 0 {
            errors.push(ValidationError::Worker(
                "claim_scan_limit must be at least 1".to_string(),
            ));
        }
        if self.preemption.deadline_margin_secs >= self.preemption.grace_period_secs {
            errors.push(ValidationError::Preemption(format!(
                "deadline_margin_secs ({}) must be below grace_period_secs ({})",
                self.preemption.deadline_margin_secs, self.preemption.grace_period_secs
            )));
        }
        if self.checkpoint.max_attempts == 0 {
            errors.push(ValidationError::Checkpoint(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.storage.db_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage("db_path cannot be empty".to_string()));
        }
        if self.storage.artifacts_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "artifacts_path cannot be empty".to_string(),
            ));
        }
        if !self.inference.endpoint.starts_with("http://")
            && !self.inference.endpoint.starts_with("https://")
        {
            errors.push(ValidationError::Inference(format!(
                "endpoint must be an http(s) URL, got '{}'",
                self.inference.endpoint
            )));
        }
        if self.inference.default_model.trim().is_empty() {
            errors.push(ValidationError::Inference(
                "default_model cannot be empty".to_string(),
            ));
        }
        let prices = [
            self.pricing.per_invocation,
            self.pricing.input_per_1k_tokens,
            self.pricing.output_per_1k_tokens,
        ];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            errors.push(ValidationError::Pricing(
                "prices must be finite and non-negative".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
