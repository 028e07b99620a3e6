//! Error types for the generation worker.

use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Corrupt stored data: {0}")]
    Corrupt(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Classified failures of a single inference call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),
}

impl InferenceError {
    /// Access denial cannot be fixed by moving on to the next record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InferenceError::AccessDenied(_))
    }
}

/// Template loading and validation errors
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Malformed template {template}: {message}")]
    Malformed { template: String, message: String },

    #[error("Template {template} has no steps")]
    Empty { template: String },

    #[error("Duplicate step id '{step_id}' in template {template}")]
    DuplicateStep { template: String, step_id: String },

    #[error("Step '{step_id}' references unknown or later step '{reference}'")]
    UnresolvedReference { step_id: String, reference: String },

    #[error("Step '{step_id}' is invalid: {message}")]
    InvalidStep { step_id: String, message: String },
}

/// Top-level worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Template error: {0}")]
    TemplateError(#[from] TemplateError),

    #[error("Checkpoint for job {job_id} still conflicting after {attempts} attempts")]
    CheckpointConflict { job_id: String, attempts: u32 },

    #[error("Inference access denied: {0}")]
    FatalAuth(String),

    #[error("Generation stalled after {0} consecutive record failures")]
    GenerationStalled(usize),

    #[error("Seed data error: {0}")]
    SeedError(String),

    #[error("Claim on job {job_id} no longer held by {owner}")]
    ClaimLost { job_id: String, owner: String },

    #[error("Status write failed for job {job_id}: {source}")]
    StatusWrite {
        job_id: String,
        #[source]
        source: StorageError,
    },

    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("Inference client error: {0}")]
    InferenceClient(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

impl WorkerError {
    /// Whether the failure should be written to the job as FAILED.
    ///
    /// Infrastructure failures leave the job RUNNING so that lease expiry
    /// hands it to a relaunched worker.
    pub fn is_terminal_for_job(&self) -> bool {
        matches!(
            self,
            WorkerError::FatalAuth(_)
                | WorkerError::TemplateError(_)
                | WorkerError::GenerationStalled(_)
                | WorkerError::SeedError(_)
        )
    }
}

impl From<config::ConfigError> for WorkerError {
    fn from(err: config::ConfigError) -> Self {
        WorkerError::ConfigError(err.to_string())
    }
}

pub(crate) fn sled_io(context: &str, err: sled::Error) -> StorageError {
    StorageError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{}: {}", context, err),
    ))
}

pub(crate) fn data_error(context: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::IoError(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{}: {}", context, err),
    ))
}
