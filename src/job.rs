//! Job and queue entry model.

use crate::types::JobId;
use serde::{Deserialize, Serialize};

/// Maximum stored length of a failure reason.
pub const MAX_FAILURE_REASON_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    BudgetExceeded,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::BudgetExceeded => "BUDGET_EXCEEDED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a versioned template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub id: String,
    pub version: String,
}

impl std::fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Jsonl,
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// How records are split across export artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Partitioning {
    #[default]
    None,
    /// Fixed number of records per artifact.
    Records { per_file: usize },
    /// One artifact per distinct output value of a step.
    Field { step_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSelection {
    pub formats: Vec<ExportFormat>,
    #[serde(default)]
    pub partitioning: Partitioning,
}

impl Default for OutputSelection {
    fn default() -> Self {
        Self {
            formats: vec![ExportFormat::Jsonl],
            partitioning: Partitioning::None,
        }
    }
}

/// A unit of generation work.
///
/// Created by the API layer in `Queued`; once claimed only the worker
/// mutates it. `budget_limit` and `target_record_count` never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    /// Claimant attribution; the submitting principal before the first claim.
    pub owner: String,
    pub status: JobStatus,
    pub budget_limit: f64,
    pub target_record_count: u64,
    #[serde(default)]
    pub records_generated: u64,
    #[serde(default)]
    pub cost_accumulated: f64,
    pub template: TemplateRef,
    pub seed_ref: String,
    #[serde(default)]
    pub output: OutputSelection,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub created_at_ms: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
}

/// Fields written together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusFields {
    pub records_generated: Option<u64>,
    pub cost_accumulated: Option<f64>,
    pub failure_reason: Option<String>,
    pub owner: Option<String>,
}

impl StatusFields {
    pub fn progress(records_generated: u64, cost_accumulated: f64) -> Self {
        Self {
            records_generated: Some(records_generated),
            cost_accumulated: Some(cost_accumulated),
            ..Self::default()
        }
    }

    pub fn apply(&self, job: &mut Job) {
        if let Some(records) = self.records_generated {
            job.records_generated = records;
        }
        if let Some(cost) = self.cost_accumulated {
            job.cost_accumulated = cost;
        }
        if let Some(reason) = &self.failure_reason {
            job.failure_reason = Some(truncate_reason(reason));
        }
        if let Some(owner) = &self.owner {
            job.owner = owner.clone();
        }
    }
}

/// Truncate a failure reason on a char boundary.
pub fn truncate_reason(reason: &str) -> String {
    match reason.char_indices().nth(MAX_FAILURE_REASON_CHARS) {
        Some((byte_idx, _)) => reason[..byte_idx].to_string(),
        None => reason.to_string(),
    }
}

/// Scheduling partition a queue entry lives in; mirrors `JobStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueuePartition {
    Queued,
    Running,
}

impl QueuePartition {
    fn prefix(self) -> &'static str {
        match self {
            QueuePartition::Queued => "QUEUED/",
            QueuePartition::Running => "RUNNING/",
        }
    }

    pub fn key_prefix(self) -> &'static [u8] {
        self.prefix().as_bytes()
    }
}

/// Scheduling hint for a queued or running job. The job record is
/// authoritative; an entry may go stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub partition: QueuePartition,
    pub job_id: JobId,
    pub enqueued_at_ms: u64,
    #[serde(default)]
    pub lease_expires_at_ms: Option<u64>,
}

const QUEUE_TS_PAD: usize = 20;

impl QueueEntry {
    pub fn queued(job_id: impl Into<JobId>, enqueued_at_ms: u64) -> Self {
        Self {
            partition: QueuePartition::Queued,
            job_id: job_id.into(),
            enqueued_at_ms,
            lease_expires_at_ms: None,
        }
    }

    /// The RUNNING counterpart of this entry, keeping its enqueue time.
    pub fn into_running(self, lease_expires_at_ms: u64) -> Self {
        Self {
            partition: QueuePartition::Running,
            lease_expires_at_ms: Some(lease_expires_at_ms),
            ..self
        }
    }

    pub fn into_queued(self) -> Self {
        Self {
            partition: QueuePartition::Queued,
            lease_expires_at_ms: None,
            ..self
        }
    }

    /// Composite key: partition, then zero-padded enqueue time, then job id,
    /// so a prefix scan of a partition yields FIFO order.
    pub fn key(&self) -> String {
        format!(
            "{}{:0pad$}#{}",
            self.partition.prefix(),
            self.enqueued_at_ms,
            self.job_id,
            pad = QUEUE_TS_PAD
        )
    }

    pub fn lease_expired(&self, now_ms: u64) -> bool {
        matches!(self.lease_expires_at_ms, Some(expiry) if expiry <= now_ms)
    }
}

/// A job as submitted by the API layer (or the launcher's `enqueue`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    #[serde(default = "default_submitter")]
    pub owner: String,
    pub budget_limit: f64,
    pub target_record_count: u64,
    pub template: TemplateRef,
    pub seed_ref: String,
    #[serde(default)]
    pub output: OutputSelection,
}

fn default_submitter() -> String {
    "cli".to_string()
}

impl JobRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.job_id.trim().is_empty()
            || self.job_id.contains('/')
            || self.job_id.contains('\\')
            || self.job_id.starts_with('.')
            || self.job_id.chars().any(char::is_control)
        {
            return Err(format!("job id {:?} is not usable", self.job_id));
        }
        if !self.budget_limit.is_finite() || self.budget_limit < 0.0 {
            return Err(format!("budget_limit must be finite and non-negative, got {}", self.budget_limit));
        }
        if self.target_record_count == 0 {
            return Err("target_record_count must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn into_job(self, now_ms: u64) -> Job {
        Job {
            job_id: self.job_id,
            owner: self.owner,
            status: JobStatus::Queued,
            budget_limit: self.budget_limit,
            target_record_count: self.target_record_count,
            records_generated: 0,
            cost_accumulated: 0.0,
            template: self.template,
            seed_ref: self.seed_ref,
            output: self.output,
            failure_reason: None,
            cancel_requested: false,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}
