//! CLI route: builds the worker from configuration and dispatches commands.

use crate::cli::output::{format_job_text, format_jobs_text};
use crate::cli::parse::Commands;
use crate::config::{ConfigLoader, WorkerConfig};
use crate::error::WorkerError;
use crate::inference::HttpInferenceClient;
use crate::job::{JobRequest, JobStatus};
use crate::preemption::{PreemptionHandler, PreemptionState};
use crate::seeds::FsSeedSource;
use crate::store::{JobStore, SledBackends};
use crate::template::FsTemplateSource;
use crate::types::{default_owner_id, now_millis};
use crate::worker::{JobOutcome, RunReport, Worker, WorkerDeps};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Command result: text for stdout plus the process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            exit_code: 0,
        }
    }
}

/// Exit code when `run` found nothing to claim.
pub const EXIT_IDLE: i32 = 2;

pub struct RunContext {
    config: WorkerConfig,
    backends: SledBackends,
    worker: Worker,
}

impl RunContext {
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, WorkerError> {
        let config = ConfigLoader::load(&workspace_root, config_path.as_deref())?;
        Self::from_config(&workspace_root, config)
    }

    pub fn from_config(workspace_root: &Path, mut config: WorkerConfig) -> Result<Self, WorkerError> {
        config.storage = config.storage.resolved(workspace_root);
        let backends = SledBackends::open(&config.storage)?;
        let inference = Arc::new(HttpInferenceClient::new(&config.inference)?);
        let owner = default_owner_id(&config.worker.owner_prefix);

        let deps = WorkerDeps {
            jobs: backends.jobs.clone(),
            blobs: backends.blobs.clone(),
            ledger: backends.ledger.clone(),
            batches: backends.batches.clone(),
            inference,
            templates: Arc::new(FsTemplateSource::new(&config.storage.templates_path)),
            seeds: Arc::new(FsSeedSource::new(&config.storage.seeds_path)),
        };
        let worker = Worker::new(&config, owner, deps);
        Ok(Self {
            config,
            backends,
            worker,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn execute(&self, command: &Commands) -> Result<CommandOutput, WorkerError> {
        let result = self.execute_inner(command).await;
        self.backends.flush()?;
        result
    }

    async fn execute_inner(&self, command: &Commands) -> Result<CommandOutput, WorkerError> {
        match command {
            Commands::Run { until_idle } => {
                let preemption = Arc::new(PreemptionHandler::new(&self.config.preemption));
                let listener = preemption.listen_for_signals();
                let result = self.run(*until_idle, &preemption).await;
                preemption.mark_terminated();
                listener.abort();
                result
            }
            Commands::Enqueue { file } => self.enqueue(file),
            Commands::Status { job_id, format } => self.status(job_id.as_deref(), format),
            Commands::Export { job_id } => {
                let job = self.require_job(job_id)?;
                if job.status != JobStatus::Completed {
                    return Err(WorkerError::InvalidJob(format!(
                        "job {} is {}; only COMPLETED jobs are exported",
                        job_id, job.status
                    )));
                }
                let manifest = self.worker.export_pipeline().export(&job)?;
                let names: Vec<&str> = manifest.artifacts.iter().map(|a| a.name.as_str()).collect();
                Ok(CommandOutput::ok(format!(
                    "Exported {} records from job {}: {}",
                    manifest.total_records,
                    job_id,
                    names.join(", ")
                )))
            }
            Commands::RequeueExpired => {
                let requeued = self.worker.coordinator().requeue_expired(now_millis())?;
                Ok(CommandOutput::ok(if requeued.is_empty() {
                    "No expired leases".to_string()
                } else {
                    format!("Requeued: {}", requeued.join(", "))
                }))
            }
            Commands::Cancel { job_id } => {
                let job = self.backends.jobs.request_cancel(job_id)?;
                info!(job_id = %job_id, status = %job.status, "Cancellation requested");
                Ok(CommandOutput::ok(format_job_text(&job)))
            }
        }
    }

    async fn run(
        &self,
        until_idle: bool,
        preemption: &Arc<PreemptionHandler>,
    ) -> Result<CommandOutput, WorkerError> {
        let mut lines = Vec::new();
        loop {
            match self.worker.run_once(preemption.token()).await? {
                RunReport::Idle => {
                    if lines.is_empty() {
                        return Ok(CommandOutput {
                            text: "No claimable jobs".to_string(),
                            exit_code: EXIT_IDLE,
                        });
                    }
                    break;
                }
                RunReport::Finished { job_id, outcome } => {
                    let preempted = matches!(outcome, JobOutcome::Preempted { .. });
                    lines.push(describe_outcome(&job_id, &outcome));
                    if preempted || !until_idle {
                        break;
                    }
                }
            }
            if preemption.state() != PreemptionState::Running {
                break;
            }
        }
        Ok(CommandOutput::ok(lines.join("\n")))
    }

    fn enqueue(&self, file: &Path) -> Result<CommandOutput, WorkerError> {
        let contents = std::fs::read_to_string(file).map_err(|e| {
            WorkerError::InvalidJob(format!("failed to read {}: {}", file.display(), e))
        })?;
        let request: JobRequest = serde_json::from_str(&contents)
            .map_err(|e| WorkerError::InvalidJob(format!("{}: {}", file.display(), e)))?;
        request.validate().map_err(WorkerError::InvalidJob)?;

        let job = request.into_job(now_millis());
        if !self.worker.coordinator().enqueue(&job)? {
            return Err(WorkerError::InvalidJob(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        Ok(CommandOutput::ok(format!("Enqueued {}", job.job_id)))
    }

    fn status(&self, job_id: Option<&str>, format: &str) -> Result<CommandOutput, WorkerError> {
        let jobs = match job_id {
            Some(id) => vec![self.require_job(id)?],
            None => self.backends.jobs.list_jobs()?,
        };
        let text = match format {
            "json" => serde_json::to_string_pretty(&jobs)
                .map_err(|e| WorkerError::ConfigError(format!("Failed to encode jobs: {}", e)))?,
            "text" => format_jobs_text(&jobs),
            other => {
                return Err(WorkerError::ConfigError(format!(
                    "Invalid output format: {} (must be 'text' or 'json')",
                    other
                )))
            }
        };
        Ok(CommandOutput::ok(text))
    }

    fn require_job(&self, job_id: &str) -> Result<crate::job::Job, WorkerError> {
        self.backends
            .jobs
            .get_job(job_id)?
            .ok_or_else(|| WorkerError::InvalidJob(format!("job {} not found", job_id)))
    }
}

fn describe_outcome(job_id: &str, outcome: &JobOutcome) -> String {
    match outcome {
        JobOutcome::Completed {
            records_generated,
            export,
        } => format!(
            "job {}: COMPLETED ({} records, {} artifacts)",
            job_id,
            records_generated,
            export.artifacts.len()
        ),
        JobOutcome::BudgetExceeded { records_generated } => {
            format!("job {}: BUDGET_EXCEEDED ({} records)", job_id, records_generated)
        }
        JobOutcome::Cancelled { records_generated } => {
            format!("job {}: CANCELLED ({} records)", job_id, records_generated)
        }
        JobOutcome::Preempted { records_generated } => format!(
            "job {}: preempted after {} records, left RUNNING for resume",
            job_id, records_generated
        ),
        JobOutcome::ClaimLost { records_generated } => format!(
            "job {}: claim lost to another worker after {} records",
            job_id, records_generated
        ),
    }
}
