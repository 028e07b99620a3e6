//! Worker: claims one job and drives it to a terminal or paused state.

use crate::checkpoint::CheckpointClient;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::export::{ExportManifest, ExportPipeline};
use crate::generation::{GenerationEngine, GenerationLoop, LoopExit, LoopOutcome, LoopSettings};
use crate::inference::InferenceService;
use crate::job::{Job, StatusFields};
use crate::ledger::BudgetLedger;
use crate::queue::JobQueueCoordinator;
use crate::seeds::SeedSource;
use crate::store::{BatchSink, BlobStore, CostLedgerStore, JobStore};
use crate::template::TemplateSource;
use crate::types::now_millis;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Collaborators injected into a worker.
pub struct WorkerDeps {
    pub jobs: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub ledger: Arc<dyn CostLedgerStore>,
    pub batches: Arc<dyn BatchSink>,
    pub inference: Arc<dyn InferenceService>,
    pub templates: Arc<dyn TemplateSource>,
    pub seeds: Arc<dyn SeedSource>,
}

/// How a job attempt ended without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        records_generated: u64,
        export: ExportManifest,
    },
    BudgetExceeded {
        records_generated: u64,
    },
    Cancelled {
        records_generated: u64,
    },
    /// Interrupted by a shutdown request; the job stays RUNNING and resumes
    /// from its checkpoint after the lease lapses.
    Preempted {
        records_generated: u64,
    },
    /// The lease lapsed and another worker now owns the job. Nothing was
    /// written to the job record.
    ClaimLost {
        records_generated: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunReport {
    /// Nothing was claimable.
    Idle,
    Finished { job_id: String, outcome: JobOutcome },
}

pub struct Worker {
    coordinator: Arc<JobQueueCoordinator>,
    checkpoints: Arc<CheckpointClient>,
    generation: GenerationLoop,
    ledger_store: Arc<dyn CostLedgerStore>,
    templates: Arc<dyn TemplateSource>,
    seeds: Arc<dyn SeedSource>,
    export: ExportPipeline,
}

impl Worker {
    pub fn new(config: &WorkerConfig, owner: impl Into<String>, deps: WorkerDeps) -> Self {
        let coordinator = Arc::new(JobQueueCoordinator::new(
            deps.jobs,
            owner,
            config.worker.lease(),
            config.worker.claim_scan_limit,
        ));
        let checkpoints = Arc::new(CheckpointClient::new(deps.blobs, config.checkpoint.clone()));
        let engine = GenerationEngine::new(
            deps.inference,
            config.pricing.clone(),
            config.inference.default_model.clone(),
        );
        let generation = GenerationLoop::new(
            engine,
            checkpoints.clone(),
            deps.batches.clone(),
            coordinator.clone(),
            LoopSettings {
                checkpoint_interval: config.worker.checkpoint_interval,
                max_consecutive_failures: config.worker.max_consecutive_failures,
            },
        );

        Self {
            coordinator,
            checkpoints,
            generation,
            ledger_store: deps.ledger,
            templates: deps.templates,
            seeds: deps.seeds,
            export: ExportPipeline::new(deps.batches),
        }
    }

    pub fn coordinator(&self) -> &JobQueueCoordinator {
        &self.coordinator
    }

    pub fn export_pipeline(&self) -> &ExportPipeline {
        &self.export
    }

    /// Requeue lapsed claims, claim one job and run it.
    pub async fn run_once(&self, cancel: CancellationToken) -> Result<RunReport, WorkerError> {
        let requeued = self.coordinator.requeue_expired(now_millis())?;
        if !requeued.is_empty() {
            info!(count = requeued.len(), "Requeued jobs with expired leases");
        }

        let Some(job) = self.coordinator.claim_next()? else {
            return Ok(RunReport::Idle);
        };
        let job_id = job.job_id.clone();
        let outcome = self.run_job(job, cancel).await?;
        Ok(RunReport::Finished { job_id, outcome })
    }

    /// Run a claimed job until it finishes, is interrupted, or fails.
    ///
    /// Job-level failures are written as FAILED before being returned.
    /// Infrastructure failures are returned with the job left RUNNING.
    pub async fn run_job(&self, job: Job, cancel: CancellationToken) -> Result<JobOutcome, WorkerError> {
        let job_id = job.job_id.clone();
        let ledger = BudgetLedger::new(self.ledger_store.clone());

        match self.execute(&job, &ledger, cancel).await {
            Ok(outcome) => self.finish(&job_id, outcome),
            Err(err) if err.is_terminal_for_job() => {
                let records = match self.checkpoints.load(&job_id) {
                    Ok(checkpoint) => checkpoint.records_generated,
                    Err(_) => job.records_generated,
                };
                let fields = StatusFields::progress(records, ledger.current_spend(&job_id));
                error!(job_id = %job_id, error = %err, "Job failed");
                self.coordinator
                    .mark_failed(&job_id, &err.to_string(), fields)?;
                Err(err)
            }
            Err(err) => {
                error!(
                    job_id = %job_id,
                    error = %err,
                    "Attempt aborted, job left RUNNING until its lease expires"
                );
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        ledger: &BudgetLedger,
        cancel: CancellationToken,
    ) -> Result<LoopOutcome, WorkerError> {
        let template = self.templates.load(&job.template)?;
        let seeds = self.seeds.load(&job.seed_ref)?;
        info!(
            job_id = %job.job_id,
            template = %job.template,
            steps = template.steps.len(),
            invocations_per_record = template.invocations_per_record(),
            seeds = seeds.len(),
            "Running job"
        );
        self.generation
            .run(job, &template, &seeds, ledger, cancel)
            .await
    }

    fn finish(&self, job_id: &str, outcome: LoopOutcome) -> Result<JobOutcome, WorkerError> {
        let records_generated = outcome.checkpoint.records_generated;
        let fields = StatusFields::progress(records_generated, outcome.spend);
        match outcome.exit {
            LoopExit::Completed => {
                let job = self.coordinator.mark_complete(job_id, fields)?;
                let export = self.export.export(&job).map_err(|err| {
                    error!(job_id, error = %err, "Export failed, job stays COMPLETED");
                    err
                })?;
                Ok(JobOutcome::Completed {
                    records_generated,
                    export,
                })
            }
            LoopExit::BudgetExceeded => {
                self.coordinator.mark_budget_exceeded(job_id, fields)?;
                Ok(JobOutcome::BudgetExceeded { records_generated })
            }
            LoopExit::Cancelled => {
                self.coordinator.mark_cancelled(job_id, fields)?;
                Ok(JobOutcome::Cancelled { records_generated })
            }
            LoopExit::Preempted => {
                warn!(
                    job_id,
                    records_generated,
                    "Preempted, progress checkpointed and job left RUNNING"
                );
                Ok(JobOutcome::Preempted { records_generated })
            }
            LoopExit::ClaimLost => {
                warn!(
                    job_id,
                    owner = %self.coordinator.owner(),
                    records_generated,
                    "Job claimed by another worker, leaving it to them"
                );
                Ok(JobOutcome::ClaimLost { records_generated })
            }
        }
    }
}
