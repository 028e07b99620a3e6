//! The resumable record loop.
//!
//! Resumes from the stored checkpoint, gates every record on the budget and
//! the cancellation token, and flushes batch, checkpoint and ledger together
//! every `checkpoint_interval` records and on exit.

use super::engine::{GenerationEngine, RecordInput};
use crate::batch::{Batch, GeneratedRecord};
use crate::checkpoint::{Checkpoint, CheckpointClient, SaveOutcome};
use crate::error::WorkerError;
use crate::job::Job;
use crate::ledger::BudgetLedger;
use crate::queue::JobQueueCoordinator;
use crate::store::BatchSink;
use crate::template::Template;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why the loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Completed,
    Preempted,
    BudgetExceeded,
    Cancelled,
    /// Another worker took over the job after this worker's lease lapsed.
    ClaimLost,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub exit: LoopExit,
    pub checkpoint: Checkpoint,
    pub spend: f64,
    /// Records abandoned during this attempt.
    pub abandoned: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub checkpoint_interval: u64,
    pub max_consecutive_failures: usize,
}

pub struct GenerationLoop {
    engine: GenerationEngine,
    checkpoints: Arc<CheckpointClient>,
    batches: Arc<dyn BatchSink>,
    coordinator: Arc<JobQueueCoordinator>,
    settings: LoopSettings,
}

/// Records produced since the last flush.
struct Pending {
    records: Vec<GeneratedRecord>,
    processed: u64,
}

impl GenerationLoop {
    pub fn new(
        engine: GenerationEngine,
        checkpoints: Arc<CheckpointClient>,
        batches: Arc<dyn BatchSink>,
        coordinator: Arc<JobQueueCoordinator>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            engine,
            checkpoints,
            batches,
            coordinator,
            settings,
        }
    }

    pub async fn run(
        &self,
        job: &Job,
        template: &Template,
        seeds: &[serde_json::Value],
        ledger: &BudgetLedger,
        cancel: CancellationToken,
    ) -> Result<LoopOutcome, WorkerError> {
        if seeds.is_empty() {
            return Err(WorkerError::SeedError(format!(
                "seed set {} is empty",
                job.seed_ref
            )));
        }

        let job_id = job.job_id.as_str();
        let mut checkpoint = self.checkpoints.load(job_id)?;
        let adopted = self.adopt_unrecorded_batches(&mut checkpoint)?;
        if adopted > 0 || checkpoint.concurrency_token.is_none() {
            self.checkpoints.save(&mut checkpoint).await?;
        }
        let spend = ledger.prime(job_id);
        info!(
            job_id,
            resume_cursor = checkpoint.resume_cursor,
            records_generated = checkpoint.records_generated,
            batch_number = checkpoint.current_batch_number,
            spend,
            target = job.target_record_count,
            "Starting generation loop"
        );

        let interval = self.settings.checkpoint_interval.max(1);
        let renew_every = self.coordinator.lease() / 3;
        let mut last_renewal = Instant::now();
        let mut pending = Pending {
            records: Vec::new(),
            processed: 0,
        };
        let mut consecutive_failures = 0usize;
        let mut abandoned = 0u64;

        let exit = loop {
            let seed_index = checkpoint.resume_cursor;
            if seed_index >= job.target_record_count {
                break LoopExit::Completed;
            }
            if cancel.is_cancelled() {
                info!(job_id, seed_index, "Preemption observed at record boundary");
                break LoopExit::Preempted;
            }
            if last_renewal.elapsed() >= renew_every {
                if !self.coordinator.renew_lease(job_id)? {
                    self.release_claim(job_id, &mut checkpoint, &mut pending, ledger);
                    break LoopExit::ClaimLost;
                }
                last_renewal = Instant::now();
            }
            let spend = ledger.current_spend(job_id);
            if spend >= job.budget_limit {
                info!(
                    job_id,
                    seed_index,
                    spend,
                    budget_limit = job.budget_limit,
                    "Budget exhausted"
                );
                break LoopExit::BudgetExceeded;
            }

            let seed = &seeds[(seed_index % seeds.len() as u64) as usize];
            let input = RecordInput {
                job_id,
                seed,
                seed_index,
            };
            match self.engine.generate_record(template, input, ledger).await {
                Ok(record) => {
                    consecutive_failures = 0;
                    checkpoint.records_generated += 1;
                    checkpoint.tokens_used += record.tokens;
                    pending.records.push(record);
                }
                Err(err) if err.is_fatal() => {
                    warn!(job_id, seed_index, error = %err, "Fatal inference failure");
                    checkpoint.resume_cursor = seed_index;
                    self.flush_quietly(job, &mut checkpoint, &mut pending, ledger)
                        .await;
                    return Err(WorkerError::FatalAuth(err.to_string()));
                }
                Err(err) => {
                    abandoned += 1;
                    consecutive_failures += 1;
                    warn!(
                        job_id,
                        seed_index,
                        consecutive_failures,
                        error = %err,
                        "Record abandoned"
                    );
                    if consecutive_failures >= self.settings.max_consecutive_failures {
                        checkpoint.resume_cursor = seed_index + 1;
                        self.flush_quietly(job, &mut checkpoint, &mut pending, ledger)
                            .await;
                        return Err(WorkerError::GenerationStalled(consecutive_failures));
                    }
                }
            }

            checkpoint.resume_cursor = seed_index + 1;
            pending.processed += 1;

            if pending.processed >= interval {
                match self.flush(job, &mut checkpoint, &mut pending, ledger).await? {
                    Some(current) if current.cancel_requested => {
                        info!(job_id, "Cancellation requested, stopping");
                        break LoopExit::Cancelled;
                    }
                    Some(_) => last_renewal = Instant::now(),
                    None => break LoopExit::ClaimLost,
                }
            }
        };

        let mut exit = exit;
        if exit != LoopExit::ClaimLost
            && (pending.processed > 0 || !pending.records.is_empty())
            && self
                .flush(job, &mut checkpoint, &mut pending, ledger)
                .await?
                .is_none()
        {
            exit = LoopExit::ClaimLost;
        }
        let spend = ledger.current_spend(job_id);
        info!(
            job_id,
            owner = %self.coordinator.owner(),
            exit = ?exit,
            records_generated = checkpoint.records_generated,
            abandoned,
            spend,
            "Generation loop finished"
        );

        Ok(LoopOutcome {
            exit,
            checkpoint,
            spend,
            abandoned,
        })
    }

    /// Fold batches numbered at or past the checkpoint into it. These are left
    /// behind when a process dies between a batch write and the checkpoint
    /// save that should have followed it.
    fn adopt_unrecorded_batches(&self, checkpoint: &mut Checkpoint) -> Result<usize, WorkerError> {
        let job_id = checkpoint.job_id.clone();
        let mut adopted = 0;
        for number in self.batches.list_batches(&job_id)? {
            if number < checkpoint.current_batch_number {
                continue;
            }
            let batch = self.batches.read_batch(&job_id, number)?;
            if let Some(last) = batch.records.iter().map(|r| r.seed_index).max() {
                checkpoint.resume_cursor = checkpoint.resume_cursor.max(last + 1);
            }
            checkpoint.records_generated += batch.len() as u64;
            checkpoint.tokens_used += batch.records.iter().map(|r| r.tokens).sum::<u64>();
            checkpoint.current_batch_number = number + 1;
            warn!(
                job_id = %job_id,
                batch_number = number,
                records = batch.len(),
                "Adopting batch written after the last checkpoint"
            );
            adopted += 1;
        }
        Ok(adopted)
    }

    /// Write the pending batch, save the checkpoint, append the accrued cost
    /// and renew the claim. Returns the re-read job record, or `None` if the
    /// claim has passed to another worker.
    async fn flush(
        &self,
        job: &Job,
        checkpoint: &mut Checkpoint,
        pending: &mut Pending,
        ledger: &BudgetLedger,
    ) -> Result<Option<Job>, WorkerError> {
        let job_id = job.job_id.as_str();
        if !self.coordinator.renew_lease(job_id)? {
            self.release_claim(job_id, checkpoint, pending, ledger);
            return Ok(None);
        }

        if !pending.records.is_empty() {
            let batch = Batch {
                job_id: job.job_id.clone(),
                batch_number: checkpoint.current_batch_number,
                records: std::mem::take(&mut pending.records),
            };
            if !self.batches.write_batch(&batch)? {
                warn!(
                    job_id,
                    batch_number = batch.batch_number,
                    "Batch already written, keeping stored copy"
                );
            }
            debug!(job_id, batch_number = batch.batch_number, records = batch.len(), "Batch flushed");
            checkpoint.current_batch_number += 1;
        }

        if self.checkpoints.save(checkpoint).await? == SaveOutcome::Superseded {
            warn!(
                job_id,
                resume_cursor = checkpoint.resume_cursor,
                "Continuing from a checkpoint written by another claimant"
            );
        }
        pending.processed = 0;

        ledger.flush_pending(job_id);
        let current = self.coordinator.record_progress(
            job_id,
            checkpoint.records_generated,
            ledger.current_spend(job_id),
        )?;
        if current.is_none() {
            warn!(job_id, owner = %self.coordinator.owner(), "Claim lost while recording progress");
        }
        Ok(current)
    }

    /// Give up a claim another worker now holds. Spend already incurred is
    /// still recorded; unflushed records are dropped because the batch and
    /// checkpoint sequence now belongs to the new claimant.
    fn release_claim(
        &self,
        job_id: &str,
        checkpoint: &mut Checkpoint,
        pending: &mut Pending,
        ledger: &BudgetLedger,
    ) {
        ledger.flush_pending(job_id);
        let dropped = std::mem::take(&mut pending.records);
        checkpoint.records_generated -= dropped.len() as u64;
        checkpoint.tokens_used -= dropped.iter().map(|r| r.tokens).sum::<u64>();
        pending.processed = 0;
        warn!(
            job_id,
            owner = %self.coordinator.owner(),
            dropped = dropped.len(),
            "Claim lost to another worker, stopping"
        );
    }

    /// Best-effort flush on a path that is already failing.
    async fn flush_quietly(
        &self,
        job: &Job,
        checkpoint: &mut Checkpoint,
        pending: &mut Pending,
        ledger: &BudgetLedger,
    ) {
        if let Err(err) = self.flush(job, checkpoint, pending, ledger).await {
            warn!(job_id = %job.job_id, error = %err, "Failed to flush progress before failing");
        }
    }
}
