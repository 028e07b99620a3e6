//! Job queue coordinator
//!
//! Claims work from the shared queue with exactly-one-claimant semantics and
//! records status transitions. Losing a claim race is an expected outcome,
//! not an error.

use crate::error::WorkerError;
use crate::job::{Job, JobStatus, StatusFields};
use crate::store::{ClaimOutcome, JobStore};
use crate::types::now_millis;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct JobQueueCoordinator {
    store: Arc<dyn JobStore>,
    owner: String,
    lease: Duration,
    scan_limit: usize,
}

impl JobQueueCoordinator {
    pub fn new(store: Arc<dyn JobStore>, owner: impl Into<String>, lease: Duration, scan_limit: usize) -> Self {
        Self {
            store,
            owner: owner.into(),
            lease,
            scan_limit: scan_limit.max(1),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn lease_deadline(&self, now_ms: u64) -> u64 {
        now_ms.saturating_add(self.lease.as_millis() as u64)
    }

    /// Claim the oldest queued job.
    ///
    /// Returns `None` when the queue is empty or another worker won the race
    /// for the head entry. Entries whose job is no longer queued are dropped
    /// and the next entry is tried.
    pub fn claim_next(&self) -> Result<Option<Job>, WorkerError> {
        let entries = self.store.oldest_queued(self.scan_limit)?;
        if entries.is_empty() {
            debug!(owner = %self.owner, "Queue empty");
            return Ok(None);
        }

        for entry in entries {
            let lease_expires_at_ms = self.lease_deadline(now_millis());
            match self.store.try_claim(&entry, &self.owner, lease_expires_at_ms)? {
                ClaimOutcome::Claimed(job) => {
                    info!(
                        job_id = %job.job_id,
                        owner = %self.owner,
                        enqueued_at_ms = entry.enqueued_at_ms,
                        lease_expires_at_ms,
                        "Claimed job"
                    );
                    return Ok(Some(job));
                }
                ClaimOutcome::RaceLost => {
                    debug!(job_id = %entry.job_id, owner = %self.owner, "Claim race lost");
                    return Ok(None);
                }
                ClaimOutcome::Stale => {
                    debug!(job_id = %entry.job_id, "Dropped stale queue entry");
                }
            }
        }
        Ok(None)
    }

    /// Extend this worker's claim on a running job. Returns false once the
    /// claim has passed to another worker or the job left RUNNING.
    pub fn renew_lease(&self, job_id: &str) -> Result<bool, WorkerError> {
        let until = self.lease_deadline(now_millis());
        let renewed = self.store.renew_lease(job_id, &self.owner, until)?;
        if renewed {
            debug!(job_id, owner = %self.owner, lease_expires_at_ms = until, "Renewed lease");
        } else {
            warn!(job_id, owner = %self.owner, "Claim no longer held, lease not renewed");
        }
        Ok(renewed)
    }

    /// Return RUNNING jobs whose lease lapsed to the queue. Returns the ids of
    /// the requeued jobs.
    pub fn requeue_expired(&self, now_ms: u64) -> Result<Vec<String>, WorkerError> {
        let mut requeued = Vec::new();
        for entry in self.store.running_entries()? {
            if !entry.lease_expired(now_ms) {
                continue;
            }
            if self.store.requeue_expired_entry(&entry, now_ms)? {
                info!(
                    job_id = %entry.job_id,
                    lease_expires_at_ms = ?entry.lease_expires_at_ms,
                    "Requeued job with expired lease"
                );
                requeued.push(entry.job_id.clone());
            }
        }
        Ok(requeued)
    }

    /// Record progress without changing status. Returns `None` if the claim
    /// is no longer held.
    pub fn record_progress(
        &self,
        job_id: &str,
        records_generated: u64,
        cost_accumulated: f64,
    ) -> Result<Option<Job>, WorkerError> {
        self.write_status(
            job_id,
            JobStatus::Running,
            StatusFields::progress(records_generated, cost_accumulated),
        )
    }

    pub fn mark_complete(&self, job_id: &str, fields: StatusFields) -> Result<Job, WorkerError> {
        self.finish(job_id, JobStatus::Completed, fields)
    }

    pub fn mark_failed(
        &self,
        job_id: &str,
        reason: &str,
        fields: StatusFields,
    ) -> Result<Job, WorkerError> {
        let fields = StatusFields {
            failure_reason: Some(reason.to_string()),
            ..fields
        };
        self.finish(job_id, JobStatus::Failed, fields)
    }

    pub fn mark_budget_exceeded(&self, job_id: &str, fields: StatusFields) -> Result<Job, WorkerError> {
        self.finish(job_id, JobStatus::BudgetExceeded, fields)
    }

    pub fn mark_cancelled(&self, job_id: &str, fields: StatusFields) -> Result<Job, WorkerError> {
        self.finish(job_id, JobStatus::Cancelled, fields)
    }

    fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        fields: StatusFields,
    ) -> Result<Job, WorkerError> {
        let Some(job) = self.write_status(job_id, status, fields)? else {
            warn!(job_id, owner = %self.owner, status = %status, "Claim lost, status not written");
            return Err(WorkerError::ClaimLost {
                job_id: job_id.to_string(),
                owner: self.owner.clone(),
            });
        };
        info!(
            job_id,
            owner = %self.owner,
            status = %status,
            records_generated = job.records_generated,
            cost_accumulated = job.cost_accumulated,
            "Job finished"
        );
        Ok(job)
    }

    fn write_status(
        &self,
        job_id: &str,
        status: JobStatus,
        fields: StatusFields,
    ) -> Result<Option<Job>, WorkerError> {
        self.store
            .update_claimed(job_id, &self.owner, status, &fields)
            .map_err(|source| WorkerError::StatusWrite {
                job_id: job_id.to_string(),
                source,
            })
    }

    /// Current job record, if any.
    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, WorkerError> {
        Ok(self.store.get_job(job_id)?)
    }

    /// Submit a new job. Returns false if the id is taken.
    pub fn enqueue(&self, job: &Job) -> Result<bool, WorkerError> {
        let now = now_millis();
        let inserted = self.store.enqueue(job, now)?;
        if inserted {
            info!(job_id = %job.job_id, target = job.target_record_count, budget = job.budget_limit, "Enqueued job");
        } else {
            warn!(job_id = %job.job_id, "Job already exists, not enqueued");
        }
        Ok(inserted)
    }
}
