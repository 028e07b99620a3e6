//! Sled-backed job and queue store.
//!
//! Three trees: job records by id, queue entries by composite key, and a
//! job id → queue key index that keeps at most one entry per job. Every
//! multi-tree mutation runs in a single sled transaction.

use crate::error::{data_error, sled_io, StorageError};
use crate::job::{Job, JobStatus, QueueEntry, QueuePartition, StatusFields};
use crate::store::{ClaimOutcome, JobStore};
use crate::types::now_millis;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Transactional, Tree};

const TREE_JOBS: &str = "jobs";
const TREE_QUEUE: &str = "queue";
const TREE_QUEUE_INDEX: &str = "queue_index";

#[derive(Clone)]
pub struct SledJobStore {
    jobs: Tree,
    queue: Tree,
    index: Tree,
}

impl SledJobStore {
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        let jobs = db
            .open_tree(TREE_JOBS)
            .map_err(|e| sled_io("Failed to open jobs tree", e))?;
        let queue = db
            .open_tree(TREE_QUEUE)
            .map_err(|e| sled_io("Failed to open queue tree", e))?;
        let index = db
            .open_tree(TREE_QUEUE_INDEX)
            .map_err(|e| sled_io("Failed to open queue index tree", e))?;
        Ok(Self { jobs, queue, index })
    }

    /// Flag a job for cancellation. The worker running it observes the flag at
    /// its next checkpoint; a job that is still QUEUED is cancelled directly.
    pub fn request_cancel(&self, job_id: &str) -> Result<Job, StorageError> {
        let job_id = job_id.to_string();
        let result = (&self.jobs, &self.queue, &self.index).transaction(
            |(jobs, queue, index)| -> ConflictableTransactionResult<Job, StorageError> {
                let mut job = read_job(jobs, &job_id)?
                    .ok_or_else(|| abort(StorageError::JobNotFound(job_id.clone())))?;
                job.cancel_requested = true;
                if job.status == JobStatus::Queued {
                    if let Some(key) = index.remove(job_id.as_bytes())? {
                        queue.remove(key)?;
                    }
                    job.status = JobStatus::Cancelled;
                }
                job.updated_at_ms = now_millis();
                write_job(jobs, &job)?;
                Ok(job)
            },
        );
        result.map_err(|e| map_tx("Failed to request cancellation", e))
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let mut out = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item.map_err(|e| sled_io("Failed to iterate jobs", e))?;
            out.push(decode_job(&value)?);
        }
        out.sort_by_key(|job| job.created_at_ms);
        Ok(out)
    }

    fn scan_partition(
        &self,
        partition: QueuePartition,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        let mut out = Vec::new();
        for item in self.queue.scan_prefix(partition.key_prefix()).take(limit) {
            let (_, value) = item.map_err(|e| sled_io("Failed to scan queue", e))?;
            out.push(decode_entry(&value)?);
        }
        Ok(out)
    }
}

impl JobStore for SledJobStore {
    fn enqueue(&self, job: &Job, enqueued_at_ms: u64) -> Result<bool, StorageError> {
        let mut job = job.clone();
        job.status = JobStatus::Queued;
        if job.created_at_ms == 0 {
            job.created_at_ms = enqueued_at_ms;
        }
        job.updated_at_ms = enqueued_at_ms;
        let entry = QueueEntry::queued(job.job_id.clone(), enqueued_at_ms);
        let key = entry.key();
        let entry_bytes = encode_entry(&entry)?;

        let result = (&self.jobs, &self.queue, &self.index).transaction(
            |(jobs, queue, index)| -> ConflictableTransactionResult<bool, StorageError> {
                if jobs.get(job.job_id.as_bytes())?.is_some() {
                    return Ok(false);
                }
                write_job(jobs, &job)?;
                queue.insert(key.as_bytes(), entry_bytes.clone())?;
                index.insert(job.job_id.as_bytes(), key.as_bytes())?;
                Ok(true)
            },
        );
        result.map_err(|e| map_tx("Failed to enqueue job", e))
    }

    fn get_job(&self, job_id: &str) -> Result<Option<Job>, StorageError> {
        match self
            .jobs
            .get(job_id.as_bytes())
            .map_err(|e| sled_io("Failed to read job", e))?
        {
            Some(raw) => Ok(Some(decode_job(&raw)?)),
            None => Ok(None),
        }
    }

    fn oldest_queued(&self, limit: usize) -> Result<Vec<QueueEntry>, StorageError> {
        self.scan_partition(QueuePartition::Queued, limit)
    }

    fn try_claim(
        &self,
        entry: &QueueEntry,
        owner: &str,
        lease_expires_at_ms: u64,
    ) -> Result<ClaimOutcome, StorageError> {
        let queued_key = entry.key();
        let running = entry.clone().into_running(lease_expires_at_ms);
        let running_key = running.key();
        let running_bytes = encode_entry(&running)?;

        let result = (&self.jobs, &self.queue, &self.index).transaction(
            |(jobs, queue, index)| -> ConflictableTransactionResult<ClaimOutcome, StorageError> {
                if queue.get(queued_key.as_bytes())?.is_none() {
                    return Ok(ClaimOutcome::RaceLost);
                }
                let job = match read_job(jobs, &entry.job_id)? {
                    Some(job) if job.status == JobStatus::Queued => job,
                    _ => {
                        queue.remove(queued_key.as_bytes())?;
                        index.remove(entry.job_id.as_bytes())?;
                        return Ok(ClaimOutcome::Stale);
                    }
                };

                queue.remove(queued_key.as_bytes())?;
                queue.insert(running_key.as_bytes(), running_bytes.clone())?;
                index.insert(entry.job_id.as_bytes(), running_key.as_bytes())?;

                let mut job = job;
                job.status = JobStatus::Running;
                job.owner = owner.to_string();
                job.updated_at_ms = now_millis();
                write_job(jobs, &job)?;
                Ok(ClaimOutcome::Claimed(job))
            },
        );
        result.map_err(|e| map_tx("Failed to claim job", e))
    }

    fn update_claimed(
        &self,
        job_id: &str,
        owner: &str,
        status: JobStatus,
        fields: &StatusFields,
    ) -> Result<Option<Job>, StorageError> {
        let result = (&self.jobs, &self.queue, &self.index).transaction(
            |(jobs, queue, index)| -> ConflictableTransactionResult<Option<Job>, StorageError> {
                let mut job = read_job(jobs, job_id)?
                    .ok_or_else(|| abort(StorageError::JobNotFound(job_id.to_string())))?;
                if job.status != JobStatus::Running || job.owner != owner {
                    return Ok(None);
                }
                job.status = status;
                fields.apply(&mut job);
                job.updated_at_ms = now_millis();
                write_job(jobs, &job)?;
                if status.is_terminal() {
                    if let Some(key) = index.remove(job_id.as_bytes())? {
                        queue.remove(key)?;
                    }
                }
                Ok(Some(job))
            },
        );
        result.map_err(|e| map_tx("Failed to update job status", e))
    }

    fn running_entries(&self) -> Result<Vec<QueueEntry>, StorageError> {
        self.scan_partition(QueuePartition::Running, usize::MAX)
    }

    fn renew_lease(
        &self,
        job_id: &str,
        owner: &str,
        lease_expires_at_ms: u64,
    ) -> Result<bool, StorageError> {
        let result = (&self.jobs, &self.queue, &self.index).transaction(
            |(jobs, queue, index)| -> ConflictableTransactionResult<bool, StorageError> {
                match read_job(jobs, job_id)? {
                    Some(job) if job.status == JobStatus::Running && job.owner == owner => {}
                    _ => return Ok(false),
                }
                let Some(key) = index.get(job_id.as_bytes())? else {
                    return Ok(false);
                };
                let Some(raw) = queue.get(&key)? else {
                    return Ok(false);
                };
                let mut entry = decode_entry(&raw).map_err(abort)?;
                if entry.partition != QueuePartition::Running {
                    return Ok(false);
                }
                entry.lease_expires_at_ms = Some(lease_expires_at_ms);
                queue.insert(key, encode_entry(&entry).map_err(abort)?)?;
                Ok(true)
            },
        );
        result.map_err(|e| map_tx("Failed to renew lease", e))
    }

    fn requeue_expired_entry(
        &self,
        entry: &QueueEntry,
        now_ms: u64,
    ) -> Result<bool, StorageError> {
        let running_key = entry.key();
        let result = (&self.jobs, &self.queue, &self.index).transaction(
            |(jobs, queue, index)| -> ConflictableTransactionResult<bool, StorageError> {
                let Some(raw) = queue.get(running_key.as_bytes())? else {
                    return Ok(false);
                };
                let current = decode_entry(&raw).map_err(abort)?;
                if current.partition != QueuePartition::Running || !current.lease_expired(now_ms)
                {
                    return Ok(false);
                }
                let mut job = match read_job(jobs, &current.job_id)? {
                    Some(job) if job.status == JobStatus::Running => job,
                    _ => {
                        // Job already finished; the entry is a leftover hint.
                        queue.remove(running_key.as_bytes())?;
                        index.remove(current.job_id.as_bytes())?;
                        return Ok(false);
                    }
                };

                let queued = current.clone().into_queued();
                let queued_key = queued.key();
                queue.remove(running_key.as_bytes())?;
                queue.insert(queued_key.as_bytes(), encode_entry(&queued).map_err(abort)?)?;
                index.insert(current.job_id.as_bytes(), queued_key.as_bytes())?;

                job.status = JobStatus::Queued;
                job.updated_at_ms = now_ms;
                write_job(jobs, &job)?;
                Ok(true)
            },
        );
        result.map_err(|e| map_tx("Failed to requeue expired job", e))
    }
}

fn abort(err: StorageError) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err)
}

fn map_tx(context: &str, err: TransactionError<StorageError>) -> StorageError {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => sled_io(context, err),
    }
}

fn read_job(
    jobs: &TransactionalTree,
    job_id: &str,
) -> Result<Option<Job>, ConflictableTransactionError<StorageError>> {
    match jobs.get(job_id.as_bytes())? {
        Some(raw) => Ok(Some(decode_job(&raw).map_err(abort)?)),
        None => Ok(None),
    }
}

fn write_job(
    jobs: &TransactionalTree,
    job: &Job,
) -> Result<(), ConflictableTransactionError<StorageError>> {
    let value = serde_json::to_vec(job)
        .map_err(|e| abort(data_error("Failed to serialize job", e)))?;
    jobs.insert(job.job_id.as_bytes(), value)?;
    Ok(())
}

fn decode_job(raw: &[u8]) -> Result<Job, StorageError> {
    serde_json::from_slice(raw).map_err(|e| data_error("Failed to deserialize job", e))
}

fn encode_entry(entry: &QueueEntry) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(entry).map_err(|e| data_error("Failed to serialize queue entry", e))
}

fn decode_entry(raw: &[u8]) -> Result<QueueEntry, StorageError> {
    serde_json::from_slice(raw).map_err(|e| data_error("Failed to deserialize queue entry", e))
}
