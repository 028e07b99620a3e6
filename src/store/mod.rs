//! Durable store contracts
//!
//! The worker talks to its collaborators only through these traits. Sled and
//! filesystem implementations live in the submodules; tests substitute their
//! own where a failure needs to be injected.

pub mod batches;
pub mod blob;
pub mod jobs;
pub mod ledger;

pub use batches::FsBatchSink;
pub use blob::SledBlobStore;
pub use jobs::SledJobStore;
pub use ledger::SledLedgerStore;

use crate::batch::Batch;
use crate::error::StorageError;
use crate::job::{Job, JobStatus, QueueEntry, StatusFields};
use crate::ledger::CostRecord;
use crate::config::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Result of a single conditional claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Job),
    /// The entry vanished before the transaction committed.
    RaceLost,
    /// The entry pointed at a job that is no longer QUEUED; it was removed.
    Stale,
}

/// Queue and job record store.
///
/// Every mutation touching both the queue and a job record must be atomic.
pub trait JobStore: Send + Sync {
    /// Insert a new QUEUED job with its queue entry. Returns false if the job
    /// already exists.
    fn enqueue(&self, job: &Job, enqueued_at_ms: u64) -> Result<bool, StorageError>;

    fn get_job(&self, job_id: &str) -> Result<Option<Job>, StorageError>;

    /// Oldest QUEUED entries, FIFO by enqueue time.
    fn oldest_queued(&self, limit: usize) -> Result<Vec<QueueEntry>, StorageError>;

    /// Move `entry` from QUEUED to RUNNING and mark the job RUNNING, guarded by
    /// the entry still existing in QUEUED.
    fn try_claim(
        &self,
        entry: &QueueEntry,
        owner: &str,
        lease_expires_at_ms: u64,
    ) -> Result<ClaimOutcome, StorageError>;

    /// Write `status` and `fields` if the job is RUNNING under `owner`.
    /// A terminal status also drops the job's queue entry in the same
    /// transaction. Returns `None` when the claim belongs to someone else.
    fn update_claimed(
        &self,
        job_id: &str,
        owner: &str,
        status: JobStatus,
        fields: &StatusFields,
    ) -> Result<Option<Job>, StorageError>;

    fn running_entries(&self) -> Result<Vec<QueueEntry>, StorageError>;

    /// Extend the lease of the job's RUNNING entry. Returns false if the job
    /// has no RUNNING entry or is no longer claimed by `owner`.
    fn renew_lease(
        &self,
        job_id: &str,
        owner: &str,
        lease_expires_at_ms: u64,
    ) -> Result<bool, StorageError>;

    /// Return an expired RUNNING entry and its job to QUEUED. Re-checks the
    /// lease inside the transaction; returns false if nothing changed.
    fn requeue_expired_entry(&self, entry: &QueueEntry, now_ms: u64)
        -> Result<bool, StorageError>;
}

/// Opaque concurrency token of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobVersion(pub u64);

impl std::fmt::Display for BlobVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct VersionedBlob {
    pub bytes: Vec<u8>,
    pub version: BlobVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written(BlobVersion),
    VersionConflict,
}

/// Versioned blob store with conditional put.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<VersionedBlob>, StorageError>;

    /// Write `bytes` if the stored version equals `expected`, or if the key is
    /// absent when `expected` is `None`.
    fn put(
        &self,
        key: &str,
        bytes: &[u8],
        expected: Option<BlobVersion>,
    ) -> Result<PutOutcome, StorageError>;
}

/// Append-only cost ledger.
pub trait CostLedgerStore: Send + Sync {
    fn append(&self, job_id: &str, record: &CostRecord) -> Result<(), StorageError>;

    fn latest(&self, job_id: &str) -> Result<Option<CostRecord>, StorageError>;

    fn list(&self, job_id: &str) -> Result<Vec<CostRecord>, StorageError>;
}

/// Batch and export artifact sink.
pub trait BatchSink: Send + Sync {
    /// Persist a batch. Batches are immutable: returns false and leaves the
    /// stored batch untouched if the number was already written.
    fn write_batch(&self, batch: &Batch) -> Result<bool, StorageError>;

    /// Written batch numbers in ascending order.
    fn list_batches(&self, job_id: &str) -> Result<Vec<u64>, StorageError>;

    fn read_batch(&self, job_id: &str, batch_number: u64) -> Result<Batch, StorageError>;

    fn write_export(&self, job_id: &str, name: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Start an export artifact that is written in pieces.
    fn open_export(&self, job_id: &str, name: &str) -> Result<Box<dyn ExportWriter>, StorageError>;
}

/// An export artifact under construction. Nothing appears under the final
/// name until `commit`.
pub trait ExportWriter: Send {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Open (or create) the sled database shared by the sled-backed stores.
pub fn open_db<P: AsRef<Path>>(path: P) -> Result<sled::Db, StorageError> {
    sled::open(path).map_err(|e| crate::error::sled_io("Failed to open sled database", e))
}

/// The on-disk stores a worker process runs against.
pub struct SledBackends {
    pub db: sled::Db,
    pub jobs: Arc<SledJobStore>,
    pub blobs: Arc<SledBlobStore>,
    pub ledger: Arc<SledLedgerStore>,
    pub batches: Arc<FsBatchSink>,
}

impl SledBackends {
    pub fn open(storage: &StorageConfig) -> Result<Self, StorageError> {
        if let Some(parent) = storage.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = open_db(&storage.db_path)?;
        Ok(Self {
            jobs: Arc::new(SledJobStore::new(&db)?),
            blobs: Arc::new(SledBlobStore::new(&db)?),
            ledger: Arc::new(SledLedgerStore::new(&db)?),
            batches: Arc::new(FsBatchSink::new(&storage.artifacts_path)?),
            db,
        })
    }

    /// Flush sled to disk; called before the process exits.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| crate::error::sled_io("Failed to flush sled database", e))
    }
}
