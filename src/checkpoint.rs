//! Checkpoint store client
//!
//! Persists resume state as a versioned blob. Writes are conditional on the
//! version captured at the last read or write; conflicts are settled by
//! keeping whichever side has made more progress.

use crate::config::CheckpointConfig;
use crate::error::{data_error, WorkerError};
use crate::store::{BlobStore, BlobVersion, PutOutcome};
use crate::types::now_millis;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Durable progress marker for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub records_generated: u64,
    pub tokens_used: u64,
    /// Number of batches written so far; the next batch gets this number.
    pub current_batch_number: u64,
    /// Next seed index to process.
    pub resume_cursor: u64,
    pub updated_at_ms: u64,
    #[serde(skip)]
    pub concurrency_token: Option<BlobVersion>,
}

impl Checkpoint {
    pub fn zero(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            records_generated: 0,
            tokens_used: 0,
            current_batch_number: 0,
            resume_cursor: 0,
            updated_at_ms: 0,
            concurrency_token: None,
        }
    }
}

/// Outcome of resolving a conditional-write conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Merged {
    /// The stored checkpoint is at least as far along; it wins.
    Remote(Checkpoint),
    /// The local checkpoint is ahead; retry it against the remote version.
    Local(Checkpoint),
}

/// Keep the higher-progress checkpoint. Ties go to the stored copy.
pub fn merge(local: Checkpoint, remote: Checkpoint) -> Merged {
    if remote.records_generated >= local.records_generated {
        Merged::Remote(remote)
    } else {
        Merged::Local(Checkpoint {
            concurrency_token: remote.concurrency_token,
            ..local
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    /// A concurrent writer had stored equal or higher progress; the local
    /// checkpoint was replaced with it.
    Superseded,
}

pub fn checkpoint_key(job_id: &str) -> String {
    format!("checkpoint/{}", job_id)
}

pub struct CheckpointClient {
    store: Arc<dyn BlobStore>,
    config: CheckpointConfig,
}

impl CheckpointClient {
    pub fn new(store: Arc<dyn BlobStore>, config: CheckpointConfig) -> Self {
        Self { store, config }
    }

    /// Load the checkpoint for `job_id`.
    ///
    /// A missing blob yields a zero checkpoint. An unreadable one is logged
    /// and also yields zero, keeping its version so the next save replaces
    /// it. Store failures propagate.
    pub fn load(&self, job_id: &str) -> Result<Checkpoint, WorkerError> {
        let key = checkpoint_key(job_id);
        let Some(blob) = self.store.get(&key)? else {
            debug!(job_id, "No checkpoint stored, starting from zero");
            return Ok(Checkpoint::zero(job_id));
        };

        match serde_json::from_slice::<Checkpoint>(&blob.bytes) {
            Ok(mut checkpoint) if checkpoint.job_id == job_id => {
                checkpoint.concurrency_token = Some(blob.version);
                Ok(checkpoint)
            }
            Ok(other) => {
                error!(
                    job_id,
                    stored_job_id = %other.job_id,
                    version = %blob.version,
                    "Checkpoint belongs to another job, resetting progress to zero"
                );
                Ok(Checkpoint {
                    concurrency_token: Some(blob.version),
                    ..Checkpoint::zero(job_id)
                })
            }
            Err(err) => {
                error!(
                    job_id,
                    version = %blob.version,
                    error = %err,
                    "Corrupt checkpoint, resetting progress to zero"
                );
                Ok(Checkpoint {
                    concurrency_token: Some(blob.version),
                    ..Checkpoint::zero(job_id)
                })
            }
        }
    }

    /// Conditionally write `checkpoint`, updating its concurrency token.
    ///
    /// On conflict the stored copy is reloaded and merged. Gives up with
    /// `CheckpointConflict` after `max_attempts` writes.
    pub async fn save(&self, checkpoint: &mut Checkpoint) -> Result<SaveOutcome, WorkerError> {
        let key = checkpoint_key(&checkpoint.job_id);
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            checkpoint.updated_at_ms = now_millis();
            let bytes = serde_json::to_vec(&*checkpoint)
                .map_err(|e| data_error("Failed to encode checkpoint", e))?;

            match self.store.put(&key, &bytes, checkpoint.concurrency_token)? {
                PutOutcome::Written(version) => {
                    checkpoint.concurrency_token = Some(version);
                    debug!(
                        job_id = %checkpoint.job_id,
                        records_generated = checkpoint.records_generated,
                        version = %version,
                        attempt,
                        "Checkpoint saved"
                    );
                    return Ok(SaveOutcome::Written);
                }
                PutOutcome::VersionConflict => {
                    let remote = self.load(&checkpoint.job_id)?;
                    match merge(checkpoint.clone(), remote) {
                        Merged::Remote(remote) => {
                            warn!(
                                job_id = %checkpoint.job_id,
                                local_records = checkpoint.records_generated,
                                remote_records = remote.records_generated,
                                "Stored checkpoint is ahead, discarding local write"
                            );
                            *checkpoint = remote;
                            return Ok(SaveOutcome::Superseded);
                        }
                        Merged::Local(local) => {
                            *checkpoint = local;
                            warn!(
                                job_id = %checkpoint.job_id,
                                attempt,
                                max_attempts,
                                "Checkpoint version conflict, retrying"
                            );
                            if attempt < max_attempts {
                                let delay = self.config.backoff_ms * u64::from(attempt);
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                            }
                        }
                    }
                }
            }
        }

        Err(WorkerError::CheckpointConflict {
            job_id: checkpoint.job_id.clone(),
            attempts: max_attempts,
        })
    }
}
