//! Generated records and the immutable batches they are persisted in.

use crate::types::JobId;
use serde::{Deserialize, Serialize};

/// Output of one template step for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_id: String,
    pub text: String,
}

/// A fully generated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedRecord {
    pub record_id: String,
    pub seed_index: u64,
    pub seed: serde_json::Value,
    pub outputs: Vec<StepOutput>,
    /// Estimated tokens spent on this record (prompt + output).
    pub tokens: u64,
}

impl GeneratedRecord {
    pub fn output(&self, step_id: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.step_id == step_id)
            .map(|o| o.text.as_str())
    }
}

/// An ordered set of records written under `(job_id, batch_number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub job_id: JobId,
    pub batch_number: u64,
    pub records: Vec<GeneratedRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
