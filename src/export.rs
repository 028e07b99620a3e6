//! Export pipeline
//!
//! Runs after a job completes: streams the job's batches in ascending order,
//! encodes them in every requested format and writes the artifacts plus a
//! manifest through the batch sink. A lone unpartitioned JSONL artifact is
//! written batch by batch; every other selection buffers the records. Output depends only on the stored
//! batches, so re-running an export reproduces the same bytes.

use crate::batch::{Batch, GeneratedRecord};
use crate::error::{StorageError, WorkerError};
use crate::job::{ExportFormat, Job, Partitioning};
use crate::store::BatchSink;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

mod encode;
mod partition;

pub use encode::{csv_columns, encode_records};
pub use partition::{effective_partitioning, partition_records, Partition};

pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub name: String,
    pub format: ExportFormat,
    pub records: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub job_id: String,
    pub total_records: usize,
    pub batches: usize,
    pub artifacts: Vec<ExportArtifact>,
}

pub struct ExportPipeline {
    batches: Arc<dyn BatchSink>,
}

impl ExportPipeline {
    pub fn new(batches: Arc<dyn BatchSink>) -> Self {
        Self { batches }
    }

    /// Stream a job's batches in ascending batch-number order.
    pub fn load_all_batches<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Result<impl Iterator<Item = Result<Batch, StorageError>> + 'a, StorageError> {
        let numbers = self.batches.list_batches(job_id)?;
        Ok(numbers
            .into_iter()
            .map(move |number| self.batches.read_batch(job_id, number)))
    }

    pub fn export(&self, job: &Job) -> Result<ExportManifest, WorkerError> {
        let job_id = job.job_id.as_str();
        let mut formats: Vec<ExportFormat> = Vec::new();
        for format in &job.output.formats {
            if !formats.contains(format) {
                formats.push(*format);
            }
        }
        if formats.is_empty() {
            warn!(job_id, "No export formats selected, defaulting to jsonl");
            formats.push(ExportFormat::Jsonl);
        }

        let (total_records, batch_count, artifacts) =
            if formats == [ExportFormat::Jsonl] && job.output.partitioning == Partitioning::None {
                self.stream_jsonl(job_id)?
            } else {
                self.export_buffered(job, &formats)?
            };

        let manifest = ExportManifest {
            job_id: job_id.to_string(),
            total_records,
            batches: batch_count,
            artifacts,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| WorkerError::ExportFailed(format!("Failed to encode manifest: {}", e)))?;
        self.batches.write_export(job_id, MANIFEST_NAME, &manifest_bytes)?;

        info!(
            job_id,
            records = manifest.total_records,
            batches = manifest.batches,
            artifacts = manifest.artifacts.len(),
            "Export written"
        );
        Ok(manifest)
    }

    /// Single unpartitioned JSONL artifact, written one batch at a time.
    fn stream_jsonl(&self, job_id: &str) -> Result<(usize, usize, Vec<ExportArtifact>), WorkerError> {
        let format = ExportFormat::Jsonl;
        let name = format!("{}.{}", partition::BASE_NAME, format.extension());
        let mut writer = self.batches.open_export(job_id, &name)?;
        let mut records = 0usize;
        let mut bytes = 0usize;
        let mut batch_count = 0usize;
        for batch in self.load_all_batches(job_id)? {
            let batch = batch?;
            debug!(job_id, batch_number = batch.batch_number, records = batch.len(), "Streaming batch to export");
            let refs: Vec<&GeneratedRecord> = batch.records.iter().collect();
            let encoded = encode_records(format, &refs, &[])?;
            writer.append(&encoded)?;
            records += refs.len();
            bytes += encoded.len();
            batch_count += 1;
        }
        writer.commit()?;

        let artifact = ExportArtifact {
            name,
            format,
            records,
            bytes,
        };
        Ok((records, batch_count, vec![artifact]))
    }

    /// Artifacts that need every record at once: JSON arrays, CSV headers
    /// and partitioned output.
    fn export_buffered(
        &self,
        job: &Job,
        formats: &[ExportFormat],
    ) -> Result<(usize, usize, Vec<ExportArtifact>), WorkerError> {
        let job_id = job.job_id.as_str();
        let mut records: Vec<GeneratedRecord> = Vec::new();
        let mut batch_count = 0usize;
        for batch in self.load_all_batches(job_id)? {
            let batch = batch?;
            debug!(job_id, batch_number = batch.batch_number, records = batch.len(), "Loaded batch for export");
            batch_count += 1;
            records.extend(batch.records);
        }

        let columns = csv_columns(&records);
        let mut artifacts = Vec::new();
        for &format in formats {
            let partitioning = effective_partitioning(format, &job.output.partitioning);
            if partitioning != job.output.partitioning {
                warn!(
                    job_id,
                    format = format.extension(),
                    requested = ?job.output.partitioning,
                    "Partitioning not supported for format, writing a single artifact"
                );
            }

            for partition in partition_records(&records, &partitioning) {
                let name = format!("{}.{}", partition.name, format.extension());
                let bytes = encode_records(format, &partition.records, &columns)?;
                self.batches.write_export(job_id, &name, &bytes)?;
                artifacts.push(ExportArtifact {
                    name,
                    format,
                    records: partition.records.len(),
                    bytes: bytes.len(),
                });
            }
        }
        Ok((records.len(), batch_count, artifacts))
    }
}
