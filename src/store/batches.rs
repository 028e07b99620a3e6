//! Filesystem batch and export sink
//!
//! Layout under the root:
//! `{root}/{job_id}/batches/{batch_number:08}.json` and
//! `{root}/{job_id}/exports/{artifact}`.
//!
//! All writes, including streamed exports, go to a `.tmp` sibling first and are renamed into place, so a
//! reader never observes a half-written batch.

use crate::batch::Batch;
use crate::error::{data_error, StorageError};
use crate::store::{BatchSink, ExportWriter};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const BATCH_DIR: &str = "batches";
const EXPORT_DIR: &str = "exports";
const BATCH_EXT: &str = "json";

pub struct FsBatchSink {
    root: PathBuf,
}

impl FsBatchSink {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to create artifact root {:?}: {}", root, e),
            ))
        })?;
        Ok(Self { root })
    }

    fn job_dir(&self, job_id: &str) -> Result<PathBuf, StorageError> {
        if job_id.is_empty()
            || job_id.contains('/')
            || job_id.contains('\\')
            || job_id == "."
            || job_id == ".."
        {
            return Err(StorageError::InvalidPath(format!(
                "job id not usable as a directory name: {:?}",
                job_id
            )));
        }
        Ok(self.root.join(job_id))
    }

    fn batch_path(&self, job_id: &str, batch_number: u64) -> Result<PathBuf, StorageError> {
        Ok(self
            .job_dir(job_id)?
            .join(BATCH_DIR)
            .join(format!("{:08}.{}", batch_number, BATCH_EXT)))
    }

    pub fn export_path(&self, job_id: &str, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(StorageError::InvalidPath(format!(
                "invalid export artifact name: {:?}",
                name
            )));
        }
        Ok(self.job_dir(job_id)?.join(EXPORT_DIR).join(name))
    }
}

fn io_context(err: std::io::Error, context: String) -> StorageError {
    StorageError::IoError(std::io::Error::new(err.kind(), format!("{}: {}", context, err)))
}

/// Create the parent directory and return the `.tmp` sibling of `path`.
fn prepare_temp(path: &Path) -> Result<PathBuf, StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| io_context(e, format!("Failed to create directory {:?}", parent)))?;
    }
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    Ok(PathBuf::from(temp_name))
}

fn rename_into_place(temp_path: &Path, path: &Path) -> Result<(), StorageError> {
    fs::rename(temp_path, path).map_err(|e| {
        let _ = fs::remove_file(temp_path);
        io_context(e, format!("Failed to rename temp file to {:?}", path))
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let temp_path = prepare_temp(path)?;
    fs::write(&temp_path, bytes)
        .map_err(|e| io_context(e, format!("Failed to write {:?}", temp_path)))?;
    rename_into_place(&temp_path, path)
}

/// Buffered writer over the `.tmp` sibling, renamed into place on commit.
struct FsExportWriter {
    path: PathBuf,
    temp_path: PathBuf,
    out: BufWriter<File>,
}

impl ExportWriter for FsExportWriter {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.out
            .write_all(bytes)
            .map_err(|e| io_context(e, format!("Failed to write {:?}", self.temp_path)))
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let FsExportWriter {
            path,
            temp_path,
            out,
        } = *self;
        let file = out
            .into_inner()
            .map_err(|e| io_context(e.into_error(), format!("Failed to flush {:?}", temp_path)))?;
        drop(file);
        rename_into_place(&temp_path, &path)
    }
}

impl BatchSink for FsBatchSink {
    fn write_batch(&self, batch: &Batch) -> Result<bool, StorageError> {
        let path = self.batch_path(&batch.job_id, batch.batch_number)?;
        if path.exists() {
            debug!(
                job_id = %batch.job_id,
                batch_number = batch.batch_number,
                "Batch already persisted, keeping existing contents"
            );
            return Ok(false);
        }
        let bytes =
            serde_json::to_vec(batch).map_err(|e| data_error("Failed to serialize batch", e))?;
        write_atomic(&path, &bytes)?;
        Ok(true)
    }

    fn list_batches(&self, job_id: &str) -> Result<Vec<u64>, StorageError> {
        let dir = self.job_dir(job_id)?.join(BATCH_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut numbers = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BATCH_EXT) {
                continue;
            }
            if let Some(number) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn read_batch(&self, job_id: &str, batch_number: u64) -> Result<Batch, StorageError> {
        let path = self.batch_path(job_id, batch_number)?;
        let bytes = fs::read(&path).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read batch {:?}: {}", path, e),
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| data_error("Failed to deserialize batch", e))
    }

    fn write_export(&self, job_id: &str, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.export_path(job_id, name)?;
        write_atomic(&path, bytes)
    }

    fn open_export(&self, job_id: &str, name: &str) -> Result<Box<dyn ExportWriter>, StorageError> {
        let path = self.export_path(job_id, name)?;
        let temp_path = prepare_temp(&path)?;
        let file = File::create(&temp_path)
            .map_err(|e| io_context(e, format!("Failed to create {:?}", temp_path)))?;
        Ok(Box::new(FsExportWriter {
            path,
            temp_path,
            out: BufWriter::new(file),
        }))
    }
}
