//! Sled-backed versioned blob store.
//!
//! Values are stored as an 8-byte big-endian version followed by the payload.
//! Conditional puts are a compare-and-swap against the exact stored bytes.

use crate::error::{sled_io, StorageError};
use crate::store::{BlobStore, BlobVersion, PutOutcome, VersionedBlob};
use sled::{Db, IVec, Tree};

const TREE_BLOBS: &str = "blobs";
const VERSION_LEN: usize = 8;

#[derive(Clone)]
pub struct SledBlobStore {
    blobs: Tree,
}

impl SledBlobStore {
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        let blobs = db
            .open_tree(TREE_BLOBS)
            .map_err(|e| sled_io("Failed to open blob tree", e))?;
        Ok(Self { blobs })
    }
}

impl BlobStore for SledBlobStore {
    fn get(&self, key: &str) -> Result<Option<VersionedBlob>, StorageError> {
        let raw = self
            .blobs
            .get(key.as_bytes())
            .map_err(|e| sled_io("Failed to read blob", e))?;
        Ok(raw.map(|raw| decode(&raw)))
    }

    fn put(
        &self,
        key: &str,
        bytes: &[u8],
        expected: Option<BlobVersion>,
    ) -> Result<PutOutcome, StorageError> {
        let current: Option<IVec> = self
            .blobs
            .get(key.as_bytes())
            .map_err(|e| sled_io("Failed to read blob", e))?;

        match (expected, &current) {
            (None, None) => {}
            (Some(expected), Some(raw)) if decode_version(raw) == expected => {}
            _ => return Ok(PutOutcome::VersionConflict),
        }

        let next = BlobVersion(expected.map(|v| v.0 + 1).unwrap_or(1));
        let swapped = self
            .blobs
            .compare_and_swap(key.as_bytes(), current.as_ref(), Some(encode(next, bytes)))
            .map_err(|e| sled_io("Failed to write blob", e))?;

        match swapped {
            Ok(()) => Ok(PutOutcome::Written(next)),
            Err(_) => Ok(PutOutcome::VersionConflict),
        }
    }
}

fn encode(version: BlobVersion, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(VERSION_LEN + bytes.len());
    out.extend_from_slice(&version.0.to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

// A value too short to carry a header is treated as version 0 so it can
// still be replaced through the conditional path.
fn decode_version(raw: &[u8]) -> BlobVersion {
    if raw.len() < VERSION_LEN {
        return BlobVersion(0);
    }
    let mut header = [0u8; VERSION_LEN];
    header.copy_from_slice(&raw[..VERSION_LEN]);
    BlobVersion(u64::from_be_bytes(header))
}

fn decode(raw: &[u8]) -> VersionedBlob {
    if raw.len() < VERSION_LEN {
        return VersionedBlob {
            bytes: raw.to_vec(),
            version: BlobVersion(0),
        };
    }
    VersionedBlob {
        bytes: raw[VERSION_LEN..].to_vec(),
        version: decode_version(raw),
    }
}
