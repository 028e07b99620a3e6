//! Sled-backed append-only cost ledger.

use crate::error::{data_error, sled_io, StorageError};
use crate::ledger::CostRecord;
use crate::store::CostLedgerStore;
use sled::{Db, Tree};

const TREE_LEDGER: &str = "cost_ledger";
const SEQ_PAD: usize = 20;

#[derive(Clone)]
pub struct SledLedgerStore {
    db: Db,
    ledger: Tree,
}

impl SledLedgerStore {
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        let ledger = db
            .open_tree(TREE_LEDGER)
            .map_err(|e| sled_io("Failed to open ledger tree", e))?;
        Ok(Self {
            db: db.clone(),
            ledger,
        })
    }
}

// Job ids reject control characters, NUL included, so one job's prefix
// never matches another's.
fn job_prefix(job_id: &str) -> Vec<u8> {
    let mut prefix = job_id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn encode_key(job_id: &str, seq: u64) -> Vec<u8> {
    let mut key = job_prefix(job_id);
    key.extend_from_slice(format!("{seq:0SEQ_PAD$}").as_bytes());
    key
}

impl CostLedgerStore for SledLedgerStore {
    fn append(&self, job_id: &str, record: &CostRecord) -> Result<(), StorageError> {
        let seq = self
            .db
            .generate_id()
            .map_err(|e| sled_io("Failed to allocate ledger sequence", e))?;
        let value =
            serde_json::to_vec(record).map_err(|e| data_error("Failed to serialize cost record", e))?;
        self.ledger
            .insert(encode_key(job_id, seq), value)
            .map_err(|e| sled_io("Failed to append cost record", e))?;
        Ok(())
    }

    fn latest(&self, job_id: &str) -> Result<Option<CostRecord>, StorageError> {
        let Some(item) = self.ledger.scan_prefix(job_prefix(job_id)).next_back() else {
            return Ok(None);
        };
        let (_, value) = item.map_err(|e| sled_io("Failed to read cost record", e))?;
        let record = serde_json::from_slice(&value)
            .map_err(|e| data_error("Failed to deserialize cost record", e))?;
        Ok(Some(record))
    }

    fn list(&self, job_id: &str) -> Result<Vec<CostRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.ledger.scan_prefix(job_prefix(job_id)) {
            let (_, value) = item.map_err(|e| sled_io("Failed to scan cost ledger", e))?;
            out.push(
                serde_json::from_slice(&value)
                    .map_err(|e| data_error("Failed to deserialize cost record", e))?,
            );
        }
        Ok(out)
    }
}
