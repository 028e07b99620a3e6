//! Budget ledger client
//!
//! Appends cost observations to the ledger store and answers "how much has
//! this job spent". Spend accrued since the last ledger write is held in
//! memory so the pre-record budget check stays exact between flushes.
//!
//! Ledger reads fail open and ledger writes are best effort: accounting
//! fidelity never blocks generation.

use crate::config::PricingConfig;
use crate::store::CostLedgerStore;
use crate::types::now_millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cost of one unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub invocations: u64,
    pub amount: f64,
}

impl CostBreakdown {
    pub fn is_zero(&self) -> bool {
        self.invocations == 0 && self.input_tokens == 0 && self.output_tokens == 0 && self.amount == 0.0
    }
}

impl AddAssign for CostBreakdown {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.invocations += rhs.invocations;
        self.amount += rhs.amount;
    }
}

/// One append-only ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub job_id: String,
    pub timestamp_ms: u64,
    pub breakdown: CostBreakdown,
    pub cumulative_estimate: f64,
}

/// Estimate tokens from text length (about four characters per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

impl PricingConfig {
    /// Cost of a single inference invocation.
    pub fn invocation_cost(&self, prompt: &str, output: &str) -> CostBreakdown {
        let input_tokens = estimate_tokens(prompt);
        let output_tokens = estimate_tokens(output);
        let amount = self.per_invocation
            + input_tokens as f64 / 1000.0 * self.input_per_1k_tokens
            + output_tokens as f64 / 1000.0 * self.output_per_1k_tokens;
        CostBreakdown {
            input_tokens,
            output_tokens,
            invocations: 1,
            amount,
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Highest cumulative estimate known to be persisted.
    persisted: f64,
    /// Accrued since the last successful ledger write.
    pending: CostBreakdown,
}

pub struct BudgetLedger {
    store: Arc<dyn CostLedgerStore>,
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn CostLedgerStore>) -> Self {
        Self {
            store,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Current spend for a job: latest persisted cumulative estimate plus
    /// locally accrued spend. Falls back to the last known value if the
    /// ledger cannot be read.
    pub fn current_spend(&self, job_id: &str) -> f64 {
        match self.store.latest(job_id) {
            Ok(latest) => {
                let mut state = self.state.lock();
                if let Some(record) = latest {
                    if record.cumulative_estimate > state.persisted {
                        state.persisted = record.cumulative_estimate;
                    }
                }
                state.persisted + state.pending.amount
            }
            Err(err) => {
                let state = self.state.lock();
                warn!(
                    job_id,
                    error = %err,
                    last_known = state.persisted,
                    "Ledger read failed, using last known spend"
                );
                state.persisted + state.pending.amount
            }
        }
    }

    /// Append one row for a completed unit of work. Write failures are logged
    /// and swallowed; returns whether the row was written.
    pub fn record(&self, job_id: &str, breakdown: CostBreakdown) -> bool {
        let cumulative = {
            let state = self.state.lock();
            state.persisted + breakdown.amount
        };
        let row = CostRecord {
            job_id: job_id.to_string(),
            timestamp_ms: now_millis(),
            breakdown,
            cumulative_estimate: cumulative,
        };
        match self.store.append(job_id, &row) {
            Ok(()) => {
                let mut state = self.state.lock();
                if cumulative > state.persisted {
                    state.persisted = cumulative;
                }
                debug!(job_id, delta = breakdown.amount, cumulative, "Recorded cost");
                true
            }
            Err(err) => {
                warn!(job_id, error = %err, delta = breakdown.amount, "Failed to append cost record");
                false
            }
        }
    }

    /// Accrue spend in memory without touching the ledger.
    pub fn accrue(&self, breakdown: CostBreakdown) {
        self.state.lock().pending += breakdown;
    }

    /// Write accrued spend as one ledger row. Spend stays pending if the
    /// write fails so it is still counted by `current_spend`.
    pub fn flush_pending(&self, job_id: &str) {
        let pending = self.state.lock().pending;
        if pending.is_zero() {
            return;
        }
        if self.record(job_id, pending) {
            let mut state = self.state.lock();
            state.pending = CostBreakdown::default();
        }
    }

    /// Seed the in-memory view from the ledger when resuming a job.
    pub fn prime(&self, job_id: &str) -> f64 {
        self.current_spend(job_id)
    }
}
