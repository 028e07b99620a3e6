//! genworker: resumable generation worker
//!
//! Claims queued generation jobs, runs multi-step templates against an
//! inference service under a hard spending cap, checkpoints progress so that
//! preemption loses no work, and exports the accumulated records.

pub mod batch;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod generation;
pub mod inference;
pub mod job;
pub mod ledger;
pub mod logging;
pub mod preemption;
pub mod queue;
pub mod seeds;
pub mod store;
pub mod template;
pub mod types;
pub mod worker;
