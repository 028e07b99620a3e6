//! Generation engine: per-record step execution and the resumable loop.

pub mod engine;
pub mod run;

pub use engine::{GenerationEngine, RecordInput};
pub use run::{GenerationLoop, LoopExit, LoopOutcome, LoopSettings};
