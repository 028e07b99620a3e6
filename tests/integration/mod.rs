//! Integration tests for the generation worker

mod support;

mod budget_enforcement;
mod checkpoint_recovery;
mod claim_race;
mod export_output;
mod job_lifecycle;
mod preemption_resume;
mod record_properties;
