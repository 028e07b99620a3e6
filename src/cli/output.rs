//! CLI output: error mapping and job formatting.

use crate::error::WorkerError;
use crate::job::Job;

/// Map worker errors to a string for CLI output.
pub fn map_error(e: &WorkerError) -> String {
    match e {
        WorkerError::StatusWrite { job_id, source } => format!(
            "Could not record status of job {} ({}); the job is retried after its lease expires",
            job_id, source
        ),
        other => other.to_string(),
    }
}

pub fn format_job_text(job: &Job) -> String {
    let mut out = format!(
        "{}  {}  records {}/{}  spend {:.4}/{:.4}  owner {}",
        job.job_id,
        job.status,
        job.records_generated,
        job.target_record_count,
        job.cost_accumulated,
        job.budget_limit,
        job.owner
    );
    if job.cancel_requested && !job.status.is_terminal() {
        out.push_str("  (cancel requested)");
    }
    if let Some(reason) = &job.failure_reason {
        out.push_str(&format!("\n  reason: {}", reason));
    }
    out
}

pub fn format_jobs_text(jobs: &[Job]) -> String {
    if jobs.is_empty() {
        return "No jobs".to_string();
    }
    jobs.iter()
        .map(format_job_text)
        .collect::<Vec<_>>()
        .join("\n")
}
