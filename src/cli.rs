//! CLI domain: argument parsing, command routing and output formatting.

mod output;
mod parse;
mod route;

pub use output::{format_job_text, format_jobs_text, map_error};
pub use parse::{Cli, Commands};
pub use route::{CommandOutput, RunContext, EXIT_IDLE};
