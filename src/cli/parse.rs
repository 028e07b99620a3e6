//! CLI parse: clap types for genworker. Definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// genworker - resumable generation worker
#[derive(Parser, Debug)]
#[command(name = "genworker")]
#[command(about = "Claims generation jobs, runs them under budget, checkpoints and exports results")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Working directory that relative storage paths resolve against
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file (layered over defaults and the workspace file)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Shorthand for --log-level debug
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Requeue lapsed claims, claim a job and run it
    Run {
        /// Keep claiming jobs until the queue is empty or shutdown is requested
        #[arg(long)]
        until_idle: bool,
    },
    /// Submit a job described by a JSON file
    Enqueue {
        /// Path to the job request JSON
        file: PathBuf,
    },
    /// Show one job, or all jobs
    Status {
        job_id: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Re-run the export of a completed job
    Export { job_id: String },
    /// Return running jobs with lapsed leases to the queue
    RequeueExpired,
    /// Request cancellation of a job
    Cancel { job_id: String },
}
