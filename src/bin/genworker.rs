//! genworker CLI Binary
//!
//! Launches a single worker process: claims a job, runs it and exits.

use clap::Parser;
use genworker::cli::{Cli, RunContext};
use genworker::config::ConfigLoader;
use genworker::logging::{init_logging, LoggingConfig};
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            process::exit(1);
        }
    };

    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{:#}", e);
            1
        }
    };
    process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    info!("genworker starting");

    let context = match RunContext::new(cli.workspace.clone(), cli.config.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Error initializing worker: {}", e);
            anyhow::bail!(genworker::cli::map_error(&e));
        }
    };

    match context.execute(&cli.command).await {
        Ok(output) => {
            info!(exit_code = output.exit_code, "Command completed");
            if !output.text.is_empty() {
                println!("{}", output.text);
            }
            Ok(output.exit_code)
        }
        Err(e) => {
            error!("Command failed: {}", e);
            anyhow::bail!(genworker::cli::map_error(&e));
        }
    }
}

/// Logging configuration from the config layers, then CLI flags on top.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = ConfigLoader::load(&cli.workspace, cli.config.as_deref())
        .map(|c| c.logging)
        .unwrap_or_default();

    if cli.verbose {
        config.level = "debug".to_string();
    }
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.file = file.clone();
    }
    if config.file.is_relative() {
        config.file = cli.workspace.join(&config.file);
    }

    config
}
