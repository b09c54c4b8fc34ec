//! chunkpress: a coordinator/worker load harness
//!
//! One binary, three roles:
//! - coordinator: accepts workers, assigns identities, aggregates their
//!   telemetry, and writes the final run report
//! - worker: connects to a coordinator and drives a chunked file-write
//!   workload while reporting heartbeats and perf samples
//! - demo: a local coordinator plus three staggered workers

mod config;
mod coordinator;
mod demo;
mod protocol;
mod session;
mod worker;

use clap::Parser;
use config::{Cli, Config, Role};
use coordinator::Coordinator;
use tracing::info;
use tracing_subscriber::EnvFilter;
use worker::workload::{FileWriter, WorkloadConfig};
use worker::Worker;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.role {
        Role::Coordinator(_) => run_coordinator(config),
        Role::Worker(_) => run_worker(config),
        Role::Demo(_) => run_demo(config, cli.config.as_deref()),
    }
}

/// Accept workers and aggregate the run.
fn run_coordinator(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.coordinator.host,
        port = config.coordinator.port,
        first_client_id = config.coordinator.first_client_id,
        "Starting chunkpress coordinator"
    );
    let mut coordinator = Coordinator::bind(config.coordinator)?;
    coordinator.run()?;
    Ok(())
}

/// Validate and run the file-write workload against a coordinator.
fn run_worker(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.worker.host,
        port = config.worker.port,
        run_time_s = config.worker.run_time_s,
        chunk_size_mb = config.worker.chunk_size_mb,
        file_size_mb = config.worker.file_size_mb,
        "Starting chunkpress worker"
    );

    let workload_config = WorkloadConfig::from_worker(&config.worker)?;
    let writer = FileWriter::new(
        workload_config,
        &config.worker.output_dir,
        &config.worker.scratch_dir,
    )?;
    let mut worker = Worker::new(config.worker, writer);
    worker.run()?;
    Ok(())
}

/// Local coordinator plus three staggered demo workers.
fn run_demo(
    config: Config,
    config_path: Option<&std::path::Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(port = config.coordinator.port, "Starting chunkpress demo");
    demo::run(&config, config_path)?;
    Ok(())
}
