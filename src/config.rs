//! Configuration module for the chunkpress harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line interface
#[derive(Parser, Debug)]
#[command(name = "chunkpress")]
#[command(version = "0.1.0")]
#[command(about = "A coordinator/worker load harness for chunked file-write workloads", long_about = None)]
pub struct Cli {
    /// Path to TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub role: Role,
}

/// Which half of the harness to run
#[derive(Subcommand, Debug)]
pub enum Role {
    /// Accept workers, drive the run, write the final report
    Coordinator(CoordinatorArgs),
    /// Connect to a coordinator and run the file-write workload
    Worker(WorkerArgs),
    /// Run a coordinator plus three staggered workers locally
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub struct CoordinatorArgs {
    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// First worker id to hand out
    #[arg(long)]
    pub first_client_id: Option<u32>,
}

#[derive(Args, Debug, Default)]
pub struct WorkerArgs {
    /// Coordinator address to connect to
    #[arg(long)]
    pub host: Option<String>,

    /// Coordinator port to connect to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Workload duration in seconds
    #[arg(short, long)]
    pub run_time: Option<u64>,

    /// Write chunk size in MB
    #[arg(short, long)]
    pub chunk_size: Option<u64>,

    /// Output file size in MB
    #[arg(short, long)]
    pub file_size: Option<u64>,

    /// Directory for workload output files
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct DemoArgs {
    /// Port for the local coordinator
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory for the workers' output files
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator-related configuration
#[derive(Debug, Deserialize)]
pub struct CoordinatorSection {
    /// Address to listen on
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// First worker id to hand out; ids count up from here and are never reused
    #[serde(default = "default_first_client_id")]
    pub first_client_id: u32,
    /// Poll timeout bounding how long the loop waits between wakeups
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cap on concurrently connected workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            first_client_id: default_first_client_id(),
            poll_interval_ms: default_poll_interval_ms(),
            max_workers: default_max_workers(),
        }
    }
}

/// Worker-related configuration
#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    /// Coordinator address to connect to
    #[serde(default = "default_host")]
    pub host: String,
    /// Coordinator port to connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Workload duration in seconds
    #[serde(default = "default_run_time_s")]
    pub run_time_s: u64,
    /// Write chunk size in MB
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// Output file size in MB
    #[serde(default = "default_file_size_mb")]
    pub file_size_mb: u64,
    /// Smallest chunk size the workload accepts
    #[serde(default = "default_min_chunk_size_mb")]
    pub min_chunk_size_mb: u64,
    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_period_s")]
    pub heartbeat_period_s: u64,
    /// Seconds between perf samples
    #[serde(default = "default_perf_stats_period_s")]
    pub perf_stats_period_s: u64,
    /// How often the supervision loop re-checks the done flag
    #[serde(default = "default_done_check_period_ms")]
    pub done_check_period_ms: u64,
    /// Directory for workload output files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory for the feasibility probe's scratch file (output_dir if unset)
    pub scratch_dir: Option<PathBuf>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            run_time_s: default_run_time_s(),
            chunk_size_mb: default_chunk_size_mb(),
            file_size_mb: default_file_size_mb(),
            min_chunk_size_mb: default_min_chunk_size_mb(),
            heartbeat_period_s: default_heartbeat_period_s(),
            perf_stats_period_s: default_perf_stats_period_s(),
            done_check_period_ms: default_done_check_period_ms(),
            output_dir: default_output_dir(),
            scratch_dir: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1234
}

fn default_first_client_id() -> u32 {
    100
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_workers() -> usize {
    1024
}

fn default_run_time_s() -> u64 {
    15
}

fn default_chunk_size_mb() -> u64 {
    50
}

fn default_file_size_mb() -> u64 {
    100
}

fn default_min_chunk_size_mb() -> u64 {
    10
}

fn default_heartbeat_period_s() -> u64 {
    5
}

fn default_perf_stats_period_s() -> u64 {
    10
}

fn default_done_check_period_ms() -> u64 {
    500
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./worker_files")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    pub first_client_id: u32,
    pub poll_interval_ms: u64,
    pub max_workers: usize,
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Final resolved worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub run_time_s: u64,
    pub chunk_size_mb: u64,
    pub file_size_mb: u64,
    pub min_chunk_size_mb: u64,
    pub heartbeat_period_s: u64,
    pub perf_stats_period_s: u64,
    pub done_check_period_ms: u64,
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl WorkerConfig {
    pub fn run_time(&self) -> Duration {
        Duration::from_secs(self.run_time_s)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_s)
    }

    pub fn perf_stats_period(&self) -> Duration {
        Duration::from_secs(self.perf_stats_period_s)
    }

    pub fn done_check_period(&self) -> Duration {
        Duration::from_millis(self.done_check_period_ms)
    }
}

/// Final resolved configuration for both halves
#[derive(Debug, Clone)]
pub struct Config {
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut coordinator = CoordinatorConfig {
            host: toml_config.coordinator.host,
            port: toml_config.coordinator.port,
            first_client_id: toml_config.coordinator.first_client_id,
            poll_interval_ms: toml_config.coordinator.poll_interval_ms,
            max_workers: toml_config.coordinator.max_workers,
        };

        let worker_section = toml_config.worker;
        let mut worker = WorkerConfig {
            host: worker_section.host,
            port: worker_section.port,
            run_time_s: worker_section.run_time_s,
            chunk_size_mb: worker_section.chunk_size_mb,
            file_size_mb: worker_section.file_size_mb,
            min_chunk_size_mb: worker_section.min_chunk_size_mb,
            heartbeat_period_s: worker_section.heartbeat_period_s,
            perf_stats_period_s: worker_section.perf_stats_period_s,
            done_check_period_ms: worker_section.done_check_period_ms,
            scratch_dir: worker_section
                .scratch_dir
                .unwrap_or_else(|| worker_section.output_dir.clone()),
            output_dir: worker_section.output_dir,
        };

        // Merge role-specific CLI overrides
        match &cli.role {
            Role::Coordinator(args) => {
                if let Some(ref host) = args.host {
                    coordinator.host = host.clone();
                }
                if let Some(port) = args.port {
                    coordinator.port = port;
                }
                if let Some(first) = args.first_client_id {
                    coordinator.first_client_id = first;
                }
            }
            Role::Worker(args) => {
                if let Some(ref host) = args.host {
                    worker.host = host.clone();
                }
                if let Some(port) = args.port {
                    worker.port = port;
                }
                if let Some(run_time) = args.run_time {
                    worker.run_time_s = run_time;
                }
                if let Some(chunk) = args.chunk_size {
                    worker.chunk_size_mb = chunk;
                }
                if let Some(file) = args.file_size {
                    worker.file_size_mb = file;
                }
                if let Some(ref dir) = args.output_dir {
                    worker.output_dir = dir.clone();
                    worker.scratch_dir = dir.clone();
                }
            }
            Role::Demo(args) => {
                // The demo's workers dial the in-process coordinator
                if let Some(port) = args.port {
                    coordinator.port = port;
                    worker.port = port;
                }
                if let Some(ref dir) = args.output_dir {
                    worker.output_dir = dir.clone();
                    worker.scratch_dir = dir.clone();
                }
            }
        }

        Ok(Config {
            coordinator,
            worker,
            log_level: if cli.log_level != "info" {
                cli.log_level.clone()
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn worker_cli(args: WorkerArgs) -> Cli {
        Cli {
            config: None,
            log_level: "info".to_string(),
            role: Role::Worker(args),
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.coordinator.host, "127.0.0.1");
        assert_eq!(config.coordinator.port, 1234);
        assert_eq!(config.coordinator.first_client_id, 100);
        assert_eq!(config.worker.run_time_s, 15);
        assert_eq!(config.worker.chunk_size_mb, 50);
        assert_eq!(config.worker.file_size_mb, 100);
        assert_eq!(config.worker.min_chunk_size_mb, 10);
        assert_eq!(config.worker.heartbeat_period_s, 5);
        assert_eq!(config.worker.perf_stats_period_s, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [coordinator]
            host = "0.0.0.0"
            port = 4321
            first_client_id = 500
            max_workers = 8

            [worker]
            run_time_s = 30
            chunk_size_mb = 10
            file_size_mb = 50
            scratch_dir = "/tmp/scratch"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.coordinator.host, "0.0.0.0");
        assert_eq!(config.coordinator.port, 4321);
        assert_eq!(config.coordinator.first_client_id, 500);
        assert_eq!(config.coordinator.max_workers, 8);
        assert_eq!(config.worker.run_time_s, 30);
        assert_eq!(config.worker.chunk_size_mb, 10);
        assert_eq!(config.worker.file_size_mb, 50);
        assert_eq!(config.worker.scratch_dir, Some(PathBuf::from("/tmp/scratch")));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_scratch_dir_falls_back_to_output_dir() {
        let cli = worker_cli(WorkerArgs {
            output_dir: Some(PathBuf::from("/data/load")),
            ..Default::default()
        });
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.worker.output_dir, PathBuf::from("/data/load"));
        assert_eq!(config.worker.scratch_dir, PathBuf::from("/data/load"));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [worker]
            port = 9000
            run_time_s = 60
            chunk_size_mb = 20
        "#
        )
        .unwrap();

        let mut cli = worker_cli(WorkerArgs {
            run_time: Some(5),
            ..Default::default()
        });
        cli.config = Some(file.path().to_path_buf());

        let config = Config::load(&cli).unwrap();
        // CLI wins where given, file wins over defaults otherwise
        assert_eq!(config.worker.run_time_s, 5);
        assert_eq!(config.worker.port, 9000);
        assert_eq!(config.worker.chunk_size_mb, 20);
        assert_eq!(config.worker.file_size_mb, 100);
    }

    #[test]
    fn test_missing_config_file_errors() {
        let mut cli = worker_cli(WorkerArgs::default());
        cli.config = Some(PathBuf::from("/nonexistent/chunkpress.toml"));
        match Config::load(&cli) {
            Err(ConfigError::FileRead(path, _)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/chunkpress.toml"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
