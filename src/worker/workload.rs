//! Chunked file-write workload and its rollover feasibility pre-check.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{MessageLink, StopFlag, Workload};
use crate::config::WorkerConfig;
use crate::protocol::Command;

const MB: u64 = 1024 * 1024;

/// Workload parameters with the derived per-file chunk layout.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub run_time: Duration,
    pub chunk_size_mb: u64,
    pub file_size_mb: u64,
    /// Full chunks per output file.
    pub chunks_per_file: u64,
    /// Short final write per file when the chunk size does not divide the
    /// file size.
    pub remainder_mb: u64,
}

impl WorkloadConfig {
    /// Validate sizes and derive the chunk layout. Rejections here are
    /// fatal: the worker refuses to start rather than run a degenerate
    /// workload.
    pub fn new(
        run_time: Duration,
        chunk_size_mb: u64,
        file_size_mb: u64,
        min_chunk_size_mb: u64,
    ) -> Result<Self, WorkloadError> {
        if chunk_size_mb == 0 || chunk_size_mb < min_chunk_size_mb {
            return Err(WorkloadError::ChunkBelowMinimum {
                chunk_size_mb,
                min_chunk_size_mb,
            });
        }
        if chunk_size_mb > file_size_mb {
            return Err(WorkloadError::ChunkExceedsFile {
                chunk_size_mb,
                file_size_mb,
            });
        }
        Ok(WorkloadConfig {
            run_time,
            chunk_size_mb,
            file_size_mb,
            chunks_per_file: file_size_mb / chunk_size_mb,
            remainder_mb: file_size_mb % chunk_size_mb,
        })
    }

    pub fn from_worker(config: &WorkerConfig) -> Result<Self, WorkloadError> {
        Self::new(
            config.run_time(),
            config.chunk_size_mb,
            config.file_size_mb,
            config.min_chunk_size_mb,
        )
    }

    fn chunk_bytes(&self) -> usize {
        (self.chunk_size_mb * MB) as usize
    }

    fn remainder_bytes(&self) -> usize {
        (self.remainder_mb * MB) as usize
    }
}

/// Workload failures. Configuration and feasibility rejections surface
/// before any network activity; I/O failures after that stop the run.
#[derive(Debug)]
pub enum WorkloadError {
    /// Chunk size under the configured floor
    ChunkBelowMinimum {
        chunk_size_mb: u64,
        min_chunk_size_mb: u64,
    },
    /// Chunks cannot be larger than the file they compose
    ChunkExceedsFile {
        chunk_size_mb: u64,
        file_size_mb: u64,
    },
    /// Writing one file is projected to take too long for the run window
    RolloverInfeasible {
        file_roll_time: Duration,
        run_time: Duration,
    },
    /// Probe or workload I/O failure
    Io(io::Error),
}

impl std::fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadError::ChunkBelowMinimum {
                chunk_size_mb,
                min_chunk_size_mb,
            } => write!(
                f,
                "Chunk size {}MB is below the minimum of {}MB",
                chunk_size_mb, min_chunk_size_mb
            ),
            WorkloadError::ChunkExceedsFile {
                chunk_size_mb,
                file_size_mb,
            } => write!(
                f,
                "Chunk size {}MB exceeds file size {}MB",
                chunk_size_mb, file_size_mb
            ),
            WorkloadError::RolloverInfeasible {
                file_roll_time,
                run_time,
            } => write!(
                f,
                "Projected file roll time {:.2}s cannot complete twice within the {:.2}s run",
                file_roll_time.as_secs_f64(),
                run_time.as_secs_f64()
            ),
            WorkloadError::Io(e) => write!(f, "Workload I/O error: {}", e),
        }
    }
}

impl std::error::Error for WorkloadError {}

impl From<io::Error> for WorkloadError {
    fn from(e: io::Error) -> Self {
        WorkloadError::Io(e)
    }
}

/// Timing seam for the feasibility probe.
pub trait WriteTimer {
    /// Write `len` bytes somewhere representative of the output device and
    /// return the elapsed wall time.
    fn time_write(&mut self, len: usize) -> io::Result<Duration>;
}

/// Probe that appends zero-filled writes to a throwaway file in the
/// scratch directory. The file is removed when the probe is dropped,
/// whether the check passed or not.
pub struct ScratchTimer {
    path: PathBuf,
    file: File,
}

impl ScratchTimer {
    pub fn create(scratch_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(scratch_dir)?;
        let path = scratch_dir.join(format!("feasibility_{}.scratch", std::process::id()));
        let file = File::create(&path)?;
        Ok(ScratchTimer { path, file })
    }
}

impl WriteTimer for ScratchTimer {
    fn time_write(&mut self, len: usize) -> io::Result<Duration> {
        let payload = vec![0u8; len];
        let started = Instant::now();
        self.file.write_all(&payload)?;
        Ok(started.elapsed())
    }
}

impl Drop for ScratchTimer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove scratch file");
        }
    }
}

/// Project the time to write one full output file and require two complete
/// rollovers to fit in the run window: `file_roll_time * 2 < run_time`.
pub fn check_rollover_feasibility(
    config: &WorkloadConfig,
    timer: &mut dyn WriteTimer,
) -> Result<(), WorkloadError> {
    let chunk_time = timer.time_write(config.chunk_bytes())?;
    let remainder_time = if config.remainder_mb > 0 {
        timer.time_write(config.remainder_bytes())?
    } else {
        Duration::ZERO
    };

    let file_roll_time = chunk_time.mul_f64(config.chunks_per_file as f64) + remainder_time;
    if file_roll_time * 2 >= config.run_time {
        return Err(WorkloadError::RolloverInfeasible {
            file_roll_time,
            run_time: config.run_time,
        });
    }
    debug!(
        file_roll_time_ms = file_roll_time.as_millis() as u64,
        "rollover feasibility ok"
    );
    Ok(())
}

/// File-write workload: rolls numbered output files until the run window
/// closes or the stop flag is raised, reporting one `rollover` per file.
pub struct FileWriter {
    config: WorkloadConfig,
    output_dir: PathBuf,
    stop: Option<StopFlag>,
    handle: Option<JoinHandle<()>>,
}

impl FileWriter {
    /// Run the scratch-file feasibility probe and prepare the workload.
    /// Happens before any network activity; a failed probe is fatal.
    pub fn new(
        config: WorkloadConfig,
        output_dir: &Path,
        scratch_dir: &Path,
    ) -> Result<Self, WorkloadError> {
        let mut timer = ScratchTimer::create(scratch_dir)?;
        check_rollover_feasibility(&config, &mut timer)?;
        fs::create_dir_all(output_dir)?;
        Ok(FileWriter {
            config,
            output_dir: output_dir.to_path_buf(),
            stop: None,
            handle: None,
        })
    }
}

impl Workload for FileWriter {
    fn start(&mut self, link: MessageLink, stop: StopFlag) -> Result<(), WorkloadError> {
        let config = self.config.clone();
        let output_dir = self.output_dir.clone();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("file-writer".to_string())
            .spawn(move || write_files(config, output_dir, link, flag))
            .map_err(WorkloadError::Io)?;
        self.stop = Some(stop);
        self.handle = Some(handle);
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.stop.as_ref().map(|s| s.is_set()).unwrap_or(false)
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            if stop.set_once() {
                debug!("file writer stopped externally");
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Writer loop: one numbered file per iteration, one rollover push per
/// completed file. Whatever ends the loop sets the shared flag.
fn write_files(config: WorkloadConfig, output_dir: PathBuf, link: MessageLink, stop: StopFlag) {
    let chunk = vec![0u8; config.chunk_bytes()];
    let started = Instant::now();
    let mut files_written = 0u64;
    let prefix = std::process::id();

    while !stop.is_set() && started.elapsed() < config.run_time {
        let path = output_dir.join(format!("load_{}_{:04}.dat", prefix, files_written));
        match write_one_file(&path, &chunk, &config, &stop) {
            Ok(true) => {
                files_written += 1;
                if let Err(e) = link.push(&Command::FileRollover) {
                    warn!(error = %e, "rollover push failed");
                }
            }
            // Stop raised mid-file; the partial file stays but is not counted
            Ok(false) => break,
            Err(e) => {
                error!(path = %path.display(), error = %e, "workload write failed");
                break;
            }
        }
    }

    if stop.set_once() {
        debug!(files = files_written, "file writer set the done flag");
    }
    info!(files = files_written, "file writer exiting");
}

/// Write the full chunks plus the remainder, checking the stop flag between
/// chunks. Ok(false) means the stop flag interrupted the file.
fn write_one_file(
    path: &Path,
    chunk: &[u8],
    config: &WorkloadConfig,
    stop: &StopFlag,
) -> io::Result<bool> {
    let mut file = File::create(path)?;
    for _ in 0..config.chunks_per_file {
        if stop.is_set() {
            return Ok(false);
        }
        file.write_all(chunk)?;
    }
    if config.remainder_mb > 0 {
        if stop.is_set() {
            return Ok(false);
        }
        file.write_all(&chunk[..config.remainder_bytes()])?;
    }
    Ok(true)
}
