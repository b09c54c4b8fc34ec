//! Periodic telemetry reporters: heartbeats and process perf samples.
//!
//! Both loops share the worker's message link and stop flag. A raised flag
//! is observed within one period; sampling trouble degrades to log lines
//! and never stops a reporter.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use super::{MessageLink, StopFlag};
use crate::protocol::Command;

/// One CPU/memory reading, both as percentages.
#[derive(Debug, Clone, Copy)]
pub struct PerfSample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

/// Sampling errors. All of them are recoverable: the reporter skips the
/// sample and keeps its schedule.
#[derive(Debug)]
pub enum SampleError {
    /// No process-stats source on this platform
    Unsupported,
    /// Reading a stats source failed
    Io(io::Error),
    /// A stats source did not have the expected shape
    Malformed(&'static str),
}

impl std::fmt::Display for SampleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleError::Unsupported => write!(f, "Perf sampling unsupported on this platform"),
            SampleError::Io(e) => write!(f, "Perf sample read failed: {}", e),
            SampleError::Malformed(source) => write!(f, "Unexpected format in {}", source),
        }
    }
}

impl std::error::Error for SampleError {}

impl From<io::Error> for SampleError {
    fn from(e: io::Error) -> Self {
        SampleError::Io(e)
    }
}

/// Spawn the heartbeat loop: one `hb` per period until the flag is raised.
pub fn spawn_heartbeat(
    link: MessageLink,
    stop: StopFlag,
    period: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("heartbeat".to_string())
        .spawn(move || {
            loop {
                thread::sleep(period);
                if stop.is_set() {
                    break;
                }
                if let Err(e) = link.push(&Command::Heartbeat) {
                    warn!(error = %e, "heartbeat push failed");
                }
            }
            debug!("heartbeat reporter exiting");
        })
}

/// Spawn the perf-stats loop: sample this process and push `send_stats`
/// once per period until the flag is raised.
pub fn spawn_perf_stats(
    link: MessageLink,
    stop: StopFlag,
    period: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("perf-stats".to_string())
        .spawn(move || {
            let mut sampler = match ProcSampler::new() {
                Ok(sampler) => Some(sampler),
                Err(e) => {
                    warn!(error = %e, "perf sampling unavailable; reporting skipped");
                    None
                }
            };
            loop {
                thread::sleep(period);
                if stop.is_set() {
                    break;
                }
                match sampler.as_mut() {
                    Some(sampler) => match sampler.sample() {
                        Ok(sample) => {
                            let message = Command::PerfStats {
                                cpu_pct: sample.cpu_pct,
                                mem_pct: sample.mem_pct,
                            };
                            if let Err(e) = link.push(&message) {
                                warn!(error = %e, "perf stats push failed");
                            }
                        }
                        Err(e) => debug!(error = %e, "perf sample skipped"),
                    },
                    None => debug!("perf sample skipped: no sampler"),
                }
            }
            debug!("perf stats reporter exiting");
        })
}

/// Process sampler over /proc: CPU ticks from `/proc/self/stat`, resident
/// pages from `/proc/self/statm`, scaled against MemTotal.
#[cfg(target_os = "linux")]
pub struct ProcSampler {
    clock_ticks_per_sec: f64,
    page_size: f64,
    mem_total_bytes: f64,
    last_cpu_ticks: f64,
    last_sample_at: std::time::Instant,
}

#[cfg(target_os = "linux")]
impl ProcSampler {
    /// Prime the sampler with a first CPU reading; each `sample` reports the
    /// delta since the previous call.
    pub fn new() -> Result<Self, SampleError> {
        let clock_ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if clock_ticks_per_sec <= 0 {
            return Err(SampleError::Malformed("sysconf(_SC_CLK_TCK)"));
        }
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return Err(SampleError::Malformed("sysconf(_SC_PAGESIZE)"));
        }

        Ok(ProcSampler {
            clock_ticks_per_sec: clock_ticks_per_sec as f64,
            page_size: page_size as f64,
            mem_total_bytes: read_mem_total()?,
            last_cpu_ticks: read_cpu_ticks()?,
            last_sample_at: std::time::Instant::now(),
        })
    }

    /// CPU share of one core over the interval since the previous sample,
    /// plus resident memory as a share of MemTotal.
    pub fn sample(&mut self) -> Result<PerfSample, SampleError> {
        let now = std::time::Instant::now();
        let ticks = read_cpu_ticks()?;
        let wall_secs = now.duration_since(self.last_sample_at).as_secs_f64();
        let cpu_pct = if wall_secs > 0.0 {
            ((ticks - self.last_cpu_ticks) / self.clock_ticks_per_sec) / wall_secs * 100.0
        } else {
            0.0
        };
        self.last_cpu_ticks = ticks;
        self.last_sample_at = now;

        let mem_pct = read_resident_pages()? * self.page_size / self.mem_total_bytes * 100.0;
        Ok(PerfSample {
            cpu_pct: cpu_pct.max(0.0),
            mem_pct,
        })
    }
}

/// utime+stime from /proc/self/stat, in clock ticks. Fields are counted
/// from after the parenthesized comm, which may itself contain spaces.
#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Result<f64, SampleError> {
    let stat = std::fs::read_to_string("/proc/self/stat")?;
    let after_comm = stat
        .rfind(')')
        .ok_or(SampleError::Malformed("/proc/self/stat"))?;
    let fields: Vec<&str> = stat[after_comm + 1..].split_whitespace().collect();
    // State is field 0 here; utime and stime land at 11 and 12
    let utime: f64 = fields
        .get(11)
        .and_then(|v| v.parse().ok())
        .ok_or(SampleError::Malformed("/proc/self/stat"))?;
    let stime: f64 = fields
        .get(12)
        .and_then(|v| v.parse().ok())
        .ok_or(SampleError::Malformed("/proc/self/stat"))?;
    Ok(utime + stime)
}

/// Resident set size in pages: second field of /proc/self/statm.
#[cfg(target_os = "linux")]
fn read_resident_pages() -> Result<f64, SampleError> {
    let statm = std::fs::read_to_string("/proc/self/statm")?;
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .ok_or(SampleError::Malformed("/proc/self/statm"))
}

/// MemTotal from /proc/meminfo, converted to bytes.
#[cfg(target_os = "linux")]
fn read_mem_total() -> Result<f64, SampleError> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: f64 = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or(SampleError::Malformed("/proc/meminfo"))?;
            return Ok(kb * 1024.0);
        }
    }
    Err(SampleError::Malformed("/proc/meminfo"))
}

#[cfg(not(target_os = "linux"))]
pub struct ProcSampler;

#[cfg(not(target_os = "linux"))]
impl ProcSampler {
    pub fn new() -> Result<Self, SampleError> {
        Err(SampleError::Unsupported)
    }

    pub fn sample(&mut self) -> Result<PerfSample, SampleError> {
        Err(SampleError::Unsupported)
    }
}
