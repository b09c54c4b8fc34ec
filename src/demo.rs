//! Demonstration run: one in-process coordinator plus three staggered
//! worker child processes with mixed workload shapes.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::process::{Child, Command as ProcessCommand};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;

/// Per demo worker: start delay, run time (both seconds), chunk and file
/// sizes in MB.
const DEMO_WORKERS: [(u64, u64, u64, u64); 3] =
    [(2, 20, 10, 100), (4, 12, 15, 80), (6, 15, 25, 50)];

/// Run the coordinator on a background thread, launch the demo workers as
/// child processes of this binary, and wait for the whole run to finish.
pub fn run(config: &Config, config_path: Option<&Path>) -> io::Result<()> {
    let mut coordinator = Coordinator::bind(config.coordinator.clone())?;
    let addr = coordinator.local_addr();
    let coordinator_thread = thread::Builder::new()
        .name("coordinator".to_string())
        .spawn(move || coordinator.run())?;

    let exe = std::env::current_exe()?;
    let (children, spawn_error) = launch_workers(&exe, config, config_path, addr, &DEMO_WORKERS);

    // Reap everything that launched, even when a later spawn failed
    for mut child in children {
        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(pid = child.id(), status = %status, "demo worker exited nonzero"),
            Err(e) => error!(pid = child.id(), error = %e, "failed to reap demo worker"),
        }
    }

    if let Some(e) = spawn_error {
        // Not joined: the coordinator may still be waiting on a worker that
        // never launched
        return Err(e);
    }

    match coordinator_thread.join() {
        Ok(Ok(_report)) => {
            info!("demo complete");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::Other,
            "coordinator thread panicked",
        )),
    }
}

/// Launch one worker child per schedule entry, pacing the starts by each
/// entry's delay. A failed spawn stops the schedule; the children already
/// running are returned alongside the error so the caller can reap them.
fn launch_workers(
    exe: &Path,
    config: &Config,
    config_path: Option<&Path>,
    addr: SocketAddr,
    schedule: &[(u64, u64, u64, u64)],
) -> (Vec<Child>, Option<io::Error>) {
    let mut children = Vec::new();
    let mut launched_at = 0u64;

    for (index, &(delay_s, run_time_s, chunk_mb, file_mb)) in schedule.iter().enumerate() {
        thread::sleep(Duration::from_secs(delay_s.saturating_sub(launched_at)));
        launched_at = delay_s;

        let mut command = ProcessCommand::new(exe);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        command
            .arg("--log-level")
            .arg(&config.log_level)
            .arg("worker")
            .arg("--host")
            .arg(addr.ip().to_string())
            .arg("--port")
            .arg(addr.port().to_string())
            .arg("--run-time")
            .arg(run_time_s.to_string())
            .arg("--chunk-size")
            .arg(chunk_mb.to_string())
            .arg("--file-size")
            .arg(file_mb.to_string())
            .arg("--output-dir")
            .arg(&config.worker.output_dir);

        match command.spawn() {
            Ok(child) => {
                info!(
                    worker = index + 1,
                    pid = child.id(),
                    run_time_s,
                    chunk_mb,
                    file_mb,
                    "demo worker launched"
                );
                children.push(child);
            }
            Err(e) => {
                error!(worker = index + 1, error = %e, "failed to launch demo worker");
                return (children, Some(e));
            }
        }
    }

    (children, None)
}
