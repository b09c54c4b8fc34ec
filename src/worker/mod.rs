//! Worker side: protocol engine, workload seam, and shared signalling.
//!
//! The engine owns the coordinator connection and drives one pluggable
//! `Workload` through the handshake, run, and shutdown phases. Everything
//! the workload and the telemetry reporters send travels through one
//! mutex-serialized `MessageLink`; run completion is one shared `StopFlag`.

pub mod telemetry;
pub mod workload;

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::protocol::{Command, ParseResult, Parser};
use workload::WorkloadError;

/// Shared run-completion flag. Raised exactly once, by whichever of
/// workload completion, the run-window watchdog, or a fatal workload error
/// gets there first; every worker loop polls it.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    /// Raise the flag. Returns true only for the call that actually
    /// performed the transition.
    pub fn set_once(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cloneable write handle for the coordinator connection. Pushes from the
/// workload and both reporters funnel through one mutex so messages never
/// interleave on the wire.
#[derive(Clone)]
pub struct MessageLink {
    stream: Arc<Mutex<TcpStream>>,
}

impl MessageLink {
    pub fn new(stream: TcpStream) -> Self {
        MessageLink {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// Send one message. Periodic callers treat failures as log-and-continue.
    pub fn push(&self, command: &Command) -> io::Result<()> {
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "message link lock poisoned"))?;
        stream.write_all(&command.encode())
    }
}

/// A pluggable workload driven by the engine between `run_tests` and `done`.
pub trait Workload: Send {
    /// Begin the workload. `link` carries progress messages to the
    /// coordinator; `stop` is the shared flag the workload must observe,
    /// and must raise when it finishes on its own.
    fn start(&mut self, link: MessageLink, stop: StopFlag) -> Result<(), WorkloadError>;

    /// Whether the workload has finished or been told to stop.
    fn is_done(&self) -> bool;

    /// Stop the workload and release its resources.
    fn stop(&mut self);
}

/// Worker failures that abort the run before or while it starts.
#[derive(Debug)]
pub enum WorkerError {
    /// Connecting to or talking with the coordinator failed
    Io(io::Error),
    /// Coordinator closed the connection during the handshake
    HandshakeEof,
    /// The workload refused to start
    Workload(WorkloadError),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Io(e) => write!(f, "Coordinator connection error: {}", e),
            WorkerError::HandshakeEof => {
                write!(f, "Coordinator closed the connection before the run began")
            }
            WorkerError::Workload(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<io::Error> for WorkerError {
    fn from(e: io::Error) -> Self {
        WorkerError::Io(e)
    }
}

impl From<WorkloadError> for WorkerError {
    fn from(e: WorkloadError) -> Self {
        WorkerError::Workload(e)
    }
}

/// Protocol engine driving one workload against the coordinator.
pub struct Worker<W: Workload> {
    config: WorkerConfig,
    workload: W,
    client_id: Option<u32>,
}

impl<W: Workload> Worker<W> {
    pub fn new(config: WorkerConfig, workload: W) -> Self {
        Worker {
            config,
            workload,
            client_id: None,
        }
    }

    /// Identity assigned during the handshake.
    #[allow(dead_code)]
    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    /// Connect, run the handshake, drive the workload to completion, and
    /// report `done` before closing the connection.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = TcpStream::connect(addr.as_str())?;
        info!(addr = %addr, "connected to coordinator");

        let reader = BufReader::new(stream.try_clone()?);
        let link = MessageLink::new(stream);

        link.push(&Command::GetClientId)?;
        self.handshake(reader, &link)?;

        let stop = StopFlag::new();
        link.push(&Command::Start)?;
        link.push(&Command::FileStats {
            chunk_size_mb: self.config.chunk_size_mb,
            file_size_mb: self.config.file_size_mb,
        })?;

        self.workload.start(link.clone(), stop.clone())?;
        let heartbeat = telemetry::spawn_heartbeat(
            link.clone(),
            stop.clone(),
            self.config.heartbeat_period(),
        )?;
        let perf_stats = telemetry::spawn_perf_stats(
            link.clone(),
            stop.clone(),
            self.config.perf_stats_period(),
        )?;

        // Supervise: wake periodically until the workload finishes or the
        // run window closes
        let deadline = Instant::now() + self.config.run_time();
        while !self.workload.is_done() && Instant::now() < deadline {
            thread::sleep(self.config.done_check_period());
        }
        if stop.set_once() {
            debug!("run window closed; stopping the workload");
        }

        self.workload.stop();
        let _ = heartbeat.join();
        let _ = perf_stats.join();

        // Best-effort: a missing done reads as Aborted on the coordinator
        if let Err(e) = link.push(&Command::Done) {
            warn!(error = %e, "done push failed");
        }
        info!(id = ?self.client_id, "worker finished");
        Ok(())
    }

    /// Blocking handshake: wait for our identity, acknowledge it, then wait
    /// for the instruction to begin. Anything unexpected is logged and
    /// skipped.
    fn handshake(
        &mut self,
        mut reader: BufReader<TcpStream>,
        link: &MessageLink,
    ) -> Result<(), WorkerError> {
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(WorkerError::HandshakeEof);
            }
            match Parser::parse(line.as_bytes()) {
                ParseResult::Complete(Command::SetClientId { id }, _) => {
                    self.client_id = Some(id);
                    info!(id, "identity assigned");
                    link.push(&Command::Ready)?;
                }
                ParseResult::Complete(Command::RunTests, _) => {
                    if self.client_id.is_none() {
                        warn!("run signal before identity assignment");
                    }
                    debug!("run signal received");
                    return Ok(());
                }
                ParseResult::Complete(other, _) => {
                    warn!(command = other.token(), "unexpected handshake message ignored");
                }
                ParseResult::Incomplete => {}
                ParseResult::Error(err, _) => {
                    warn!(error = %err, "malformed handshake message ignored");
                }
            }
        }
    }
}
