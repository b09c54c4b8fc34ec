//! Per-worker session records.
//!
//! The coordinator owns one `Session` per connected worker. A session tracks
//! the worker's lifecycle state, workload file parameters, rollover count,
//! and running CPU/memory averages built incrementally from perf samples.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::protocol::Command;

/// Worker lifecycle state.
///
/// Transitions are monotone: `NotStarted -> Running -> Pass`, with any
/// non-terminal state moving to `Aborted` when the connection closes before
/// `done`. `Pass` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    NotStarted,
    Running,
    Pass,
    Aborted,
}

impl SessionStatus {
    /// Terminal states accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Pass | SessionStatus::Aborted)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::NotStarted => "NOT_STARTED",
            SessionStatus::Running => "RUNNING",
            SessionStatus::Pass => "PASS",
            SessionStatus::Aborted => "ABORTED",
        };
        write!(f, "{}", name)
    }
}

/// State and statistics for one worker connection.
#[derive(Debug, Clone)]
pub struct Session {
    id: u32,
    status: SessionStatus,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    chunk_size_mb: Option<u64>,
    file_size_mb: Option<u64>,
    files_written: u64,
    cpu_avg: f64,
    mem_avg: f64,
    sample_count: u64,
}

impl Session {
    pub fn new(id: u32) -> Self {
        Session {
            id,
            status: SessionStatus::NotStarted,
            started_at: None,
            ended_at: None,
            chunk_size_mb: None,
            file_size_mb: None,
            files_written: 0,
            cpu_avg: 0.0,
            mem_avg: 0.0,
            sample_count: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn files_written(&self) -> u64 {
        self.files_written
    }

    pub fn chunk_size_mb(&self) -> Option<u64> {
        self.chunk_size_mb
    }

    pub fn file_size_mb(&self) -> Option<u64> {
        self.file_size_mb
    }

    /// Mean CPU percentage over received samples, undefined until the first
    /// sample arrives.
    pub fn cpu_avg(&self) -> Option<f64> {
        (self.sample_count > 0).then_some(self.cpu_avg)
    }

    /// Mean resident-memory percentage over received samples.
    pub fn mem_avg(&self) -> Option<f64> {
        (self.sample_count > 0).then_some(self.mem_avg)
    }

    #[allow(dead_code)]
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Wall time between start and end, once both are known.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Dispatch one worker message against this session.
    ///
    /// Returns the reply to queue, if the command calls for one. Messages
    /// that do not fit the current state are logged and ignored; they never
    /// mutate the record.
    pub fn apply(&mut self, command: &Command) -> Option<Command> {
        if self.status.is_terminal() {
            warn!(id = self.id, status = %self.status, command = command.token(),
                  "message after terminal state ignored");
            return None;
        }

        match command {
            Command::GetClientId => Some(Command::SetClientId { id: self.id }),
            Command::Ready => Some(Command::RunTests),
            Command::Start => {
                self.mark_started();
                None
            }
            Command::Heartbeat => {
                debug!(id = self.id, "heartbeat");
                None
            }
            Command::PerfStats { cpu_pct, mem_pct } => {
                self.record_perf_sample(*cpu_pct, *mem_pct);
                None
            }
            Command::FileStats {
                chunk_size_mb,
                file_size_mb,
            } => {
                self.record_file_stats(*chunk_size_mb, *file_size_mb);
                None
            }
            Command::FileRollover => {
                self.record_rollover();
                None
            }
            Command::Done => {
                self.mark_passed();
                None
            }
            // Coordinator-bound sessions never expect worker-bound commands
            Command::SetClientId { .. } | Command::RunTests => {
                warn!(id = self.id, command = command.token(),
                      "worker-bound command from worker ignored");
                None
            }
        }
    }

    /// Close-out when the connection drops. A session that never sent `done`
    /// ends `Aborted`; a passed session keeps its result.
    pub fn finalize_disconnect(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SessionStatus::Aborted;
        self.ended_at = Some(Instant::now());
        warn!(id = self.id, "worker disconnected before done; session aborted");
    }

    fn mark_started(&mut self) {
        if self.status != SessionStatus::NotStarted {
            warn!(id = self.id, status = %self.status, "start ignored");
            return;
        }
        self.status = SessionStatus::Running;
        self.started_at = Some(Instant::now());
        debug!(id = self.id, "session running");
    }

    fn mark_passed(&mut self) {
        if self.status != SessionStatus::Running {
            warn!(id = self.id, status = %self.status, "done ignored");
            return;
        }
        self.status = SessionStatus::Pass;
        self.ended_at = Some(Instant::now());
        debug!(id = self.id, "session passed");
    }

    fn record_perf_sample(&mut self, cpu_pct: f64, mem_pct: f64) {
        if self.status != SessionStatus::Running {
            warn!(id = self.id, status = %self.status, "perf sample ignored");
            return;
        }
        self.sample_count += 1;
        let n = self.sample_count as f64;
        self.cpu_avg += (cpu_pct - self.cpu_avg) / n;
        self.mem_avg += (mem_pct - self.mem_avg) / n;
    }

    fn record_file_stats(&mut self, chunk_size_mb: u64, file_size_mb: u64) {
        if self.status != SessionStatus::Running {
            warn!(id = self.id, status = %self.status, "file stats ignored");
            return;
        }
        // Set once, immutable afterwards
        if self.chunk_size_mb.is_some() || self.file_size_mb.is_some() {
            warn!(id = self.id, "duplicate file stats ignored");
            return;
        }
        self.chunk_size_mb = Some(chunk_size_mb);
        self.file_size_mb = Some(file_size_mb);
    }

    fn record_rollover(&mut self) {
        if self.status != SessionStatus::Running {
            warn!(id = self.id, status = %self.status, "rollover ignored");
            return;
        }
        self.files_written += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new(100);
        assert_eq!(session.id(), 100);
        assert_eq!(session.status(), SessionStatus::NotStarted);
        assert_eq!(session.files_written(), 0);
        assert_eq!(session.cpu_avg(), None);
        assert_eq!(session.mem_avg(), None);
        assert_eq!(session.duration(), None);
    }

    #[test]
    fn test_start_transitions_to_running() {
        let mut session = Session::new(1);
        assert_eq!(session.apply(&Command::Start), None);
        assert_eq!(session.status(), SessionStatus::Running);
    }

    #[test]
    fn test_done_without_start_does_not_pass() {
        let mut session = Session::new(1);
        session.apply(&Command::Done);
        assert_eq!(session.status(), SessionStatus::NotStarted);
    }

    #[test]
    fn test_done_after_start_passes() {
        let mut session = Session::new(1);
        session.apply(&Command::Start);
        session.apply(&Command::Done);
        assert_eq!(session.status(), SessionStatus::Pass);
        assert!(session.duration().is_some());
    }

    #[test]
    fn test_get_cid_replies_with_identity() {
        let mut session = Session::new(107);
        match session.apply(&Command::GetClientId) {
            Some(Command::SetClientId { id }) => assert_eq!(id, 107),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(session.status(), SessionStatus::NotStarted);
    }

    #[test]
    fn test_ready_replies_run_tests() {
        let mut session = Session::new(1);
        assert_eq!(session.apply(&Command::Ready), Some(Command::RunTests));
        assert_eq!(session.status(), SessionStatus::NotStarted);
    }

    #[test]
    fn test_running_average_over_two_samples() {
        let mut session = Session::new(1);
        session.apply(&Command::Start);
        session.apply(&Command::PerfStats {
            cpu_pct: 30.0,
            mem_pct: 40.0,
        });
        session.apply(&Command::PerfStats {
            cpu_pct: 50.0,
            mem_pct: 60.0,
        });
        assert_eq!(session.sample_count(), 2);
        assert_eq!(session.cpu_avg(), Some(40.0));
        assert_eq!(session.mem_avg(), Some(50.0));
    }

    #[test]
    fn test_perf_sample_before_start_ignored() {
        let mut session = Session::new(1);
        session.apply(&Command::PerfStats {
            cpu_pct: 99.0,
            mem_pct: 99.0,
        });
        assert_eq!(session.sample_count(), 0);
        assert_eq!(session.cpu_avg(), None);
    }

    #[test]
    fn test_file_stats_set_once() {
        let mut session = Session::new(1);
        session.apply(&Command::Start);
        session.apply(&Command::FileStats {
            chunk_size_mb: 10,
            file_size_mb: 50,
        });
        session.apply(&Command::FileStats {
            chunk_size_mb: 99,
            file_size_mb: 999,
        });
        assert_eq!(session.chunk_size_mb(), Some(10));
        assert_eq!(session.file_size_mb(), Some(50));
    }

    #[test]
    fn test_rollover_counts_files() {
        let mut session = Session::new(1);
        session.apply(&Command::Start);
        session.apply(&Command::FileRollover);
        session.apply(&Command::FileRollover);
        assert_eq!(session.files_written(), 2);
    }

    #[test]
    fn test_rollover_before_start_ignored() {
        let mut session = Session::new(1);
        session.apply(&Command::FileRollover);
        assert_eq!(session.files_written(), 0);
    }

    #[test]
    fn test_abort_after_start_records_duration() {
        let mut session = Session::new(1);
        session.apply(&Command::Start);
        thread::sleep(Duration::from_millis(20));
        session.finalize_disconnect();
        assert_eq!(session.status(), SessionStatus::Aborted);
        let duration = match session.duration() {
            Some(d) => d,
            None => panic!("aborted session after start should have a duration"),
        };
        assert!(duration >= Duration::from_millis(20));
    }

    #[test]
    fn test_abort_before_start_has_no_duration() {
        let mut session = Session::new(1);
        session.finalize_disconnect();
        assert_eq!(session.status(), SessionStatus::Aborted);
        assert_eq!(session.duration(), None);
    }

    #[test]
    fn test_disconnect_after_pass_keeps_pass() {
        let mut session = Session::new(1);
        session.apply(&Command::Start);
        session.apply(&Command::Done);
        session.finalize_disconnect();
        assert_eq!(session.status(), SessionStatus::Pass);
    }

    #[test]
    fn test_terminal_state_frozen() {
        let mut session = Session::new(1);
        session.apply(&Command::Start);
        session.apply(&Command::FileRollover);
        session.apply(&Command::Done);

        session.apply(&Command::FileRollover);
        session.apply(&Command::PerfStats {
            cpu_pct: 10.0,
            mem_pct: 10.0,
        });
        assert_eq!(session.apply(&Command::GetClientId), None);

        assert_eq!(session.status(), SessionStatus::Pass);
        assert_eq!(session.files_written(), 1);
        assert_eq!(session.sample_count(), 0);
    }

    #[test]
    fn test_worker_bound_commands_ignored() {
        let mut session = Session::new(1);
        assert_eq!(session.apply(&Command::SetClientId { id: 9 }), None);
        assert_eq!(session.apply(&Command::RunTests), None);
        assert_eq!(session.status(), SessionStatus::NotStarted);
    }
}
