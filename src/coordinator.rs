//! Coordinator event loop and run reporting.
//!
//! Readiness-based model: a single thread polls one listener plus every
//! worker connection, reads complete messages, and drives the per-worker
//! session state machines. Uses epoll on Linux, kqueue on macOS.

use crate::config::CoordinatorConfig;
use crate::protocol::{ParseResult, Parser};
use crate::session::Session;
use bytes::BytesMut;
use chrono::{DateTime, SecondsFormat, Utc};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;
const READ_CHUNK: usize = 4096;

/// Per-worker connection state.
struct ClientHandler {
    stream: TcpStream,
    inbound: BytesMut,
    outbound: BytesMut,
    /// Whether the stream is currently registered for WRITABLE as well.
    write_interest: bool,
    session: Session,
}

impl ClientHandler {
    fn new(stream: TcpStream, session: Session) -> Self {
        ClientHandler {
            stream,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
            write_interest: false,
            session,
        }
    }

    /// Drain complete messages from the inbound buffer through the session,
    /// queueing any replies. Malformed messages are logged and skipped; they
    /// never tear down the connection.
    fn process_inbound(&mut self) {
        loop {
            match Parser::parse(&self.inbound) {
                ParseResult::Complete(command, consumed) => {
                    let _ = self.inbound.split_to(consumed);
                    debug!(id = self.session.id(), command = command.token(), "received");
                    if let Some(reply) = self.session.apply(&command) {
                        self.outbound.extend_from_slice(&reply.encode());
                    }
                }
                ParseResult::Incomplete => break,
                ParseResult::Error(err, consumed) => {
                    let _ = self.inbound.split_to(consumed);
                    warn!(id = self.session.id(), error = %err, "malformed message ignored");
                }
            }
        }
    }
}

/// Accepts workers, assigns identities, and aggregates their telemetry
/// until the run completes.
pub struct Coordinator {
    config: CoordinatorConfig,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    handlers: Slab<ClientHandler>,
    finished: Vec<Session>,
    next_client_id: u32,
    ever_connected: bool,
}

impl Coordinator {
    /// Bind the listening socket and set up the poll registry.
    pub fn bind(config: CoordinatorConfig) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let std_listener = create_listener(addr)?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(
            addr = %local_addr,
            first_client_id = config.first_client_id,
            "coordinator listening"
        );

        let next_client_id = config.first_client_id;
        Ok(Coordinator {
            config,
            poll,
            listener,
            local_addr,
            handlers: Slab::new(),
            finished: Vec::new(),
            next_client_id,
            ever_connected: false,
        })
    }

    /// Actual bound address (differs from the configured one with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the event loop until at least one worker has connected and every
    /// connection has closed, then produce the final report.
    pub fn run(&mut self) -> io::Result<RunReport> {
        let started_at = Utc::now();
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let poll_interval = self.config.poll_interval();

        while !self.run_complete() {
            self.poll.poll(&mut events, Some(poll_interval))?;

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections()?,
                    Token(conn_id) => self.handle_connection_event(conn_id, event),
                }
            }
        }

        let mut sessions = std::mem::take(&mut self.finished);
        sessions.sort_by_key(|s| s.id());
        let report = RunReport {
            started_at,
            ended_at: Utc::now(),
            sessions,
        };
        for line in report.render().lines() {
            info!("{}", line);
        }
        Ok(report)
    }

    /// At least one worker ever connected and none remain open.
    fn run_complete(&self) -> bool {
        self.ever_connected && self.handlers.is_empty()
    }

    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.handlers.len() >= self.config.max_workers {
                        warn!(peer = %peer, "worker limit reached, dropping connection");
                        continue;
                    }

                    let id = self.next_client_id;
                    self.next_client_id += 1;
                    self.ever_connected = true;

                    let conn_id = self
                        .handlers
                        .insert(ClientHandler::new(stream, Session::new(id)));

                    // Re-borrow after insert
                    let handler = &mut self.handlers[conn_id];
                    self.poll.registry().register(
                        &mut handler.stream,
                        Token(conn_id),
                        Interest::READABLE,
                    )?;

                    info!(id, peer = %peer, "worker connected");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "accept error");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &mio::event::Event) {
        if !self.handlers.contains(conn_id) {
            return;
        }

        if event.is_readable() {
            match self.handle_readable(conn_id) {
                Ok(true) => {}
                Ok(false) => {
                    // Peer closed; any buffered messages were processed first
                    self.close_connection(conn_id, None);
                    return;
                }
                Err(e) => {
                    self.close_connection(conn_id, Some(e));
                    return;
                }
            }
        }

        if !self.handlers.contains(conn_id) {
            return;
        }

        if event.is_writable() {
            if let Err(e) = self.handle_writable(conn_id) {
                self.close_connection(conn_id, Some(e));
            }
        }
    }

    /// Drain the socket, process messages, flush replies.
    /// Returns Ok(false) when the peer has closed its end.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<bool> {
        let handler = match self.handlers.get_mut(conn_id) {
            Some(h) => h,
            None => return Ok(true),
        };

        let mut open = true;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match handler.stream.read(&mut buf) {
                Ok(0) => {
                    open = false;
                    break;
                }
                Ok(n) => handler.inbound.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        handler.process_inbound();

        if open {
            self.flush_outbound(conn_id)?;
        }
        Ok(open)
    }

    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        self.flush_outbound(conn_id)
    }

    /// Write as much queued output as the socket accepts, keeping the
    /// registered interests in sync with whether anything is left.
    fn flush_outbound(&mut self, conn_id: usize) -> io::Result<()> {
        let handler = match self.handlers.get_mut(conn_id) {
            Some(h) => h,
            None => return Ok(()),
        };

        while !handler.outbound.is_empty() {
            match handler.stream.write(&handler.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
                }
                Ok(n) => {
                    let _ = handler.outbound.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let want_write = !handler.outbound.is_empty();
        if want_write != handler.write_interest {
            handler.write_interest = want_write;
            let interests = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.poll
                .registry()
                .reregister(&mut handler.stream, Token(conn_id), interests)?;
        }
        Ok(())
    }

    /// Remove the handler, finalize its session, and archive it for the
    /// report. A session that never sent `done` ends up Aborted here.
    fn close_connection(&mut self, conn_id: usize, error: Option<io::Error>) {
        if let Some(mut handler) = self.handlers.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut handler.stream);

            if let Some(e) = error {
                warn!(id = handler.session.id(), error = %e, "connection error");
            }

            let mut session = handler.session;
            session.finalize_disconnect();
            info!(id = session.id(), status = %session.status(), "worker connection closed");
            self.finished.push(session);
        }
    }
}

/// Final accounting for one run, one entry per worker that ever connected.
#[derive(Debug)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Finished sessions, ordered by worker id.
    pub sessions: Vec<Session>,
}

impl RunReport {
    /// Render the per-session lines and the run summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("==== run report ====\n");
        for session in &self.sessions {
            out.push_str(&format!(
                "worker {}: status={} duration={} cpu_avg={} mem_avg={} files_written={} chunk_mb={} file_mb={}\n",
                session.id(),
                session.status(),
                fmt_duration(session.duration()),
                fmt_pct(session.cpu_avg()),
                fmt_pct(session.mem_avg()),
                session.files_written(),
                fmt_count(session.chunk_size_mb()),
                fmt_count(session.file_size_mb()),
            ));
        }
        out.push_str(&format!(
            "run: started={} ended={} workers={}\n",
            self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.ended_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.sessions.len(),
        ));
        out
    }

    /// Look up one session by worker id.
    #[allow(dead_code)]
    pub fn session(&self, id: u32) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id() == id)
    }
}

fn fmt_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(d) => format!("{:.2}s", d.as_secs_f64()),
        None => "-".to_string(),
    }
}

fn fmt_pct(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.1}%", v),
        None => "-".to_string(),
    }
}

fn fmt_count(value: Option<u64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

/// Create the listening socket with address reuse for quick restarts.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use std::io::{BufRead, BufReader, Write as IoWrite};
    use std::net::TcpStream as StdTcpStream;
    use std::thread;

    struct ScriptedWorker {
        stream: StdTcpStream,
        reader: BufReader<StdTcpStream>,
    }

    impl ScriptedWorker {
        fn connect(addr: SocketAddr) -> Self {
            let stream = StdTcpStream::connect(addr).unwrap();
            let reader = BufReader::new(stream.try_clone().unwrap());
            ScriptedWorker { stream, reader }
        }

        fn send(&mut self, line: &str) {
            // Single write per message: a terminator sent on its own can lag
            // the payload and only arrive in the close flush
            self.stream.write_all(format!("{}\n", line).as_bytes()).unwrap();
        }

        fn recv(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            line.trim_end().to_string()
        }
    }

    fn spawn_coordinator(
        first_client_id: u32,
    ) -> (SocketAddr, thread::JoinHandle<io::Result<RunReport>>) {
        let config = CoordinatorConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            first_client_id,
            poll_interval_ms: 10,
            max_workers: 16,
        };
        let mut coordinator = Coordinator::bind(config).unwrap();
        let addr = coordinator.local_addr();
        let handle = thread::spawn(move || coordinator.run());
        (addr, handle)
    }

    #[test]
    fn test_identity_assignment_is_monotone() {
        let (addr, handle) = spawn_coordinator(100);

        // Sequential handshakes pin the accept order
        let mut first = ScriptedWorker::connect(addr);
        first.send("get_cid");
        assert_eq!(first.recv(), "set_cid:100");

        let mut second = ScriptedWorker::connect(addr);
        second.send("get_cid");
        assert_eq!(second.recv(), "set_cid:101");

        let mut third = ScriptedWorker::connect(addr);
        third.send("get_cid");
        assert_eq!(third.recv(), "set_cid:102");

        // Disconnect out of order; ids are never reused or resorted
        drop(second);
        drop(third);
        drop(first);

        let report = handle.join().unwrap().unwrap();
        let ids: Vec<u32> = report.sessions.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![100, 101, 102]);
    }

    #[test]
    fn test_full_pass_flow() {
        let (addr, handle) = spawn_coordinator(100);

        let mut worker = ScriptedWorker::connect(addr);
        worker.send("get_cid");
        assert_eq!(worker.recv(), "set_cid:100");
        worker.send("ready");
        assert_eq!(worker.recv(), "run_tests");
        worker.send("start");
        worker.send("file_stats:10:50");
        worker.send("send_stats:30:40");
        worker.send("send_stats:50:60");
        worker.send("rollover");
        worker.send("rollover");
        worker.send("hb");
        worker.send("done");
        drop(worker);

        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.sessions.len(), 1);
        let session = report.session(100).unwrap();
        assert_eq!(session.status(), SessionStatus::Pass);
        assert_eq!(session.files_written(), 2);
        assert_eq!(session.cpu_avg(), Some(40.0));
        assert_eq!(session.mem_avg(), Some(50.0));
        assert_eq!(session.chunk_size_mb(), Some(10));
        assert_eq!(session.file_size_mb(), Some(50));
        assert!(session.duration().is_some());
    }

    #[test]
    fn test_abort_on_silent_disconnect() {
        let (addr, handle) = spawn_coordinator(200);

        let mut worker = ScriptedWorker::connect(addr);
        worker.send("get_cid");
        assert_eq!(worker.recv(), "set_cid:200");
        worker.send("ready");
        assert_eq!(worker.recv(), "run_tests");
        worker.send("start");
        thread::sleep(Duration::from_millis(40));
        drop(worker);

        let report = handle.join().unwrap().unwrap();
        let session = report.session(200).unwrap();
        assert_eq!(session.status(), SessionStatus::Aborted);
        let duration = session.duration().unwrap();
        assert!(duration >= Duration::from_millis(30));
    }

    #[test]
    fn test_malformed_messages_are_ignored() {
        let (addr, handle) = spawn_coordinator(100);

        let mut worker = ScriptedWorker::connect(addr);
        worker.send("get_cid");
        assert_eq!(worker.recv(), "set_cid:100");
        worker.send("start");
        worker.send("frobnicate");
        worker.send("send_stats:only_one_field");
        worker.send("send_stats:not:numeric");
        worker.send("done");
        drop(worker);

        let report = handle.join().unwrap().unwrap();
        let session = report.session(100).unwrap();
        // Connection survived the garbage and the sample stats stayed clean
        assert_eq!(session.status(), SessionStatus::Pass);
        assert_eq!(session.sample_count(), 0);
        assert_eq!(session.cpu_avg(), None);
    }

    #[test]
    fn test_report_renders_every_session() {
        let (addr, handle) = spawn_coordinator(100);

        let mut passed = ScriptedWorker::connect(addr);
        passed.send("get_cid");
        assert_eq!(passed.recv(), "set_cid:100");
        let mut dropped = ScriptedWorker::connect(addr);
        dropped.send("get_cid");
        assert_eq!(dropped.recv(), "set_cid:101");

        passed.send("start");
        passed.send("done");
        drop(passed);
        drop(dropped);

        let report = handle.join().unwrap().unwrap();
        let rendered = report.render();
        assert!(rendered.contains("worker 100: status=PASS"));
        assert!(rendered.contains("worker 101: status=ABORTED"));
        assert!(rendered.contains("workers=2"));
    }
}
