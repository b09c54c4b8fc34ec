//! Coordinator/worker text protocol parser and encoder.
//!
//! Messages are UTF-8 lines: fields joined by `:` and terminated by `\n`.
//! Field 0 is the command token:
//! - Identity: get_cid, set_cid
//! - Lifecycle: ready, run_tests, start, done
//! - Telemetry: hb, send_stats, file_stats, rollover

use bytes::BytesMut;
use std::str;

/// Field separator within a message.
pub const DELIMITER: char = ':';

/// Message terminator.
pub const TERMINATOR: u8 = b'\n';

/// Parsed protocol command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Worker requests an identity (worker -> coordinator).
    GetClientId,

    /// Coordinator assigns an identity (coordinator -> worker).
    SetClientId { id: u32 },

    /// Worker acknowledges its identity (worker -> coordinator).
    Ready,

    /// Coordinator instructs the worker to begin (coordinator -> worker).
    RunTests,

    /// Worker is starting its workload (worker -> coordinator).
    Start,

    /// Workload file parameters, sent once (worker -> coordinator).
    FileStats { chunk_size_mb: u64, file_size_mb: u64 },

    /// Liveness ping (worker -> coordinator).
    Heartbeat,

    /// One CPU/memory sample, in percent (worker -> coordinator).
    PerfStats { cpu_pct: f64, mem_pct: f64 },

    /// One output file completed (worker -> coordinator).
    FileRollover,

    /// Workload finished cleanly (worker -> coordinator).
    Done,
}

/// Protocol parsing errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Message is not valid UTF-8
    InvalidUtf8,
    /// Message contained no command token
    EmptyMessage,
    /// Command token not in the protocol table
    UnknownCommand(String),
    /// Known command with the wrong number of fields
    WrongFieldCount {
        command: &'static str,
        expected: usize,
        got: usize,
    },
    /// Numeric field failed to parse
    InvalidNumber(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidUtf8 => write!(f, "Invalid UTF-8 in message"),
            ParseError::EmptyMessage => write!(f, "Empty message"),
            ParseError::UnknownCommand(cmd) => write!(f, "Unknown command: {}", cmd),
            ParseError::WrongFieldCount {
                command,
                expected,
                got,
            } => write!(
                f,
                "{} expects {} field(s), got {}",
                command, expected, got
            ),
            ParseError::InvalidNumber(field) => write!(f, "Invalid number: {}", field),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of parsing one message from a buffer.
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed command with bytes consumed.
    Complete(Command, usize),
    /// No terminator yet; leave the bytes buffered.
    Incomplete,
    /// Malformed message with bytes to discard. The line is consumed so
    /// the connection can continue past it.
    Error(ParseError, usize),
}

/// Parser for the coordinator/worker line protocol.
pub struct Parser;

impl Parser {
    /// Parse one message from the buffer.
    pub fn parse(buffer: &[u8]) -> ParseResult {
        let line_end = match find_terminator(buffer) {
            Some(pos) => pos,
            None => return ParseResult::Incomplete,
        };
        let consumed = line_end + 1; // include \n

        let line = match str::from_utf8(&buffer[..line_end]) {
            Ok(s) => s,
            Err(_) => return ParseResult::Error(ParseError::InvalidUtf8, consumed),
        };
        // Tolerate \r\n from line-buffered peers
        let line = line.strip_suffix('\r').unwrap_or(line);

        let parts: Vec<&str> = line.split(DELIMITER).collect();
        let token = parts[0];
        if token.is_empty() {
            return ParseResult::Error(ParseError::EmptyMessage, consumed);
        }

        let fields = &parts[1..];
        let result = match token {
            "get_cid" => Self::no_fields("get_cid", fields, Command::GetClientId),
            "set_cid" => Self::parse_set_cid(fields),
            "ready" => Self::no_fields("ready", fields, Command::Ready),
            "run_tests" => Self::no_fields("run_tests", fields, Command::RunTests),
            "start" => Self::no_fields("start", fields, Command::Start),
            "file_stats" => Self::parse_file_stats(fields),
            "hb" => Self::no_fields("hb", fields, Command::Heartbeat),
            "send_stats" => Self::parse_perf_stats(fields),
            "rollover" => Self::no_fields("rollover", fields, Command::FileRollover),
            "done" => Self::no_fields("done", fields, Command::Done),
            _ => Err(ParseError::UnknownCommand(token.to_string())),
        };

        match result {
            Ok(command) => ParseResult::Complete(command, consumed),
            Err(err) => ParseResult::Error(err, consumed),
        }
    }

    /// Validate a zero-field command.
    fn no_fields(
        command: &'static str,
        fields: &[&str],
        parsed: Command,
    ) -> Result<Command, ParseError> {
        if !fields.is_empty() {
            return Err(ParseError::WrongFieldCount {
                command,
                expected: 0,
                got: fields.len(),
            });
        }
        Ok(parsed)
    }

    /// Parse set_cid: one identity field.
    fn parse_set_cid(fields: &[&str]) -> Result<Command, ParseError> {
        if fields.len() != 1 {
            return Err(ParseError::WrongFieldCount {
                command: "set_cid",
                expected: 1,
                got: fields.len(),
            });
        }
        let id = Self::parse_u32(fields[0])?;
        Ok(Command::SetClientId { id })
    }

    /// Parse file_stats: chunk size and file size, both in MB.
    fn parse_file_stats(fields: &[&str]) -> Result<Command, ParseError> {
        if fields.len() != 2 {
            return Err(ParseError::WrongFieldCount {
                command: "file_stats",
                expected: 2,
                got: fields.len(),
            });
        }
        let chunk_size_mb = Self::parse_u64(fields[0])?;
        let file_size_mb = Self::parse_u64(fields[1])?;
        Ok(Command::FileStats {
            chunk_size_mb,
            file_size_mb,
        })
    }

    /// Parse send_stats: CPU and memory percentages.
    fn parse_perf_stats(fields: &[&str]) -> Result<Command, ParseError> {
        if fields.len() != 2 {
            return Err(ParseError::WrongFieldCount {
                command: "send_stats",
                expected: 2,
                got: fields.len(),
            });
        }
        let cpu_pct = Self::parse_f64(fields[0])?;
        let mem_pct = Self::parse_f64(fields[1])?;
        Ok(Command::PerfStats { cpu_pct, mem_pct })
    }

    fn parse_u32(field: &str) -> Result<u32, ParseError> {
        field
            .parse::<u32>()
            .map_err(|_| ParseError::InvalidNumber(field.to_string()))
    }

    fn parse_u64(field: &str) -> Result<u64, ParseError> {
        field
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidNumber(field.to_string()))
    }

    fn parse_f64(field: &str) -> Result<f64, ParseError> {
        field
            .parse::<f64>()
            .map_err(|_| ParseError::InvalidNumber(field.to_string()))
    }
}

impl Command {
    /// The command's wire token.
    pub fn token(&self) -> &'static str {
        match self {
            Command::GetClientId => "get_cid",
            Command::SetClientId { .. } => "set_cid",
            Command::Ready => "ready",
            Command::RunTests => "run_tests",
            Command::Start => "start",
            Command::FileStats { .. } => "file_stats",
            Command::Heartbeat => "hb",
            Command::PerfStats { .. } => "send_stats",
            Command::FileRollover => "rollover",
            Command::Done => "done",
        }
    }

    /// Encode the command as one terminated wire message.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::new();
        match self {
            Command::SetClientId { id } => {
                out.extend_from_slice(format!("set_cid:{}", id).as_bytes());
            }
            Command::FileStats {
                chunk_size_mb,
                file_size_mb,
            } => {
                out.extend_from_slice(
                    format!("file_stats:{}:{}", chunk_size_mb, file_size_mb).as_bytes(),
                );
            }
            Command::PerfStats { cpu_pct, mem_pct } => {
                out.extend_from_slice(format!("send_stats:{}:{}", cpu_pct, mem_pct).as_bytes());
            }
            _ => out.extend_from_slice(self.token().as_bytes()),
        }
        out.extend_from_slice(&[TERMINATOR]);
        out
    }
}

/// Find the terminator in the buffer, returning its position.
fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == TERMINATOR)
}
