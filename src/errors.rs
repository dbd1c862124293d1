//! Error mapping guide:
//! - Map io::ErrorKind::NotFound and SlashError::NotFound to exit code 127.
//! - Map SlashError::Interrupted to 130 (128 + SIGINT); all others to 1.
//! - Library code returns SlashError and never exits; only the binary maps to exit codes.
use std::fmt;
use std::io;
use std::ops::Range;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, SlashError>;

#[derive(Debug)]
pub enum SlashError {
    Io(io::Error),
    Json(serde_json::Error),
    Yaml(serde_yaml::Error),
    Http(reqwest::Error),
    /// No port in the range could be claimed before the deadline.
    PortTimeout {
        range: Range<u16>,
        waited: Duration,
    },
    /// The proxy process never became operational (or died) during launch.
    LaunchFailed(String),
    /// The caller was interrupted (SIGINT/SIGTERM) while a launch was in flight.
    Interrupted,
    /// A terminated process did not disappear within the bounded wait.
    StopTimeout {
        pid: u32,
        waited: Duration,
    },
    NotFound(String),
    Message(String),
}

impl fmt::Display for SlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlashError::Io(e) => write!(f, "{e}"),
            SlashError::Json(e) => write!(f, "invalid JSON descriptor: {e}"),
            SlashError::Yaml(e) => write!(f, "invalid YAML: {e}"),
            SlashError::Http(e) => write!(f, "http request failed: {e}"),
            SlashError::PortTimeout { range, waited } => write!(
                f,
                "no free port available in {}..{} after {}",
                range.start,
                range.end,
                humantime::format_duration(*waited)
            ),
            SlashError::LaunchFailed(msg) => write!(f, "service establish failed: {msg}"),
            SlashError::Interrupted => write!(f, "interrupted"),
            SlashError::StopTimeout { pid, waited } => write!(
                f,
                "service shutdown failed: pid {pid} still alive after {}",
                humantime::format_duration(*waited)
            ),
            SlashError::NotFound(what) => write!(f, "{what} not found"),
            SlashError::Message(s) => write!(f, "{s}"),
        }
    }
}

impl std::error::Error for SlashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SlashError::Io(e) => Some(e),
            SlashError::Json(e) => Some(e),
            SlashError::Yaml(e) => Some(e),
            SlashError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SlashError {
    fn from(e: io::Error) -> Self {
        SlashError::Io(e)
    }
}

impl From<serde_json::Error> for SlashError {
    fn from(e: serde_json::Error) -> Self {
        SlashError::Json(e)
    }
}

impl From<serde_yaml::Error> for SlashError {
    fn from(e: serde_yaml::Error) -> Self {
        SlashError::Yaml(e)
    }
}

impl From<reqwest::Error> for SlashError {
    fn from(e: reqwest::Error) -> Self {
        SlashError::Http(e)
    }
}

impl From<tempfile::PersistError> for SlashError {
    fn from(e: tempfile::PersistError) -> Self {
        SlashError::Io(e.error)
    }
}

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Convert SlashError to exit code (parity with io::Error mapping).
pub fn exit_code_for_error(e: &SlashError) -> u8 {
    match e {
        SlashError::Io(ioe) => exit_code_for_io_error(ioe),
        SlashError::NotFound(_) => 127,
        SlashError::Interrupted => 130,
        _ => 1,
    }
}
