//! Error types for process execution

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::stdio::StreamKind;
use crate::spec::Signal;

/// How the low-level runtime reported a failed exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStatus {
    /// A non-zero status byte, or the runtime's own exit code
    Code(i32),
    /// The status descriptor closed before any byte was written
    Eof,
}

impl fmt::Display for LaunchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchStatus::Code(code) => write!(f, "exit status {}", code),
            LaunchStatus::Eof => write!(f, "exited without reporting a status"),
        }
    }
}

fn with_message(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {}", m))
        .unwrap_or_default()
}

/// Process execution errors
#[derive(Debug, Error)]
pub enum ExecError {
    /// Another process in the same container already owns this ID
    #[error("process ID '{id}' already in use")]
    ProcessIdInUse { id: String },

    /// The ID cannot be used as a directory name
    #[error("invalid process ID '{id}'")]
    InvalidProcessId { id: String },

    /// The shim binary could not be started at all
    #[error("failed to start shim {}: {source}", path.display())]
    ShimStart {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The low-level runtime failed before execing the target process
    #[error("runtime exec: {status}{}", with_message(.message))]
    LaunchFailed {
        status: LaunchStatus,
        message: Option<String>,
    },

    /// The shim misbehaved after it was started
    #[error("supervision failed: {0}")]
    Supervision(String),

    /// The PID file could not be read
    #[error("failed to read pid file {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The PID file does not hold a usable PID
    #[error("pid file {} contains invalid pid {contents:?}", path.display())]
    InvalidPid { path: PathBuf, contents: String },

    /// The exit-code file does not hold an integer
    #[error("exit code file {} contains invalid exit code {contents:?}", path.display())]
    InvalidExitCode { path: PathBuf, contents: String },

    /// The process named by the PID file no longer exists
    #[error("process {pid} no longer exists")]
    ProcessGone { pid: i32 },

    /// Signal delivery failed for another reason
    #[error("failed to send {signal} to process {pid}: {reason}")]
    SignalFailed {
        pid: i32,
        signal: Signal,
        reason: String,
    },

    /// No process directory exists for this ID
    #[error("process '{id}' not found")]
    ProcessNotFound { id: String },

    /// An output stream of this process is already relayed by a live handle
    #[error("{stream} of process '{id}' is already attached")]
    StreamAlreadyAttached { id: String, stream: StreamKind },

    /// A named pipe could not be created
    #[error("failed to create pipe {}: {source}", path.display())]
    PipeCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A named pipe could not be opened
    #[error("failed to open pipe {}: {source}", path.display())]
    PipeOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A named pipe did not become available in time
    #[error("timed out after {waited_ms}ms opening pipe {}", path.display())]
    PipeOpenTimeout { path: PathBuf, waited_ms: u64 },

    /// The operation is not available with the selected backend
    #[error("{0} is not implemented on this platform")]
    NotImplemented(&'static str),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for ExecError {
    fn from(err: config::ConfigError) -> Self {
        ExecError::Config(err.to_string())
    }
}

/// Result type for process execution
pub type Result<T> = std::result::Result<T, ExecError>;
