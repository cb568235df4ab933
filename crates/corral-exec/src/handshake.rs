//! Launch handshake
//!
//! The shim reports the runtime's verdict as a single byte on an inherited
//! descriptor: `0` once the target process has been execed, anything else (or
//! EOF) if the runtime gave up first. Runtime diagnostics arrive on a second
//! descriptor as newline-delimited JSON records.

use serde::Deserialize;

#[cfg(unix)]
pub(crate) use self::descriptors::{await_launch, spawn_log_forwarder, RuntimeLog};

/// Log target for lines forwarded from the low-level runtime
pub const RUNTIME_LOG_TARGET: &str = "corral_exec::runtime";

/// One structured record from the runtime log descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default, alias = "msg")]
    pub message: Option<String>,
}

/// Parse a runtime log line. Anything that is not a JSON object is dropped.
pub fn parse_log_line(line: &str) -> Option<LogEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Last message among a batch of runtime log lines
pub fn last_message<'a>(lines: impl IntoIterator<Item = &'a str>) -> Option<String> {
    lines
        .into_iter()
        .filter_map(parse_log_line)
        .filter_map(|entry| entry.message)
        .last()
}

#[cfg(unix)]
mod descriptors {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
    use tokio::net::unix::pipe;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, trace, warn};

    use super::{parse_log_line, LogEntry, RUNTIME_LOG_TARGET};
    use crate::error::{ExecError, LaunchStatus, Result};

    /// Runtime log descriptor of a successfully launched process
    #[derive(Debug)]
    pub(crate) struct RuntimeLog {
        lines: Lines<BufReader<pipe::Receiver>>,
    }

    impl RuntimeLog {
        fn new(log: pipe::Receiver) -> Self {
            Self {
                lines: BufReader::new(log).lines(),
            }
        }

        async fn next_entry(&mut self) -> Option<LogEntry> {
            loop {
                match self.lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(entry) = parse_log_line(&line) {
                            return Some(entry);
                        }
                        trace!(line = %line, "Dropping unparsable runtime log line");
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        debug!(error = %e, "Runtime log read failed");
                        return None;
                    }
                }
            }
        }

        /// Read to EOF and keep the last message, giving up after `grace`
        async fn last_message(mut self, grace: Duration) -> Option<String> {
            let mut last = None;
            let drain = async {
                while let Some(entry) = self.next_entry().await {
                    if entry.message.is_some() {
                        last = entry.message;
                    }
                }
            };
            if timeout(grace, drain).await.is_err() {
                warn!("Runtime log did not close within grace period");
            }
            last
        }
    }

    /// Block on the status byte.
    ///
    /// On success the log descriptor is handed back for background forwarding.
    /// On failure it is drained to build the error.
    pub(crate) async fn await_launch(
        mut status: pipe::Receiver,
        log: pipe::Receiver,
        grace: Duration,
    ) -> Result<RuntimeLog> {
        let mut byte = [0u8; 1];
        let launch_status = loop {
            match status.read(&mut byte).await {
                Ok(0) => break LaunchStatus::Eof,
                Ok(_) if byte[0] == 0 => return Ok(RuntimeLog::new(log)),
                Ok(_) => break LaunchStatus::Code(i32::from(byte[0])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ExecError::Supervision(format!(
                        "reading launch status: {}",
                        e
                    )))
                }
            }
        };

        let message = RuntimeLog::new(log).last_message(grace).await;
        debug!(status = %launch_status, message = ?message, "Runtime failed before exec");
        Err(ExecError::LaunchFailed {
            status: launch_status,
            message,
        })
    }

    /// Forward runtime log lines at debug level for the life of the process.
    /// After exit the forwarder gets `grace` to reach EOF and is then abandoned.
    pub(crate) fn spawn_log_forwarder(
        id: String,
        mut log: RuntimeLog,
        exited: CancellationToken,
        grace: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    entry = log.next_entry() => match entry {
                        Some(entry) => emit(&id, &entry),
                        None => return,
                    },
                    _ = exited.cancelled() => break,
                }
            }

            let tail = async {
                while let Some(entry) = log.next_entry().await {
                    emit(&id, &entry);
                }
            };
            if timeout(grace, tail).await.is_err() {
                trace!(process_id = %id, "Abandoning runtime log forwarder");
            }
        })
    }

    fn emit(id: &str, entry: &LogEntry) {
        if let Some(message) = &entry.message {
            debug!(
                target: RUNTIME_LOG_TARGET,
                process_id = %id,
                level = entry.level.as_deref().unwrap_or("info"),
                "{}",
                message
            );
        }
    }
}
