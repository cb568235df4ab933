//! Command runner seam
//!
//! Every OS process this crate starts goes through a [`CommandRunner`], so the
//! start path can be logged uniformly and substituted in tests.

use std::fmt;
use std::io;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Starts OS processes
pub trait CommandRunner: Send + Sync + fmt::Debug {
    fn start(&self, cmd: &mut Command) -> io::Result<Child>;
}

/// Spawns commands directly
#[derive(Debug, Default, Clone, Copy)]
pub struct OsCommandRunner;

impl CommandRunner for OsCommandRunner {
    fn start(&self, cmd: &mut Command) -> io::Result<Child> {
        cmd.spawn()
    }
}

/// Logs every command before delegating to the inner runner
#[derive(Debug, Clone)]
pub struct LoggingRunner<R> {
    inner: R,
}

impl<R: CommandRunner> LoggingRunner<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: CommandRunner> CommandRunner for LoggingRunner<R> {
    fn start(&self, cmd: &mut Command) -> io::Result<Child> {
        let std_cmd = cmd.as_std();
        let path = std_cmd.get_program().to_string_lossy().into_owned();
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        debug!(path = %path, args = ?args, "Starting command");

        match self.inner.start(cmd) {
            Ok(child) => {
                debug!(path = %path, pid = ?child.id(), "Command started");
                Ok(child)
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Command failed to start");
                Err(e)
            }
        }
    }
}
