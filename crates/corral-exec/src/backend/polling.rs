//! Exit-code polling backend
//!
//! For runtimes that detach on their own and offer no exit notification. The
//! runtime is run to completion as a launcher, and the exit code is discovered
//! by polling the `exitcode` file it leaves behind. There is no stdio relay
//! and no control channel.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecBackend, Launch};
use crate::config::ExecConfig;
use crate::dir::{PidFileReader, PidGetter, ProcessDir};
use crate::error::{ExecError, LaunchStatus, Result};
use crate::handshake::last_message;
use crate::runner::{CommandRunner, LoggingRunner, OsCommandRunner};
use crate::stdio::ProcessIo;
use crate::supervisor::{spawn_exit_poller, ExitState, Lifecycle, Process, StreamTasks};

#[derive(Debug, Clone)]
pub struct PollingBackend {
    runtime_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    pid_getter: Arc<dyn PidGetter>,
    poll_interval: Duration,
    drain_grace: Duration,
}

impl PollingBackend {
    pub fn new(config: &ExecConfig) -> Self {
        Self::with_runner(config, Arc::new(LoggingRunner::new(OsCommandRunner)))
    }

    pub fn with_runner(config: &ExecConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runtime_path: config.runtime_path.clone(),
            runner,
            pid_getter: Arc::new(PidFileReader),
            poll_interval: config.exit_poll_interval(),
            drain_grace: config.drain_grace(),
        }
    }

    pub fn with_pid_getter(mut self, pid_getter: Arc<dyn PidGetter>) -> Self {
        self.pid_getter = pid_getter;
        self
    }

    /// `-debug -log <dir>/runtime.log exec -p <dir>/process.json -d -pid-file <dir>/pidfile <handle>`
    pub fn build_args(dir: &ProcessDir, handle: &str) -> Vec<OsString> {
        vec![
            "-debug".into(),
            "-log".into(),
            dir.runtime_log().into_os_string(),
            "exec".into(),
            "-p".into(),
            dir.state_file().into_os_string(),
            "-d".into(),
            "-pid-file".into(),
            dir.pid_file().into_os_string(),
            handle.into(),
        ]
    }

    async fn runtime_failure(&self, dir: &ProcessDir, code: Option<i32>) -> ExecError {
        let message = match tokio::fs::read_to_string(dir.runtime_log()).await {
            Ok(log) => last_message(log.lines()),
            Err(e) => {
                debug!(process_id = %dir.id(), error = %e, "No runtime log");
                None
            }
        };
        let status = match code {
            Some(code) => LaunchStatus::Code(code),
            None => LaunchStatus::Eof,
        };
        ExecError::LaunchFailed { status, message }
    }
}

#[async_trait]
impl ExecBackend for PollingBackend {
    async fn start(&self, launch: Launch) -> Result<Process> {
        if launch.wants_tty() {
            warn!(
                process_id = %launch.dir.id(),
                "Terminal requested but not supported by this backend"
            );
        }
        let Launch {
            dir, handle, io, ..
        } = launch;
        if !io.is_empty() {
            warn!(process_id = %dir.id(), "Standard streams are not relayed by this backend");
        }

        let mut cmd = Command::new(&self.runtime_path);
        cmd.args(Self::build_args(&dir, &handle))
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = self
            .runner
            .start(&mut cmd)
            .map_err(|source| ExecError::ShimStart {
                path: self.runtime_path.clone(),
                source,
            })?;

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::Supervision(format!("waiting for runtime: {}", e)))?;
        if !status.success() {
            return Err(self.runtime_failure(&dir, status.code()).await);
        }

        let exit = ExitState::new(Lifecycle::Running);
        spawn_exit_poller(dir.clone(), exit.clone(), self.poll_interval);
        Ok(Process::new(
            dir,
            exit,
            StreamTasks::new(),
            None,
            self.pid_getter.clone(),
            self.drain_grace,
        ))
    }

    async fn attach(&self, _dir: ProcessDir, _io: ProcessIo) -> Result<Process> {
        Err(ExecError::NotImplemented("attach"))
    }
}
