//! Named-pipe backend
//!
//! Launch order matters. The exit fifo's read side and the daemon side of the
//! stream and control fifos are opened before the shim starts, so none of the
//! shim's opens can block. The shim is reaped whatever the handshake says.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ExecBackend, Launch};
use crate::config::ExecConfig;
use crate::dir::{PidFileReader, PidGetter, ProcessDir};
use crate::error::Result;
use crate::handshake::{await_launch, spawn_log_forwarder};
use crate::launcher::{LaunchedShim, ShimLauncher};
use crate::pipes::{self, FifoControl, PipeTiming, StreamClaims, StreamMode};
use crate::runner::{CommandRunner, LoggingRunner, OsCommandRunner};
use crate::stdio::ProcessIo;
use crate::supervisor::{spawn_reaper, ExitState, Lifecycle, Process, TtyControl};

#[derive(Debug, Clone)]
pub struct FifoBackend {
    launcher: ShimLauncher,
    claims: StreamClaims,
    pid_getter: Arc<dyn PidGetter>,
    timing: PipeTiming,
    drain_grace: Duration,
    poll_interval: Duration,
}

impl FifoBackend {
    pub fn new(config: &ExecConfig) -> Self {
        Self::with_runner(config, Arc::new(LoggingRunner::new(OsCommandRunner)))
    }

    pub fn with_runner(config: &ExecConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            launcher: ShimLauncher::new(&config.shim_path, &config.runtime_path, runner),
            claims: StreamClaims::default(),
            pid_getter: Arc::new(PidFileReader),
            timing: PipeTiming {
                timeout: config.pipe_open_timeout(),
                backoff: config.pipe_open_backoff(),
            },
            drain_grace: config.drain_grace(),
            poll_interval: config.exit_poll_interval(),
        }
    }

    pub fn with_pid_getter(mut self, pid_getter: Arc<dyn PidGetter>) -> Self {
        self.pid_getter = pid_getter;
        self
    }

    fn handle(
        &self,
        dir: ProcessDir,
        exit: ExitState,
        streams: crate::supervisor::StreamTasks,
        control: Option<Box<dyn TtyControl>>,
    ) -> Process {
        Process::new(
            dir,
            exit,
            streams,
            control,
            self.pid_getter.clone(),
            self.drain_grace,
        )
    }

    async fn launch(&self, launch: Launch) -> Result<Process> {
        let wants_tty = launch.wants_tty();
        let Launch {
            dir,
            state,
            handle,
            tty,
            io,
        } = launch;

        pipes::create_fifos(&dir)?;
        let exit_reader = pipes::open_exit_reader(&dir, self.timing).await?;
        let control = FifoControl::open(&dir, self.timing).await?;

        let exit = ExitState::new(Lifecycle::Launching);
        let launched = CancellationToken::new();
        let streams = pipes::open_streams(
            &dir,
            io,
            StreamMode::Launch {
                launched: launched.clone(),
            },
            exit.exited(),
            &self.claims,
            self.timing,
        )
        .await?;

        let LaunchedShim { child, status, log } =
            match self.launcher.start(&state, &dir, &handle, wants_tty).await {
                Ok(shim) => shim,
                Err(e) => {
                    streams.abort();
                    return Err(e);
                }
            };

        spawn_reaper(child, dir.clone(), exit.clone(), exit_reader);

        let runtime_log = match await_launch(status, log, self.drain_grace).await {
            Ok(runtime_log) => runtime_log,
            Err(e) => {
                streams.abort();
                return Err(e);
            }
        };

        launched.cancel();
        exit.mark_running();
        spawn_log_forwarder(
            dir.id().to_string(),
            runtime_log,
            exit.exited(),
            self.drain_grace,
        );

        let process = self.handle(dir, exit, streams, Some(Box::new(control)));
        if let Some(tty) = tty {
            if let Err(e) = process.set_tty(tty).await {
                warn!(process_id = %process.id(), error = %e, "Failed to set initial window size");
            }
        }
        Ok(process)
    }
}

#[async_trait]
impl ExecBackend for FifoBackend {
    async fn start(&self, launch: Launch) -> Result<Process> {
        let dir = launch.dir.clone();
        self.launch(launch).await.map_err(|e| {
            if let Err(record) = dir.record_abandoned_launch() {
                warn!(process_id = %dir.id(), error = %record, "Failed to record launch failure");
            }
            e
        })
    }

    async fn attach(&self, dir: ProcessDir, io: ProcessIo) -> Result<Process> {
        let exit = ExitState::new(Lifecycle::Running);
        let recorded = dir.read_exit_code()?;
        if let Some(code) = recorded {
            exit.publish_exit(code);
        }

        let control = match FifoControl::open(&dir, self.timing).await {
            Ok(control) => Some(Box::new(control) as Box<dyn TtyControl>),
            Err(e) => {
                debug!(process_id = %dir.id(), error = %e, "No control channel");
                None
            }
        };

        let streams = pipes::open_streams(
            &dir,
            io,
            StreamMode::Attach,
            exit.exited(),
            &self.claims,
            self.timing,
        )
        .await?;

        if recorded.is_none() {
            pipes::spawn_exit_fifo_watcher(dir.clone(), exit.clone(), self.poll_interval);
        }
        Ok(self.handle(dir, exit, streams, control))
    }
}
