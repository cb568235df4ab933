//! Process supervision
//!
//! A [`Process`] is the caller's handle on one exec. Its lifecycle moves
//! `Launching -> Running -> Exited -> Reaped` and is published through a
//! watch channel, so any number of callers can `wait` and all of them see the
//! same exit code. The task that discovers the exit is spawned when the shim
//! starts (or when the process is attached) and runs whether or not anyone
//! ever calls `wait`.

use std::fmt;
use std::future::Future;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::dir::{PidGetter, ProcessDir};
use crate::error::{ExecError, Result};
use crate::spec::{Signal, TtySpec, WindowSize};

/// Exit code reported when the shim disappears without recording one
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Where a process is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Launching,
    Running,
    Exited(i32),
    /// Exited and the code has been handed to at least one waiter
    Reaped(i32),
}

impl Lifecycle {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Lifecycle::Exited(code) | Lifecycle::Reaped(code) => Some(*code),
            Lifecycle::Launching | Lifecycle::Running => None,
        }
    }
}

/// Lifecycle publisher shared between a handle and its exit watcher
#[derive(Debug, Clone)]
pub(crate) struct ExitState {
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    exited: CancellationToken,
}

impl ExitState {
    pub(crate) fn new(initial: Lifecycle) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            lifecycle: Arc::new(tx),
            exited: CancellationToken::new(),
        }
    }

    /// Cancelled once the exit code is known
    pub(crate) fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub(crate) fn current(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub(crate) fn mark_running(&self) {
        self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Launching {
                *state = Lifecycle::Running;
                true
            } else {
                false
            }
        });
    }

    /// Record the exit code. The first code published wins.
    pub(crate) fn publish_exit(&self, code: i32) {
        self.lifecycle.send_if_modified(|state| {
            if state.exit_code().is_none() {
                *state = Lifecycle::Exited(code);
                true
            } else {
                false
            }
        });
        self.exited.cancel();
    }

    fn mark_reaped(&self) {
        self.lifecycle.send_if_modified(|state| match *state {
            Lifecycle::Exited(code) => {
                *state = Lifecycle::Reaped(code);
                true
            }
            _ => false,
        });
    }

    async fn wait_exit(&self) -> i32 {
        let mut rx = self.lifecycle.subscribe();
        let code = match rx.wait_for(|state| state.exit_code().is_some()).await {
            Ok(state) => state.exit_code(),
            Err(_) => None,
        };
        code.unwrap_or(UNKNOWN_EXIT_CODE)
    }
}

/// Publishes the sentinel exit code if an exit watcher ends without a real one
pub(crate) struct ExitGuard {
    id: String,
    state: ExitState,
}

impl ExitGuard {
    pub(crate) fn new(id: &str, state: ExitState) -> Self {
        Self {
            id: id.to_string(),
            state,
        }
    }

    pub(crate) fn complete(self, code: i32) {
        self.state.publish_exit(code);
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.state.current().exit_code().is_none() {
            warn!(process_id = %self.id, "Exit watcher ended without an exit code");
            self.state.publish_exit(UNKNOWN_EXIT_CODE);
        }
    }
}

/// Stream relay tasks belonging to one handle
#[derive(Debug)]
pub(crate) struct StreamTasks {
    tracker: TaskTracker,
    handles: Vec<AbortHandle>,
}

impl StreamTasks {
    pub(crate) fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            handles: Vec::new(),
        }
    }

    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(task);
        self.handles.push(handle.abort_handle());
    }

    /// Stop every relay; used when a launch is unwound
    pub(crate) fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
        self.tracker.close();
    }

    pub(crate) async fn finished(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Terminal control channel to the shim
#[async_trait]
pub(crate) trait TtyControl: Send + Sync + fmt::Debug {
    async fn resize(&self, size: WindowSize) -> Result<()>;
}

/// Handle on one process running inside a container
#[derive(Debug)]
pub struct Process {
    dir: ProcessDir,
    exit: ExitState,
    streams: StreamTasks,
    control: Option<Box<dyn TtyControl>>,
    pid_getter: Arc<dyn PidGetter>,
    drain_grace: Duration,
}

impl Process {
    pub(crate) fn new(
        dir: ProcessDir,
        exit: ExitState,
        streams: StreamTasks,
        control: Option<Box<dyn TtyControl>>,
        pid_getter: Arc<dyn PidGetter>,
        drain_grace: Duration,
    ) -> Self {
        Self {
            dir,
            exit,
            streams,
            control,
            pid_getter,
            drain_grace,
        }
    }

    /// Process ID (not the OS PID)
    pub fn id(&self) -> &str {
        self.dir.id()
    }

    pub fn dir(&self) -> &ProcessDir {
        &self.dir
    }

    pub fn state(&self) -> Lifecycle {
        self.exit.current()
    }

    /// Current OS PID, read from the PID file
    pub fn pid(&self) -> Result<i32> {
        self.pid_getter.pid(&self.dir.pid_file())
    }

    /// Wait for the process to exit and return its exit code
    ///
    /// Safe to call concurrently and repeatedly; every call returns the same
    /// code. Output relays get a bounded grace period to flush before this
    /// returns.
    pub async fn wait(&self) -> Result<i32> {
        let code = self.exit.wait_exit().await;

        if timeout(self.drain_grace, self.streams.finished())
            .await
            .is_err()
        {
            warn!(process_id = %self.id(), "Output relays did not finish within grace period");
        }

        self.exit.mark_reaped();
        debug!(process_id = %self.id(), exit_code = code, "Process exited");
        Ok(code)
    }

    /// Deliver `signal` to the PID currently recorded in the PID file
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self.pid()?;
        debug!(process_id = %self.id(), pid, signal = %signal, "Signalling process");
        crate::signal::deliver(pid, signal).await
    }

    /// Forward a terminal resize to the shim
    pub async fn set_tty(&self, tty: TtySpec) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or(ExecError::NotImplemented("set_tty"))?;

        match tty.window_size {
            Some(size) => control.resize(size).await,
            None => Ok(()),
        }
    }
}

/// Reap the shim and take its recorded exit code as the process exit code.
///
/// `keepalive` is held until the shim is gone.
pub(crate) fn spawn_reaper<K>(
    mut child: Child,
    dir: ProcessDir,
    exit: ExitState,
    keepalive: K,
) -> JoinHandle<()>
where
    K: Send + 'static,
{
    tokio::spawn(async move {
        let guard = ExitGuard::new(dir.id(), exit);
        let shim_status = match child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(process_id = %dir.id(), error = %e, "Failed to wait for shim");
                None
            }
        };
        drop(keepalive);
        guard.complete(recorded_exit_code(&dir, shim_status));
    })
}

/// Poll for the exit-code file, for runtimes that offer no exit notification
pub(crate) fn spawn_exit_poller(
    dir: ProcessDir,
    exit: ExitState,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let guard = ExitGuard::new(dir.id(), exit);
        loop {
            match dir.read_exit_code() {
                Ok(Some(code)) => return guard.complete(code),
                Ok(None) => {}
                Err(e) => {
                    warn!(process_id = %dir.id(), error = %e, "Unreadable exit code");
                    return guard.complete(UNKNOWN_EXIT_CODE);
                }
            }
            sleep(interval).await;
        }
    })
}

pub(crate) fn recorded_exit_code(dir: &ProcessDir, shim_status: Option<ExitStatus>) -> i32 {
    match dir.read_exit_code() {
        Ok(Some(code)) => code,
        Ok(None) => {
            warn!(
                process_id = %dir.id(),
                shim_status = ?shim_status,
                "Shim exited without recording an exit code"
            );
            UNKNOWN_EXIT_CODE
        }
        Err(e) => {
            warn!(process_id = %dir.id(), error = %e, "Unreadable exit code");
            UNKNOWN_EXIT_CODE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::{write_atomic, PidFileReader};
    use std::sync::Mutex;

    fn process_in(dir: ProcessDir, exit: ExitState) -> Process {
        Process::new(
            dir,
            exit,
            StreamTasks::new(),
            None,
            Arc::new(PidFileReader),
            Duration::from_millis(100),
        )
    }

    #[derive(Debug, Default)]
    struct RecordingControl {
        sizes: Mutex<Vec<WindowSize>>,
    }

    #[async_trait]
    impl TtyControl for Arc<RecordingControl> {
        async fn resize(&self, size: WindowSize) -> Result<()> {
            self.sizes.lock().unwrap().push(size);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_waiters_observe_same_code() {
        let root = tempfile::tempdir().unwrap();
        let exit = ExitState::new(Lifecycle::Running);
        let process = Arc::new(process_in(ProcessDir::new(root.path(), "p"), exit.clone()));

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let process = process.clone();
                tokio::spawn(async move { process.wait().await.unwrap() })
            })
            .collect();

        exit.publish_exit(42);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 42);
        }
        assert_eq!(process.state(), Lifecycle::Reaped(42));
        assert_eq!(process.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_first_exit_code_wins() {
        let exit = ExitState::new(Lifecycle::Running);
        exit.publish_exit(3);
        exit.publish_exit(UNKNOWN_EXIT_CODE);
        assert_eq!(exit.current(), Lifecycle::Exited(3));
        assert!(exit.exited().is_cancelled());
    }

    #[tokio::test]
    async fn test_running_does_not_overwrite_exit() {
        let exit = ExitState::new(Lifecycle::Launching);
        exit.publish_exit(0);
        exit.mark_running();
        assert_eq!(exit.current(), Lifecycle::Exited(0));
    }

    #[tokio::test]
    async fn test_dropped_watcher_publishes_sentinel() {
        let exit = ExitState::new(Lifecycle::Running);
        let watcher = tokio::spawn({
            let exit = exit.clone();
            async move {
                let _guard = ExitGuard::new("p", exit);
                std::future::pending::<()>().await;
            }
        });
        watcher.abort();
        let _ = watcher.await;
        assert_eq!(exit.current(), Lifecycle::Exited(UNKNOWN_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_poller_picks_up_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let dir = ProcessDir::create(root.path(), "p").unwrap();
        let exit = ExitState::new(Lifecycle::Running);
        let process = process_in(dir.clone(), exit.clone());

        spawn_exit_poller(dir.clone(), exit, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(process.state(), Lifecycle::Running);

        write_atomic(&dir.exit_code_file(), b"7").unwrap();
        assert_eq!(process.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_signal_without_pid_file_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let dir = ProcessDir::create(root.path(), "p").unwrap();
        let process = process_in(dir, ExitState::new(Lifecycle::Running));

        let err = process.signal(Signal::Terminate).await.unwrap_err();
        assert!(matches!(err, ExecError::PidFile { .. }));
    }

    #[tokio::test]
    async fn test_set_tty_without_control_is_not_implemented() {
        let root = tempfile::tempdir().unwrap();
        let process = process_in(
            ProcessDir::new(root.path(), "p"),
            ExitState::new(Lifecycle::Running),
        );

        let err = process.set_tty(TtySpec::with_size(80, 24)).await.unwrap_err();
        assert!(matches!(err, ExecError::NotImplemented("set_tty")));
    }

    #[tokio::test]
    async fn test_set_tty_forwards_window_size() {
        let root = tempfile::tempdir().unwrap();
        let control = Arc::new(RecordingControl::default());
        let process = Process::new(
            ProcessDir::new(root.path(), "p"),
            ExitState::new(Lifecycle::Running),
            StreamTasks::new(),
            Some(Box::new(control.clone())),
            Arc::new(PidFileReader),
            Duration::from_millis(100),
        );

        process.set_tty(TtySpec::with_size(120, 40)).await.unwrap();
        process.set_tty(TtySpec::default()).await.unwrap();

        assert_eq!(
            *control.sizes.lock().unwrap(),
            vec![WindowSize {
                columns: 120,
                rows: 40
            }]
        );
    }
}
