//! Shim launcher
//!
//! Starts the per-process shim. The process spec goes to the shim on stdin as
//! JSON; the launch-status and runtime-log pipes are inherited as fds 3 and 4.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{dup2, pipe2};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::dir::ProcessDir;
use crate::error::{ExecError, Result};
use crate::runner::CommandRunner;
use crate::spec::ShimState;

/// Descriptor the shim writes the launch-status byte to
pub const STATUS_FD: RawFd = 3;
/// Descriptor the runtime writes its log lines to
pub const LOG_FD: RawFd = 4;

/// Lowest descriptor the inherited write ends are parked at before the fork,
/// so placing them on 3 and 4 can never clobber one another.
const PARKED_FD_FLOOR: RawFd = 10;

/// Descriptors holding the shim's inherited slots in the daemon
static RESERVED_SLOTS: Mutex<Vec<OwnedFd>> = Mutex::new(Vec::new());

/// A started shim and the daemon ends of its synchronization pipes
#[derive(Debug)]
pub(crate) struct LaunchedShim {
    pub child: Child,
    pub status: pipe::Receiver,
    pub log: pipe::Receiver,
}

#[derive(Debug, Clone)]
pub struct ShimLauncher {
    shim_path: PathBuf,
    runtime_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ShimLauncher {
    pub fn new(
        shim_path: impl Into<PathBuf>,
        runtime_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            shim_path: shim_path.into(),
            runtime_path: runtime_path.into(),
            runner,
        }
    }

    pub fn shim_path(&self) -> &Path {
        &self.shim_path
    }

    /// `[-tty] -stdin <p> -stdout <p> -stderr <p> exec <runtime> <dir> <handle>`
    pub fn build_args(&self, dir: &ProcessDir, handle: &str, tty: bool) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(12);
        if tty {
            args.push("-tty".into());
        }
        args.push("-stdin".into());
        args.push(dir.stdin().into_os_string());
        args.push("-stdout".into());
        args.push(dir.stdout().into_os_string());
        args.push("-stderr".into());
        args.push(dir.stderr().into_os_string());
        args.push("exec".into());
        args.push(self.runtime_path.clone().into_os_string());
        args.push(dir.path().as_os_str().to_owned());
        args.push(handle.into());
        args
    }

    /// Start the shim and hand it `state`.
    ///
    /// Failing to start the shim is fatal. A shim that dies before reading
    /// its input is left for the handshake to report.
    pub(crate) async fn start(
        &self,
        state: &ShimState,
        dir: &ProcessDir,
        handle: &str,
        tty: bool,
    ) -> Result<LaunchedShim> {
        let input = serde_json::to_vec(state)?;

        reserve_inherited_slots()?;
        let (status_read, status_write) = sync_pipe()?;
        let (log_read, log_write) = sync_pipe()?;
        let status_fd = status_write.as_raw_fd();
        let log_fd = log_write.as_raw_fd();

        let mut cmd = Command::new(&self.shim_path);
        cmd.args(self.build_args(dir, handle, tty))
            .current_dir(dir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        // The exec error pipe std opens for the spawn cannot sit on 3 or 4,
        // those slots are reserved, so dup2 only replaces daemon descriptors.
        // SAFETY: dup2 is async-signal-safe and the closure allocates nothing.
        unsafe {
            cmd.pre_exec(move || {
                dup2(status_fd, STATUS_FD)?;
                dup2(log_fd, LOG_FD)?;
                Ok(())
            });
        }

        let mut child = self
            .runner
            .start(&mut cmd)
            .map_err(|source| ExecError::ShimStart {
                path: self.shim_path.clone(),
                source,
            })?;

        drop(status_write);
        drop(log_write);

        if let Some(pid) = child.id() {
            let pid = pid.to_string();
            if let Err(e) = crate::dir::write_atomic(&dir.shim_pid_file(), pid.as_bytes()) {
                warn!(process_id = %dir.id(), error = %e, "Failed to record shim PID");
            }
        }

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    warn!(process_id = %dir.id(), "Shim closed stdin before reading its input")
                }
                Err(e) => warn!(process_id = %dir.id(), error = %e, "Failed to send shim input"),
            }
        }

        debug!(process_id = %dir.id(), pid = ?child.id(), "Shim started");

        Ok(LaunchedShim {
            child,
            status: receiver(status_read)?,
            log: receiver(log_read)?,
        })
    }
}

/// Make sure descriptors up to `LOG_FD` are open in the daemon.
///
/// `open` hands out the lowest free descriptor, so every descriptor the spawn
/// itself creates lands above `LOG_FD` afterwards. Reserved descriptors are
/// `/dev/null` opened close-on-exec and are kept for the daemon's lifetime.
fn reserve_inherited_slots() -> io::Result<()> {
    let mut reserved = RESERVED_SLOTS
        .lock()
        .map_err(|_| io::Error::other("fd reservation poisoned"))?;
    loop {
        let fd = OwnedFd::from(std::fs::File::open("/dev/null")?);
        if fd.as_raw_fd() > LOG_FD {
            return Ok(());
        }
        reserved.push(fd);
    }
}

/// A close-on-exec pipe whose write end is parked at or above the fd floor
fn sync_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    let parked = fcntl(write.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(PARKED_FD_FLOOR))
        .map_err(io::Error::from)?;
    // SAFETY: F_DUPFD_CLOEXEC just returned this descriptor and nothing else owns it.
    let parked = unsafe { OwnedFd::from_raw_fd(parked) };
    Ok((read, parked))
}

fn receiver(fd: OwnedFd) -> Result<pipe::Receiver> {
    Ok(pipe::Receiver::from_owned_fd(fd)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::await_launch;
    use crate::runner::OsCommandRunner;
    use crate::spec::ProcessSpec;
    use proptest::prelude::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn launcher(shim: impl Into<PathBuf>) -> ShimLauncher {
        ShimLauncher::new(shim, "/usr/bin/runc", Arc::new(OsCommandRunner))
    }

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_args_without_tty() {
        let dir = ProcessDir::new("/run/corral/c1/processes", "p1");
        let args = launcher("/bin/shim").build_args(&dir, "c1", false);
        assert_eq!(
            args,
            [
                "-stdin",
                "/run/corral/c1/processes/p1/stdin",
                "-stdout",
                "/run/corral/c1/processes/p1/stdout",
                "-stderr",
                "/run/corral/c1/processes/p1/stderr",
                "exec",
                "/usr/bin/runc",
                "/run/corral/c1/processes/p1",
                "c1",
            ]
            .map(OsString::from)
        );
    }

    proptest! {
        #[test]
        fn prop_handle_is_last_and_tty_is_first(handle in "[a-zA-Z0-9_-]{1,32}", tty: bool) {
            let dir = ProcessDir::new("/tmp/procs", "p");
            let args = launcher("/bin/shim").build_args(&dir, &handle, tty);
            prop_assert_eq!(args.last().cloned(), Some(OsString::from(&handle)));
            prop_assert_eq!(args[0] == "-tty", tty);
            prop_assert_eq!(args.len(), if tty { 11 } else { 10 });
        }
    }

    #[test]
    fn test_inherited_slots_are_occupied() {
        reserve_inherited_slots().unwrap();
        for fd in [STATUS_FD, LOG_FD] {
            assert!(fcntl(fd, FcntlArg::F_GETFD).is_ok(), "fd {fd} is free");
        }
    }

    #[tokio::test]
    async fn test_missing_shim_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let dir = ProcessDir::create(root.path(), "p").unwrap();
        let state = ShimState::for_exec(&dir, ProcessSpec::new(["true"]), 0, 0);

        let err = launcher(root.path().join("no-such-shim"))
            .start(&state, &dir, "c1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::ShimStart { .. }));
    }

    #[tokio::test]
    async fn test_shim_receives_input_and_sync_fds() {
        let root = tempfile::tempdir().unwrap();
        let dir = ProcessDir::create(root.path(), "p").unwrap();
        let shim = root.path().join("shim");
        write_script(
            &shim,
            "cat > input.json\nprintf '{\"message\":\"hello\"}\\n' >&4\nprintf '\\000' >&3\n",
        );
        let state = ShimState::for_exec(&dir, ProcessSpec::new(["sh", "-c", "exit 0"]), 0, 0);

        let mut launched = launcher(&shim)
            .start(&state, &dir, "c1", false)
            .await
            .unwrap();
        assert!(await_launch(launched.status, launched.log, Duration::from_secs(1))
            .await
            .is_ok());
        let shim_pid = launched.child.id().unwrap() as i32;
        assert!(launched.child.wait().await.unwrap().success());
        assert_eq!(dir.read_shim_pid().unwrap(), Some(shim_pid));

        let input = std::fs::read(dir.path().join("input.json")).unwrap();
        let received: ShimState = serde_json::from_slice(&input).unwrap();
        assert_eq!(received, state);
    }
}
