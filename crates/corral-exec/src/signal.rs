//! Platform signal delivery

use crate::error::{ExecError, Result};
use crate::spec::Signal;

#[cfg(unix)]
impl From<Signal> for nix::sys::signal::Signal {
    fn from(signal: Signal) -> Self {
        use nix::sys::signal::Signal as Nix;

        match signal {
            Signal::Terminate => Nix::SIGTERM,
            Signal::Kill => Nix::SIGKILL,
            Signal::Interrupt => Nix::SIGINT,
            Signal::Quit => Nix::SIGQUIT,
            Signal::Hangup => Nix::SIGHUP,
            Signal::User1 => Nix::SIGUSR1,
            Signal::User2 => Nix::SIGUSR2,
        }
    }
}

/// Send `signal` to `pid`.
///
/// A missing process is reported as [`ExecError::ProcessGone`]; the caller
/// decides whether that matters.
#[cfg(unix)]
pub(crate) async fn deliver(pid: i32, signal: Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), nix::sys::signal::Signal::from(signal)) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ExecError::ProcessGone { pid }),
        Err(errno) => Err(ExecError::SignalFailed {
            pid,
            signal,
            reason: errno.desc().to_string(),
        }),
    }
}

/// Whether `pid` still names a process, zombies included
#[cfg(unix)]
pub(crate) fn is_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Windows has no signals; termination goes through `taskkill`.
#[cfg(windows)]
pub(crate) async fn deliver(pid: i32, signal: Signal) -> Result<()> {
    use std::process::Stdio;
    use tokio::process::Command;

    let force = match signal {
        Signal::Kill => true,
        Signal::Terminate => false,
        _ => return Err(ExecError::NotImplemented("signal")),
    };

    let mut cmd = Command::new("taskkill");
    cmd.args(["/pid", &pid.to_string()]);
    if force {
        cmd.arg("/f");
    }

    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ExecError::SignalFailed {
            pid,
            signal,
            reason: format!("taskkill exited with {:?}", output.status.code()),
        })
    }
}
