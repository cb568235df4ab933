//! # corral-exec
//!
//! **Purpose**: Runs processes inside existing containers for corral
//!
//! Launches a process through a per-process shim and an external low-level
//! runtime, relays its standard streams, and observes its exit out-of-band.
//! Everything needed to re-attach lives in the process directory, so a
//! restarted daemon can wait on and signal processes it did not start.
//!
//! ## Features
//!
//! - **Launch Handshake**: One status byte tells exec success from runtime failure
//! - **Stream Relays**: stdin/stdout/stderr over named pipes, drained after exit
//! - **Shared Wait**: Any number of waiters, all seeing the same exit code
//! - **Signals**: Delivered to the PID recorded on disk at call time
//! - **Attach**: Rebuild a handle from a process ID and its directory
//! - **Two Backends**: Named pipes and signals on unix, exit-file polling elsewhere
//!
//! ## Usage
//!
//! ```rust,no_run
//! use corral_exec::{ExecConfig, ExecRunner, ProcessIo, ProcessSpec, RunRequest, Signal};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runner = ExecRunner::new(&ExecConfig::new("/usr/bin/corral-shim", "/usr/bin/runc"))?;
//!
//! let spec = ProcessSpec::new(["sh", "-c", "echo hello"]).env("PATH", "/bin:/usr/bin");
//! let request = RunRequest::new("container-1", "/run/corral/container-1/processes", spec)
//!     .with_io(ProcessIo::new().with_stdout(tokio::io::stdout()));
//!
//! let process = runner.run(request).await?;
//! let code = process.wait().await?;
//!
//! // Later, possibly from another daemon instance
//! let again = runner
//!     .attach(process.id(), "/run/corral/container-1/processes".as_ref(), ProcessIo::new())
//!     .await?;
//! assert_eq!(again.wait().await?, code);
//! # let _ = again.signal(Signal::Terminate).await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod dir;
pub mod error;
pub mod exec;
pub mod handshake;
pub mod id;
pub mod runner;
pub mod spec;
pub mod stdio;
pub mod supervisor;

#[cfg(unix)]
pub mod launcher;
#[cfg(unix)]
mod pipes;
mod signal;

pub use backend::{ExecBackend, Launch, NativeBackend, PollingBackend};
#[cfg(unix)]
pub use backend::FifoBackend;
pub use config::ExecConfig;
pub use dir::{PidFileReader, PidGetter, ProcessDir};
pub use error::{ExecError, LaunchStatus, Result};
pub use exec::{ExecRunner, RunRequest};
pub use id::{ProcessIdGenerator, UuidGenerator};
pub use runner::{CommandRunner, LoggingRunner, OsCommandRunner};
pub use spec::{ProcessSpec, Rlimit, ShimState, Signal, TtySpec, User, WindowSize};
pub use stdio::{ProcessIo, StreamKind};
pub use supervisor::{Lifecycle, Process, UNKNOWN_EXIT_CODE};
