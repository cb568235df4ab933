//! Platform launch strategies
//!
//! Both strategies sit behind [`ExecBackend`]. [`NativeBackend`] names the one
//! a build uses by default: named pipes and signals on unix, exit-code file
//! polling elsewhere.

use std::fmt;

use async_trait::async_trait;

use crate::dir::ProcessDir;
use crate::error::Result;
use crate::spec::{ShimState, TtySpec};
use crate::stdio::ProcessIo;
use crate::supervisor::Process;

#[cfg(unix)]
mod fifo;
mod polling;

#[cfg(unix)]
pub use fifo::FifoBackend;
pub use polling::PollingBackend;

#[cfg(unix)]
pub type NativeBackend = FifoBackend;
#[cfg(not(unix))]
pub type NativeBackend = PollingBackend;

/// Everything a backend needs to start one process in a reserved directory
#[derive(Debug)]
pub struct Launch {
    pub dir: ProcessDir,
    /// Already persisted as `process.json`
    pub state: ShimState,
    /// Container the process joins
    pub handle: String,
    /// Initial terminal size; also requests a terminal
    pub tty: Option<TtySpec>,
    pub io: ProcessIo,
}

impl Launch {
    /// Whether the process gets a terminal
    pub fn wants_tty(&self) -> bool {
        self.state.process.terminal || self.tty.is_some()
    }
}

/// Launch strategy for one platform
#[async_trait]
pub trait ExecBackend: Send + Sync + fmt::Debug {
    /// Start the process described by `launch`. Returns once the runtime has
    /// either execed the target process or failed.
    async fn start(&self, launch: Launch) -> Result<Process>;

    /// Rebuild a handle for a process started earlier, possibly by another
    /// daemon instance.
    async fn attach(&self, dir: ProcessDir, io: ProcessIo) -> Result<Process>;
}
