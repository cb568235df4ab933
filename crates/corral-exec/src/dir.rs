//! On-disk process directory
//!
//! Every exec owns `<processes root>/<process id>/`. The directory is created
//! exactly once; its existence is what makes a process attachable.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ExecError, Result};
use crate::spec::ShimState;

pub const STDIN: &str = "stdin";
pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";
pub const EXIT_FIFO: &str = "exit";
pub const CONTROL_FIFO: &str = "control";
pub const PID_FILE: &str = "pidfile";
pub const SHIM_PID_FILE: &str = "shim.pid";
pub const EXIT_CODE_FILE: &str = "exitcode";
pub const STATE_FILE: &str = "process.json";
pub const RUNTIME_LOG: &str = "runtime.log";

/// Layout of one process directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDir {
    id: String,
    path: PathBuf,
}

impl ProcessDir {
    /// Describe the directory for `id` without touching the filesystem
    pub fn new(root: impl AsRef<Path>, id: impl Into<String>) -> Self {
        let id = id.into();
        let path = root.as_ref().join(&id);
        Self { id, path }
    }

    /// Reserve the directory for `id`. Fails if another process already owns it.
    pub fn create(root: &Path, id: &str) -> Result<Self> {
        if !crate::id::is_valid(id) {
            return Err(ExecError::InvalidProcessId { id: id.to_string() });
        }
        fs::create_dir_all(root)?;

        let dir = Self::new(root, id);
        match create_private_dir(&dir.path) {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(ExecError::ProcessIdInUse { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up the directory of an existing process
    pub fn open(root: &Path, id: &str) -> Result<Self> {
        if !crate::id::is_valid(id) {
            return Err(ExecError::InvalidProcessId { id: id.to_string() });
        }
        let dir = Self::new(root, id);
        if !dir.path.is_dir() {
            return Err(ExecError::ProcessNotFound { id: id.to_string() });
        }
        Ok(dir)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stdin(&self) -> PathBuf {
        self.path.join(STDIN)
    }

    pub fn stdout(&self) -> PathBuf {
        self.path.join(STDOUT)
    }

    pub fn stderr(&self) -> PathBuf {
        self.path.join(STDERR)
    }

    pub fn exit_fifo(&self) -> PathBuf {
        self.path.join(EXIT_FIFO)
    }

    pub fn control_fifo(&self) -> PathBuf {
        self.path.join(CONTROL_FIFO)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.path.join(PID_FILE)
    }

    pub fn shim_pid_file(&self) -> PathBuf {
        self.path.join(SHIM_PID_FILE)
    }

    pub fn exit_code_file(&self) -> PathBuf {
        self.path.join(EXIT_CODE_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.path.join(STATE_FILE)
    }

    pub fn runtime_log(&self) -> PathBuf {
        self.path.join(RUNTIME_LOG)
    }

    /// Persist `process.json` with write-then-rename so readers never see it half written
    pub fn write_state(&self, state: &ShimState) -> Result<()> {
        let encoded = serde_json::to_vec(state)?;
        write_atomic(&self.state_file(), &encoded)?;
        Ok(())
    }

    pub fn read_state(&self) -> Result<ShimState> {
        let contents = fs::read(self.state_file())?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Exit code recorded by the shim, or `None` while it has not finished
    pub fn read_exit_code(&self) -> Result<Option<i32>> {
        let path = self.exit_code_file();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        contents
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|_| ExecError::InvalidExitCode { path, contents })
    }

    /// PID of the shim that owns this directory, once the launcher has
    /// recorded it
    pub fn read_shim_pid(&self) -> Result<Option<i32>> {
        let path = self.shim_pid_file();
        match PidFileReader.pid(&path) {
            Ok(pid) => Ok(Some(pid)),
            Err(ExecError::PidFile { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Record the unknown exit code for a launch that never got a shim
    /// running, so later attaches finish instead of waiting on it
    pub(crate) fn record_abandoned_launch(&self) -> io::Result<()> {
        if self.exit_code_file().exists() {
            return Ok(());
        }
        let code = crate::supervisor::UNKNOWN_EXIT_CODE.to_string();
        write_atomic(&self.exit_code_file(), code.as_bytes())
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new().create(path)
}

/// Write `contents` next to `path` and rename it into place
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Resolves the PID a process directory currently points at
pub trait PidGetter: Send + Sync + fmt::Debug {
    fn pid(&self, pid_file: &Path) -> Result<i32>;
}

/// Reads the textual PID the shim writes
#[derive(Debug, Default, Clone, Copy)]
pub struct PidFileReader;

impl PidGetter for PidFileReader {
    fn pid(&self, pid_file: &Path) -> Result<i32> {
        let contents = fs::read_to_string(pid_file).map_err(|source| ExecError::PidFile {
            path: pid_file.to_path_buf(),
            source,
        })?;

        match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(ExecError::InvalidPid {
                path: pid_file.to_path_buf(),
                contents,
            }),
        }
    }
}
