//! Process specification and the shim state document

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dir::ProcessDir;

/// User the target process runs as inside the container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// A single POSIX resource limit, e.g. `RLIMIT_NOFILE`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    #[serde(rename = "type")]
    pub kind: String,
    pub hard: u64,
    pub soft: u64,
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

/// Terminal attach/resize request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySpec {
    pub window_size: Option<WindowSize>,
}

impl TtySpec {
    pub fn with_size(columns: u16, rows: u16) -> Self {
        Self {
            window_size: Some(WindowSize { columns, rows }),
        }
    }
}

/// What to run inside the container. Owned by the caller, never mutated here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: User,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,
}

impl ProcessSpec {
    /// Create a spec running `args` from `/`
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            cwd: "/".to_string(),
            ..Self::default()
        }
    }

    /// Add an environment entry
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env.push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    /// Set working directory
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Set user and group
    pub fn user(mut self, uid: u32, gid: u32) -> Self {
        self.user.uid = uid;
        self.user.gid = gid;
        self
    }

    /// Add a resource limit
    pub fn rlimit(mut self, kind: impl Into<String>, soft: u64, hard: u64) -> Self {
        self.rlimits.push(Rlimit {
            kind: kind.into(),
            hard,
            soft,
        });
        self
    }

    /// Allocate a terminal for the process
    pub fn terminal(mut self, terminal: bool) -> Self {
        self.terminal = terminal;
        self
    }
}

/// The document the shim receives on stdin and that is persisted as
/// `process.json` in the process directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShimState {
    pub process: ProcessSpec,
    pub exec: bool,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    #[serde(rename = "runtimeArgs", default)]
    pub runtime_args: Vec<String>,
    #[serde(rename = "noPivotRoot")]
    pub no_pivot_root: bool,
    #[serde(rename = "checkpoint")]
    pub checkpoint_path: String,
    #[serde(rename = "rootUID")]
    pub root_uid: u32,
    #[serde(rename = "rootGID")]
    pub root_gid: u32,
}

impl ShimState {
    /// Build the exec state for a process living in `dir`
    pub fn for_exec(dir: &ProcessDir, process: ProcessSpec, root_uid: u32, root_gid: u32) -> Self {
        Self {
            process,
            exec: true,
            stdin: dir.stdin(),
            stdout: dir.stdout(),
            stderr: dir.stderr(),
            runtime_args: Vec::new(),
            no_pivot_root: false,
            checkpoint_path: String::new(),
            root_uid,
            root_gid,
        }
    }
}

/// Signals a caller may deliver to a running process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Terminate,
    Kill,
    Interrupt,
    Quit,
    Hangup,
    User1,
    User2,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Hangup => "SIGHUP",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
        };
        f.write_str(name)
    }
}
