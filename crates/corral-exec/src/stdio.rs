//! Caller-side standard streams

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One of the three standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdin => f.write_str("stdin"),
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// Streams the caller wants wired to the process. Any of them may be absent.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
    pub stderr: Option<BoxedWriter>,
}

impl ProcessIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_stdout(mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn with_stderr(mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}
