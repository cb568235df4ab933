//! Named-pipe fabric
//!
//! The daemon side of every fifo is opened read-write and non-blocking. That
//! keeps opens from waiting on a peer and means the daemon never sees EOF on
//! an output pipe: output relays run until the process has exited, then drain
//! whatever is still buffered.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dir::ProcessDir;
use crate::error::{ExecError, Result};
use crate::signal;
use crate::spec::WindowSize;
use crate::stdio::{BoxedReader, BoxedWriter, ProcessIo, StreamKind};
use crate::supervisor::{
    recorded_exit_code, ExitGuard, ExitState, StreamTasks, TtyControl, UNKNOWN_EXIT_CODE,
};

const RELAY_BUFFER_SIZE: usize = 32 * 1024;
const MAX_OPEN_BACKOFF: Duration = Duration::from_millis(500);

/// Retry policy for opening fifos that may not exist yet
#[derive(Debug, Clone, Copy)]
pub(crate) struct PipeTiming {
    pub timeout: Duration,
    pub backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadOnly,
    ReadWrite,
}

/// Create the stream, exit and control fifos of a fresh process directory
pub(crate) fn create_fifos(dir: &ProcessDir) -> Result<()> {
    for path in [
        dir.stdin(),
        dir.stdout(),
        dir.stderr(),
        dir.exit_fifo(),
        dir.control_fifo(),
    ] {
        make_fifo(&path)?;
    }
    Ok(())
}

fn make_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(ExecError::PipeCreate {
            path: path.to_path_buf(),
            source: errno.into(),
        }),
    }
}

fn open_nonblocking(path: &Path, access: Access) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options
        .read(true)
        .write(access == Access::ReadWrite)
        .custom_flags(OFlag::O_NONBLOCK.bits());
    options.open(path)
}

fn retryable(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(Errno::ENXIO as i32)
}

async fn open_fifo(path: &Path, access: Access, timing: PipeTiming) -> Result<File> {
    let started = Instant::now();
    let mut backoff = timing.backoff;

    loop {
        match open_nonblocking(path, access) {
            Ok(file) => return Ok(file),
            Err(e) if retryable(&e) => {
                let waited = started.elapsed();
                if waited + backoff > timing.timeout {
                    return Err(ExecError::PipeOpenTimeout {
                        path: path.to_path_buf(),
                        waited_ms: waited.as_millis() as u64,
                    });
                }
                trace!(path = %path.display(), error = %e, "Pipe not ready, retrying");
                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_OPEN_BACKOFF);
            }
            Err(source) => {
                return Err(ExecError::PipeOpen {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

async fn open_receiver(path: &Path, timing: PipeTiming) -> Result<pipe::Receiver> {
    let file = open_fifo(path, Access::ReadWrite, timing).await?;
    pipe::Receiver::from_file(file).map_err(|source| ExecError::PipeOpen {
        path: path.to_path_buf(),
        source,
    })
}

async fn open_sender(path: &Path, timing: PipeTiming) -> Result<pipe::Sender> {
    let file = open_fifo(path, Access::ReadWrite, timing).await?;
    pipe::Sender::from_file(file).map_err(|source| ExecError::PipeOpen {
        path: path.to_path_buf(),
        source,
    })
}

/// Open the read side of the exit fifo so the shim can open its write side
/// without blocking. Held until the shim has been reaped.
pub(crate) async fn open_exit_reader(dir: &ProcessDir, timing: PipeTiming) -> Result<File> {
    open_fifo(&dir.exit_fifo(), Access::ReadOnly, timing).await
}

/// Watch the exit fifo of a process this daemon did not start.
///
/// The shim holds the write side open for its whole life, so EOF on the read
/// side normally means it has exited. A shim that has not opened the fifo yet
/// also reads as EOF, so without an exit code the watcher only gives up once
/// the recorded shim PID is gone, and otherwise looks again after `interval`.
pub(crate) fn spawn_exit_fifo_watcher(
    dir: ProcessDir,
    exit: ExitState,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let guard = ExitGuard::new(dir.id(), exit);
        let code = watch_exit_fifo(&dir, interval).await;
        guard.complete(code);
    })
}

async fn watch_exit_fifo(dir: &ProcessDir, interval: Duration) -> i32 {
    let mut fifo: Option<pipe::Receiver> = None;
    loop {
        match dir.read_exit_code() {
            Ok(Some(code)) => return code,
            Ok(None) => {}
            Err(e) => {
                warn!(process_id = %dir.id(), error = %e, "Unreadable exit code");
                return UNKNOWN_EXIT_CODE;
            }
        }
        if shim_gone(dir) {
            return recorded_exit_code(dir, None);
        }

        if fifo.is_none() {
            fifo = open_exit_receiver(dir);
        }
        let closed = match fifo.as_mut() {
            Some(receiver) => tokio::select! {
                read = read_to_eof(receiver) => {
                    if let Err(e) = read {
                        debug!(process_id = %dir.id(), error = %e, "Exit fifo read failed");
                    }
                    true
                }
                _ = sleep(interval) => false,
            },
            None => {
                sleep(interval).await;
                false
            }
        };
        // EOF stays readable on this descriptor; the next wait needs a fresh one
        if closed {
            fifo = None;
        }
    }
}

/// Until a writer has connected, the kernel reports no hangup on this side
fn open_exit_receiver(dir: &ProcessDir) -> Option<pipe::Receiver> {
    let opened = open_nonblocking(&dir.exit_fifo(), Access::ReadOnly)
        .and_then(pipe::Receiver::from_file);
    match opened {
        Ok(receiver) => Some(receiver),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            trace!(process_id = %dir.id(), "Exit fifo not created yet");
            None
        }
        Err(e) => {
            debug!(process_id = %dir.id(), error = %e, "Exit fifo open failed");
            None
        }
    }
}

async fn read_to_eof(fifo: &mut pipe::Receiver) -> io::Result<()> {
    let mut buf = [0u8; 64];
    while fifo.read(&mut buf).await? != 0 {}
    Ok(())
}

/// True once the shim recorded for `dir` has exited. A shim that was never
/// recorded has not been started yet.
fn shim_gone(dir: &ProcessDir) -> bool {
    match dir.read_shim_pid() {
        Ok(Some(pid)) => !signal::is_alive(pid),
        Ok(None) => false,
        Err(e) => {
            warn!(process_id = %dir.id(), error = %e, "Unreadable shim PID");
            true
        }
    }
}

/// Output streams currently relayed by a live handle in this daemon
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamClaims {
    claimed: Arc<DashSet<(String, StreamKind)>>,
}

impl StreamClaims {
    fn claim(&self, id: &str, stream: StreamKind) -> Result<StreamClaim> {
        let key = (id.to_string(), stream);
        if !self.claimed.insert(key.clone()) {
            return Err(ExecError::StreamAlreadyAttached {
                id: id.to_string(),
                stream,
            });
        }
        Ok(StreamClaim {
            claimed: self.claimed.clone(),
            key,
        })
    }

    #[cfg(test)]
    pub(crate) fn is_claimed(&self, id: &str, stream: StreamKind) -> bool {
        self.claimed.contains(&(id.to_string(), stream))
    }
}

/// Released when the relay that owns it ends
struct StreamClaim {
    claimed: Arc<DashSet<(String, StreamKind)>>,
    key: (String, StreamKind),
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        self.claimed.remove(&self.key);
    }
}

/// Who is opening the streams
#[derive(Debug, Clone)]
pub(crate) enum StreamMode {
    /// A fresh launch. Every stream is opened, absent outputs are drained,
    /// and stdin is held open until `launched` fires.
    Launch { launched: CancellationToken },
    /// Re-attaching. Only the streams the caller supplied are opened.
    Attach,
}

/// Open the daemon side of the stream fifos and start one relay per direction
pub(crate) async fn open_streams(
    dir: &ProcessDir,
    io: ProcessIo,
    mode: StreamMode,
    exited: CancellationToken,
    claims: &StreamClaims,
    timing: PipeTiming,
) -> Result<StreamTasks> {
    let ProcessIo {
        stdin,
        stdout,
        stderr,
    } = io;
    let launching = matches!(mode, StreamMode::Launch { .. });

    let stdout_claim = if launching || stdout.is_some() {
        Some(claims.claim(dir.id(), StreamKind::Stdout)?)
    } else {
        None
    };
    let stderr_claim = if launching || stderr.is_some() {
        Some(claims.claim(dir.id(), StreamKind::Stderr)?)
    } else {
        None
    };

    let stdin_pipe = if launching || stdin.is_some() {
        Some(open_sender(&dir.stdin(), timing).await?)
    } else {
        None
    };
    let stdout_pipe = match stdout_claim {
        Some(claim) => Some((claim, open_receiver(&dir.stdout(), timing).await?)),
        None => None,
    };
    let stderr_pipe = match stderr_claim {
        Some(claim) => Some((claim, open_receiver(&dir.stderr(), timing).await?)),
        None => None,
    };

    let mut tasks = StreamTasks::new();

    if let Some(pipe) = stdin_pipe {
        let launched = match mode {
            StreamMode::Launch { launched } => launched,
            StreamMode::Attach => {
                let ready = CancellationToken::new();
                ready.cancel();
                ready
            }
        };
        tasks.spawn(relay_stdin(
            dir.id().to_string(),
            stdin,
            pipe,
            launched,
            exited.clone(),
        ));
    }
    if let Some((claim, pipe)) = stdout_pipe {
        let sink = stdout.unwrap_or_else(|| Box::new(tokio::io::sink()));
        tasks.spawn(relay_output(claim, pipe, sink, exited.clone()));
    }
    if let Some((claim, pipe)) = stderr_pipe {
        let sink = stderr.unwrap_or_else(|| Box::new(tokio::io::sink()));
        tasks.spawn(relay_output(claim, pipe, sink, exited));
    }

    Ok(tasks)
}

/// Copy caller stdin into the pipe. The pipe is closed (EOF for the process)
/// once the caller's stream ends and the shim has opened its side.
async fn relay_stdin(
    id: String,
    source: Option<BoxedReader>,
    mut pipe: pipe::Sender,
    launched: CancellationToken,
    exited: CancellationToken,
) {
    if let Some(mut source) = source {
        tokio::select! {
            copied = tokio::io::copy(&mut source, &mut pipe) => match copied {
                Ok(bytes) => trace!(process_id = %id, bytes, "stdin closed"),
                Err(e) => debug!(process_id = %id, error = %e, "stdin relay failed"),
            },
            _ = exited.cancelled() => return,
        }
    }

    tokio::select! {
        _ = launched.cancelled() => {}
        _ = exited.cancelled() => {}
    }
    drop(pipe);
}

/// Copy pipe output to the caller until the process exits, then drain.
/// A failing caller writer is swapped for a sink so the process never blocks.
async fn relay_output(
    claim: StreamClaim,
    pipe: pipe::Receiver,
    mut sink: BoxedWriter,
    exited: CancellationToken,
) {
    let stream = claim.key.1;
    let id = claim.key.0.clone();
    let mut pipe = pipe;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        tokio::select! {
            read = pipe.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => forward(&id, stream, &mut sink, &buf[..n]).await,
                Err(e) => {
                    debug!(process_id = %id, %stream, error = %e, "Output relay read failed");
                    break;
                }
            },
            _ = exited.cancelled() => {
                while let Some(n) = read_buffered(&pipe, &mut buf) {
                    forward(&id, stream, &mut sink, &buf[..n]).await;
                }
                break;
            }
        }
    }

    if let Err(e) = sink.flush().await {
        debug!(process_id = %id, %stream, error = %e, "Output relay flush failed");
    }
    if let Err(e) = sink.shutdown().await {
        trace!(process_id = %id, %stream, error = %e, "Output relay shutdown failed");
    }
    drop(claim);
}

async fn forward(id: &str, stream: StreamKind, sink: &mut BoxedWriter, data: &[u8]) {
    if let Err(e) = sink.write_all(data).await {
        debug!(process_id = %id, %stream, error = %e, "Caller stream failed, discarding output");
        *sink = Box::new(tokio::io::sink());
    }
}

/// Non-blocking read straight from the descriptor, bypassing cached readiness
fn read_buffered(pipe: &pipe::Receiver, buf: &mut [u8]) -> Option<usize> {
    loop {
        match nix::unistd::read(pipe.as_raw_fd(), buf) {
            Ok(0) => return None,
            Ok(n) => return Some(n),
            Err(Errno::EINTR) => continue,
            Err(_) => return None,
        }
    }
}

/// Control fifo carrying window-size updates to the shim, one JSON line each
#[derive(Debug)]
pub(crate) struct FifoControl {
    pipe: Mutex<pipe::Sender>,
}

impl FifoControl {
    pub(crate) async fn open(dir: &ProcessDir, timing: PipeTiming) -> Result<Self> {
        let pipe = open_sender(&dir.control_fifo(), timing).await?;
        Ok(Self {
            pipe: Mutex::new(pipe),
        })
    }
}

#[async_trait]
impl TtyControl for FifoControl {
    async fn resize(&self, size: WindowSize) -> Result<()> {
        let mut line = serde_json::to_vec(&size)?;
        line.push(b'\n');
        let mut pipe = self.pipe.lock().await;
        pipe.write_all(&line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    fn timing() -> PipeTiming {
        PipeTiming {
            timeout: Duration::from_millis(200),
            backoff: Duration::from_millis(10),
        }
    }

    fn fresh_dir(root: &Path) -> ProcessDir {
        let dir = ProcessDir::create(root, "p").unwrap();
        create_fifos(&dir).unwrap();
        dir
    }

    /// The process side of an output fifo
    fn open_writer(path: &Path) -> File {
        OpenOptions::new().write(true).open(path).unwrap()
    }

    fn is_fifo(path: &Path) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path).unwrap().file_type().is_fifo()
    }

    #[test]
    fn test_create_fifos_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let dir = fresh_dir(root.path());
        create_fifos(&dir).unwrap();
        for path in [dir.stdin(), dir.stdout(), dir.stderr(), dir.exit_fifo(), dir.control_fifo()] {
            assert!(is_fifo(&path), "{} is not a fifo", path.display());
        }
    }

    #[tokio::test]
    async fn test_missing_fifo_times_out() {
        let root = tempfile::tempdir().unwrap();
        let dir = ProcessDir::create(root.path(), "p").unwrap();
        let err = open_receiver(&dir.stdout(), timing()).await.unwrap_err();
        assert!(matches!(err, ExecError::PipeOpenTimeout { .. }));
    }

    #[tokio::test]
    async fn test_output_relay_delivers_everything_written_before_exit() {
        let root = tempfile::tempdir().unwrap();
        let dir = fresh_dir(root.path());
        let exited = CancellationToken::new();
        let claims = StreamClaims::default();
        let (caller_out, mut read_out) = tokio::io::duplex(64 * 1024);

        let tasks = open_streams(
            &dir,
            ProcessIo::new().with_stdout(caller_out),
            StreamMode::Launch {
                launched: CancellationToken::new(),
            },
            exited.clone(),
            &claims,
            timing(),
        )
        .await
        .unwrap();

        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut writer = open_writer(&dir.stdout());
        writer.write_all(&payload).unwrap();
        drop(writer);
        exited.cancel();

        let mut received = Vec::new();
        read_out.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        tasks.finished().await;
        assert!(!claims.is_claimed("p", StreamKind::Stdout));
    }

    #[tokio::test]
    async fn test_stdin_relay_closes_after_launch() {
        let root = tempfile::tempdir().unwrap();
        let dir = fresh_dir(root.path());
        let launched = CancellationToken::new();

        let _tasks = open_streams(
            &dir,
            ProcessIo::new().with_stdin(std::io::Cursor::new(b"hello".to_vec())),
            StreamMode::Launch {
                launched: launched.clone(),
            },
            CancellationToken::new(),
            &StreamClaims::default(),
            timing(),
        )
        .await
        .unwrap();

        let mut reader = tokio::fs::File::open(dir.stdin()).await.unwrap();
        launched.cancel();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_second_output_claim_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = fresh_dir(root.path());
        let claims = StreamClaims::default();
        let exited = CancellationToken::new();

        let _first = open_streams(
            &dir,
            ProcessIo::new(),
            StreamMode::Launch {
                launched: CancellationToken::new(),
            },
            exited.clone(),
            &claims,
            timing(),
        )
        .await
        .unwrap();

        let err = open_streams(
            &dir,
            ProcessIo::new().with_stdout(tokio::io::sink()),
            StreamMode::Attach,
            exited.clone(),
            &claims,
            timing(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ExecError::StreamAlreadyAttached {
                stream: StreamKind::Stdout,
                ..
            }
        ));

        let attached = open_streams(
            &dir,
            ProcessIo::new(),
            StreamMode::Attach,
            exited.clone(),
            &claims,
            timing(),
        )
        .await;
        assert!(attached.is_ok());
        exited.cancel();
    }

    #[tokio::test]
    async fn test_control_writes_json_lines() {
        let root = tempfile::tempdir().unwrap();
        let dir = fresh_dir(root.path());
        let control = FifoControl::open(&dir, timing()).await.unwrap();

        control
            .resize(WindowSize {
                columns: 80,
                rows: 24,
            })
            .await
            .unwrap();

        let mut reader = open_nonblocking(&dir.control_fifo(), Access::ReadOnly).unwrap();
        let mut buf = [0u8; 128];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"{\"columns\":80,\"rows\":24}\n");
    }

    #[tokio::test]
    async fn test_exit_fifo_watcher_sees_writer_close() {
        let root = tempfile::tempdir().unwrap();
        let dir = fresh_dir(root.path());
        let _keepalive = open_exit_reader(&dir, timing()).await.unwrap();
        let shim_side = open_writer(&dir.exit_fifo());

        let exit = ExitState::new(crate::supervisor::Lifecycle::Running);
        let watcher = spawn_exit_fifo_watcher(dir.clone(), exit.clone(), Duration::from_secs(5));

        crate::dir::write_atomic(&dir.exit_code_file(), b"3").unwrap();
        drop(shim_side);

        timeout(Duration::from_secs(2), watcher).await.unwrap().unwrap();
        assert_eq!(exit.current().exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_exit_fifo_watcher_waits_for_late_shim() {
        let root = tempfile::tempdir().unwrap();
        let dir = fresh_dir(root.path());
        let mut shim = tokio::process::Command::new("sleep").arg("10").spawn().unwrap();
        let shim_pid = shim.id().unwrap().to_string();
        crate::dir::write_atomic(&dir.shim_pid_file(), shim_pid.as_bytes()).unwrap();

        let exit = ExitState::new(crate::supervisor::Lifecycle::Running);
        let watcher =
            spawn_exit_fifo_watcher(dir.clone(), exit.clone(), Duration::from_millis(10));

        // Nobody holds the write side yet
        sleep(Duration::from_millis(150)).await;
        assert_eq!(exit.current(), crate::supervisor::Lifecycle::Running);

        let _keepalive = open_exit_reader(&dir, timing()).await.unwrap();
        let shim_side = open_writer(&dir.exit_fifo());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(exit.current(), crate::supervisor::Lifecycle::Running);

        crate::dir::write_atomic(&dir.exit_code_file(), b"4").unwrap();
        drop(shim_side);
        shim.kill().await.unwrap();

        timeout(Duration::from_secs(2), watcher).await.unwrap().unwrap();
        assert_eq!(exit.current().exit_code(), Some(4));
    }

    #[tokio::test]
    async fn test_exit_fifo_watcher_reports_unknown_when_shim_died() {
        let root = tempfile::tempdir().unwrap();
        let dir = fresh_dir(root.path());
        let mut shim = tokio::process::Command::new("true").spawn().unwrap();
        let shim_pid = shim.id().unwrap().to_string();
        shim.wait().await.unwrap();
        crate::dir::write_atomic(&dir.shim_pid_file(), shim_pid.as_bytes()).unwrap();

        let exit = ExitState::new(crate::supervisor::Lifecycle::Running);
        let watcher = spawn_exit_fifo_watcher(dir, exit.clone(), Duration::from_millis(10));

        timeout(Duration::from_secs(2), watcher).await.unwrap().unwrap();
        assert_eq!(exit.current().exit_code(), Some(UNKNOWN_EXIT_CODE));
    }
}
