//! Shared helpers for the process execution integration tests

#![allow(dead_code)]

use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use corral_exec::{ExecConfig, ExecRunner, ProcessDir, ProcessSpec, RunRequest};
use tempfile::TempDir;

/// Stand-in for the real shim.
///
/// Follows the shim contract against a "runtime" that is just a shell script
/// run with `sh`: reads the state document from stdin, holds the exit fifo
/// open for writing, records the PID, reports the status byte on fd 3 and
/// log lines on fd 4, then records the exit code with write-then-rename.
const FAKE_SHIM: &str = r##"#!/bin/sh
tty=0
while [ $# -gt 0 ]; do
    case "$1" in
        -tty) tty=1; shift ;;
        -stdin) stdin_path=$2; shift 2 ;;
        -stdout) stdout_path=$2; shift 2 ;;
        -stderr) stderr_path=$2; shift 2 ;;
        exec) shift; break ;;
        *) exit 2 ;;
    esac
done
runtime=$1
dir=$2
handle=$3

cat > "$dir/shim-input.json"
printf '%s %s\n' "$tty" "$handle" > "$dir/shim-args"
if [ -f "$dir/../slow-shim" ]; then
    sleep 0.6
fi
exec 5>"$dir/exit"

if [ ! -f "$runtime" ]; then
    printf '{"level":"error","msg":"exec: \\"%s\\": no such file or directory"}\n' "$runtime" >&4
    printf '\001' >&3
    exit 1
fi

exec 6<"$stdin_path" 7>"$stdout_path" 8>"$stderr_path"
sh "$runtime" <&6 >&7 2>&8 3>&- 4>&- 5>&- 6<&- 7>&- 8>&- &
child=$!
exec 6<&- 7>&- 8>&-

echo "$child" > "$dir/pidfile.tmp"
mv "$dir/pidfile.tmp" "$dir/pidfile"
printf '{"level":"info","msg":"started"}\n' >&4
printf '\000' >&3
exec 3>&- 4>&-

wait "$child"
code=$?
echo "$code" > "$dir/exitcode.tmp"
mv "$dir/exitcode.tmp" "$dir/exitcode"
"##;

/// Install a subscriber honouring `RUST_LOG`, once per test binary
pub fn init_test_logging() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        if std::env::var_os("RUST_LOG").is_some() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        }
    });
}

/// Path of the fake shim, written once per test binary before anything forks
pub fn fake_shim() -> &'static Path {
    static SHIM: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = SHIM.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-shim");
        write_executable(&path, FAKE_SHIM);
        (dir, path)
    });
    path
}

/// Write a script and make it executable. The file is fully closed before
/// this returns.
pub fn write_executable(path: &Path, contents: &str) {
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o755)
            .open(path)
            .unwrap();
        std::io::Write::write_all(&mut file, contents.as_bytes()).unwrap();
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn test_config(runtime: &Path) -> ExecConfig {
    ExecConfig::new(fake_shim(), runtime)
        .with_pipe_open_timeout(Duration::from_secs(2))
        .with_drain_grace(Duration::from_secs(2))
}

/// One container's worth of state: a processes root and a runtime script
pub struct Harness {
    pub root: TempDir,
    pub runtime: PathBuf,
    pub runner: ExecRunner,
}

impl Harness {
    /// `script` is what the target process runs, as a `sh` script body
    pub fn new(script: &str) -> Self {
        init_test_logging();
        let root = tempfile::tempdir().unwrap();
        let runtime = root.path().join("target.sh");
        std::fs::write(&runtime, script).unwrap();
        let runner = ExecRunner::new(&test_config(&runtime)).unwrap();
        Self {
            root,
            runtime,
            runner,
        }
    }

    /// A second runner over the same state, as after a daemon restart
    pub fn restarted_runner(&self) -> ExecRunner {
        ExecRunner::new(&test_config(&self.runtime)).unwrap()
    }

    pub fn processes_root(&self) -> PathBuf {
        self.root.path().join("processes")
    }

    pub fn request(&self) -> RunRequest {
        RunRequest::new("c1", self.processes_root(), ProcessSpec::new(["target"]))
    }

    /// Make every shim pause before it opens the exit fifo
    pub fn slow_shim(&self) {
        std::fs::create_dir_all(self.processes_root()).unwrap();
        std::fs::write(self.processes_root().join("slow-shim"), "").unwrap();
    }

    pub fn dir(&self, id: &str) -> ProcessDir {
        ProcessDir::new(self.processes_root(), id)
    }
}

/// Whatever is currently buffered in a process's control fifo
pub fn read_control(dir: &ProcessDir) -> Vec<u8> {
    use std::io::Read;

    let mut fifo = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
        .open(dir.control_fifo())
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let mut contents = Vec::new();
    loop {
        match fifo.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => contents.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("reading control fifo: {e}"),
        }
    }
    contents
}
