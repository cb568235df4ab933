//! Caller surface: run and attach

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use crate::backend::{ExecBackend, Launch, NativeBackend};
use crate::config::ExecConfig;
use crate::dir::ProcessDir;
use crate::error::Result;
use crate::id::{ProcessIdGenerator, UuidGenerator};
use crate::spec::{ProcessSpec, ShimState, TtySpec};
use crate::stdio::ProcessIo;
use crate::supervisor::Process;

/// Request to run one process inside a container
#[derive(Debug)]
pub struct RunRequest {
    /// Generated when absent
    pub process_id: Option<String>,
    pub spec: ProcessSpec,
    /// Container the process joins
    pub handle: String,
    /// Directory holding one subdirectory per process of this container
    pub processes_root: PathBuf,
    /// Host IDs that container root maps to
    pub root_uid: u32,
    pub root_gid: u32,
    pub tty: Option<TtySpec>,
    pub io: ProcessIo,
}

impl RunRequest {
    pub fn new(
        handle: impl Into<String>,
        processes_root: impl Into<PathBuf>,
        spec: ProcessSpec,
    ) -> Self {
        Self {
            process_id: None,
            spec,
            handle: handle.into(),
            processes_root: processes_root.into(),
            root_uid: 0,
            root_gid: 0,
            tty: None,
            io: ProcessIo::default(),
        }
    }

    pub fn with_process_id(mut self, id: impl Into<String>) -> Self {
        self.process_id = Some(id.into());
        self
    }

    pub fn with_root_ids(mut self, uid: u32, gid: u32) -> Self {
        self.root_uid = uid;
        self.root_gid = gid;
        self
    }

    pub fn with_tty(mut self, tty: TtySpec) -> Self {
        self.tty = Some(tty);
        self
    }

    pub fn with_io(mut self, io: ProcessIo) -> Self {
        self.io = io;
        self
    }
}

/// Runs processes in containers and re-attaches to them
#[derive(Debug, Clone)]
pub struct ExecRunner<B = NativeBackend> {
    backend: B,
    id_generator: Arc<dyn ProcessIdGenerator>,
}

impl ExecRunner<NativeBackend> {
    /// Runner using this platform's backend
    pub fn new(config: &ExecConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_backend(NativeBackend::new(config)))
    }
}

impl<B: ExecBackend> ExecRunner<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            id_generator: Arc::new(UuidGenerator),
        }
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn ProcessIdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Start a process and return its handle once the runtime has execed it.
    ///
    /// The process directory is reserved first, so a duplicate ID fails
    /// before anything is started.
    pub async fn run(&self, request: RunRequest) -> Result<Process> {
        let RunRequest {
            process_id,
            spec,
            handle,
            processes_root,
            root_uid,
            root_gid,
            tty,
            io,
        } = request;
        let id = process_id.unwrap_or_else(|| self.id_generator.generate());

        let span = info_span!("exec", process_id = %id, handle = %handle);
        async move {
            let dir = ProcessDir::create(&processes_root, &id)?;
            let state = ShimState::for_exec(&dir, spec, root_uid, root_gid);
            dir.write_state(&state)?;

            let process = self
                .backend
                .start(Launch {
                    dir,
                    state,
                    handle,
                    tty,
                    io,
                })
                .await?;
            info!(pid = ?process.pid().ok(), "Process started");
            Ok(process)
        }
        .instrument(span)
        .await
    }

    /// Rebuild a handle for an existing process from its directory alone
    pub async fn attach(
        &self,
        process_id: &str,
        processes_root: &Path,
        io: ProcessIo,
    ) -> Result<Process> {
        let span = info_span!("exec", process_id = %process_id, handle = tracing::field::Empty);
        async move {
            let dir = ProcessDir::open(processes_root, process_id)?;
            let process = self.backend.attach(dir, io).await?;
            info!(state = ?process.state(), "Attached to process");
            Ok(process)
        }
        .instrument(span)
        .await
    }
}
