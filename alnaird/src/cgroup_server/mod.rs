/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Registration listener for workloads.
//!
//! A workload connects to the socket and sends one line,
//! `<cgroup path> <alnair id>\n`. The daemon snapshots the cgroup's
//! `cgroup.procs` into the workspace and replies `ok`, or the error text.

pub use error::CgroupServerError;

use crate::workspace::{AlnairId, WorkspaceManager, CGROUP_PROCS_FILE};
use error::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{error, info, trace, warn};

mod error;

pub const ALNAIR_SOCKET: &str = "/run/alnair.sock";
pub const CGROUP_MEMORY_ROOT: &str = "/sys/fs/cgroup/memory";

const REPLY_OK: &str = "ok";
const CONTAINER_ID_LEN: usize = 64;
/// Longest registration line read from a client.
const MAX_REQUEST_LEN: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub cgroup_path: String,
    pub alnair_id: AlnairId,
}

impl FromStr for RegistrationRequest {
    type Err = CgroupServerError;

    fn from_str(line: &str) -> Result<Self> {
        let malformed =
            || CgroupServerError::MalformedRequest { request: line.to_string() };

        let body = line.strip_suffix('\n').ok_or_else(malformed)?;
        let body = body.strip_suffix('\r').unwrap_or(body);
        let fields: Vec<&str> = body.split_whitespace().collect();
        let (cgroup_path, alnair_id) = match fields.as_slice() {
            [cgroup_path, alnair_id] => (*cgroup_path, *alnair_id),
            _ => return Err(malformed()),
        };

        if Path::new(cgroup_path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(CgroupServerError::InvalidCgroupPath {
                path: cgroup_path.to_string(),
            });
        }

        Ok(Self {
            cgroup_path: cgroup_path.to_string(),
            alnair_id: AlnairId::parse(alnair_id)?,
        })
    }
}

/// Docker container id encoded in the last component of a cgroup path.
///
/// Only the docker layouts are recognized (`<id>` under cgroupfs,
/// `docker-<id>.scope` under systemd). Containers of other runtimes are
/// unknown to the Docker registry, so their workspaces stay unbound.
pub fn container_id_from_cgroup(cgroup_path: &str) -> Option<String> {
    let leaf = cgroup_path.trim_end_matches('/').rsplit('/').next()?;
    let id = match leaf.strip_suffix(".scope") {
        Some(scope) => scope.strip_prefix("docker-")?,
        None => leaf,
    };

    (id.len() == CONTAINER_ID_LEN && id.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| id.to_string())
}

/// Applies registrations to the workspaces.
#[derive(Debug, Clone)]
pub struct CgroupBinder {
    cgroup_root: PathBuf,
    workspaces: WorkspaceManager,
}

impl CgroupBinder {
    pub fn new<P: Into<PathBuf>>(
        cgroup_root: P,
        workspaces: WorkspaceManager,
    ) -> Self {
        Self { cgroup_root: cgroup_root.into(), workspaces }
    }

    pub fn register(&self, request: &RegistrationRequest) -> Result<()> {
        info!(
            "registration for cgroup {} with alnair id {}",
            request.cgroup_path, request.alnair_id
        );

        let procs = self
            .cgroup_root
            .join(request.cgroup_path.trim_start_matches('/'))
            .join(CGROUP_PROCS_FILE);
        if !procs.is_file() {
            return Err(CgroupServerError::CgroupProcsNotFound { path: procs });
        }

        let container_id = container_id_from_cgroup(&request.cgroup_path);
        if container_id.is_none() {
            warn!(
                "no container id in cgroup {}, workspace {} stays unbound",
                request.cgroup_path, request.alnair_id
            );
        }

        self.workspaces
            .bind(&request.alnair_id, container_id.as_deref(), &procs)
            .map_err(|source| CgroupServerError::Workspace {
                id: request.alnair_id.clone(),
                source,
            })
    }

    /// Parses and applies one request line, returning the reply to send.
    pub fn handle(&self, line: &str) -> String {
        match line
            .parse::<RegistrationRequest>()
            .and_then(|request| self.register(&request))
        {
            Ok(()) => REPLY_OK.to_string(),
            Err(e) => {
                error!("{e}");
                e.to_string()
            }
        }
    }
}

#[derive(Debug)]
pub struct CgroupServer {
    listener: UnixListener,
    socket: PathBuf,
    binder: CgroupBinder,
}

impl CgroupServer {
    /// Binds the registration socket, replacing a stale one.
    pub fn bind<P: Into<PathBuf>>(socket: P, binder: CgroupBinder) -> Result<Self> {
        let socket = socket.into();
        let failed = |source: std::io::Error| CgroupServerError::FailedToBind {
            socket: socket.clone(),
            source,
        };

        match fs::remove_file(&socket) {
            Ok(()) => trace!("removed stale socket {}", socket.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(failed(e)),
        }
        if let Some(parent) = socket.parent() {
            fs::create_dir_all(parent).map_err(failed)?;
        }

        let listener = UnixListener::bind(&socket).map_err(failed)?;
        // Workloads run unprivileged
        fs::set_permissions(&socket, fs::Permissions::from_mode(0o766))
            .map_err(failed)?;
        info!("cgroup registration socket: {}", socket.display());

        Ok(Self { listener, socket, binder })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Accepts registrations until `shutdown` fires. Each connection is
    /// handled on its own task.
    pub async fn serve(self, mut shutdown: watch::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted.map_err(CgroupServerError::Accept)?;
                    let binder = self.binder.clone();
                    let _ = tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, binder).await {
                            warn!("registration connection failed: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("cgroup registration server stopped");
                    let _ = fs::remove_file(&self.socket);
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    binder: CgroupBinder,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    let _ = BufReader::new(read.take(MAX_REQUEST_LEN))
        .read_line(&mut line)
        .await?;

    let reply =
        tokio::task::spawn_blocking(move || binder.handle(&line)).await?;

    write.write_all(reply.as_bytes()).await?;
    write.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ContainerRegistry, RegistryError};
    use crate::workspace::{Recycler, DEFAULT_RECYCLE_INTERVAL};
    use crate::workspace::CONTAINER_ID_FILE;
    use simple_test_case::test_case;
    use std::sync::Arc;

    const CONTAINER: &str =
        "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    struct Fixture {
        root: PathBuf,
        workspaces: WorkspaceManager,
        binder: CgroupBinder,
    }

    impl Fixture {
        fn new() -> Self {
            let root = std::env::temp_dir()
                .join(format!("alnaird-cgroup-{}", uuid::Uuid::new_v4()));
            let workspaces = WorkspaceManager::new(root.join("workspace"));
            let binder =
                CgroupBinder::new(root.join("cgroup"), workspaces.clone());
            Self { root, workspaces, binder }
        }

        fn cgroup(&self, path: &str, procs: &str) {
            let dir = self.root.join("cgroup").join(path.trim_start_matches('/'));
            fs::create_dir_all(&dir).expect("cgroup dir");
            fs::write(dir.join(CGROUP_PROCS_FILE), procs).expect("procs");
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test_case("/kubepods/pod1/abc x7k2q\n", "/kubepods/pod1/abc", "x7k2q"; "plain")]
    #[test_case("/a b\r\n", "/a", "b"; "crlf")]
    #[test]
    fn requests_parse(line: &str, cgroup_path: &str, alnair_id: &str) {
        let request: RegistrationRequest = line.parse().expect("valid");
        assert_eq!(request.cgroup_path, cgroup_path);
        assert_eq!(request.alnair_id.as_str(), alnair_id);
    }

    #[test_case("/kubepods/pod1/abc x7k2q"; "no newline")]
    #[test_case("/kubepods/pod1/abc\n"; "missing id")]
    #[test_case("/a x7k2q extra\n"; "extra field")]
    #[test_case("\n"; "empty")]
    #[test_case("/a/../../etc x7k2q\n"; "parent dir")]
    #[test_case("/a ../x\n"; "bad id")]
    #[test]
    fn requests_are_rejected(line: &str) {
        assert!(line.parse::<RegistrationRequest>().is_err());
    }

    #[test_case(&format!("/kubepods/burstable/pod1/{CONTAINER}"), Some(CONTAINER); "cgroupfs")]
    #[test_case(&format!("/kubepods.slice/docker-{CONTAINER}.scope"), Some(CONTAINER); "systemd docker")]
    #[test_case(&format!("/kubepods.slice/docker-{CONTAINER}.scope/"), Some(CONTAINER); "trailing slash")]
    #[test_case(&format!("/kubepods.slice/cri-containerd-{CONTAINER}.scope"), None; "systemd containerd")]
    #[test_case(&format!("/kubepods.slice/crio-{CONTAINER}.scope"), None; "systemd crio")]
    #[test_case(&format!("/system.slice/{CONTAINER}.scope"), None; "bare scope")]
    #[test_case("/kubepods/burstable/pod1", None; "pod level")]
    #[test_case("/", None; "root")]
    #[test]
    fn container_ids(cgroup_path: &str, expected: Option<&str>) {
        assert_eq!(
            container_id_from_cgroup(cgroup_path).as_deref(),
            expected
        );
    }

    #[test]
    fn register_must_snapshot_procs_and_record_container() {
        let fixture = Fixture::new();
        let workspace = fixture.workspaces.create("vmem:1").expect("create");
        let cgroup = format!("/kubepods/pod1/{CONTAINER}");
        fixture.cgroup(&cgroup, "101\n102\n");

        let reply = fixture.binder.handle(&format!("{cgroup} {}\n", workspace.id));

        assert_eq!(reply, "ok");
        assert_eq!(
            fs::read_to_string(workspace.host_path.join(CGROUP_PROCS_FILE))
                .expect("snapshot"),
            "101\n102\n"
        );
        assert_eq!(
            fs::read_to_string(workspace.host_path.join(CONTAINER_ID_FILE))
                .expect("container id"),
            CONTAINER
        );
    }

    #[test]
    fn register_without_container_id_leaves_workspace_unbound() {
        let fixture = Fixture::new();
        let workspace = fixture.workspaces.create("vmem:1").expect("create");
        fixture.cgroup("/kubepods/pod1", "7\n");

        let reply =
            fixture.binder.handle(&format!("/kubepods/pod1 {}\n", workspace.id));

        assert_eq!(reply, "ok");
        assert!(workspace.host_path.join(CGROUP_PROCS_FILE).exists());
        assert_eq!(
            fixture.workspaces.container_id(&workspace.id).expect("read"),
            None
        );
    }

    #[derive(Debug)]
    struct NothingRunning;

    #[tonic::async_trait]
    impl ContainerRegistry for NothingRunning {
        async fn exists(
            &self,
            _container_id: &str,
        ) -> std::result::Result<bool, RegistryError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn containerd_workload_must_survive_a_sweep() {
        let fixture = Fixture::new();
        let workspace = fixture.workspaces.create("vmem:1").expect("create");
        let cgroup = format!(
            "/kubepods.slice/kubepods-pod1.slice/cri-containerd-{CONTAINER}.scope"
        );
        fixture.cgroup(&cgroup, "7\n");

        let reply = fixture.binder.handle(&format!("{cgroup} {}\n", workspace.id));
        assert_eq!(reply, "ok");
        assert_eq!(
            fixture.workspaces.container_id(&workspace.id).expect("read"),
            None
        );

        let recycler = Recycler::new(
            fixture.workspaces.clone(),
            Arc::new(NothingRunning),
            DEFAULT_RECYCLE_INTERVAL,
        );
        assert_eq!(recycler.sweep().await.expect("sweep"), 0);
        assert!(workspace.host_path.exists());
    }

    #[test]
    fn missing_procs_must_leave_snapshot_untouched() {
        let fixture = Fixture::new();
        let workspace = fixture.workspaces.create("vmem:1").expect("create");
        let snapshot = workspace.host_path.join(CGROUP_PROCS_FILE);
        fs::write(&snapshot, "previous\n").expect("snapshot");

        let reply =
            fixture.binder.handle(&format!("/kubepods/gone {}\n", workspace.id));

        assert_ne!(reply, "ok");
        assert_eq!(fs::read_to_string(&snapshot).expect("snapshot"), "previous\n");
    }

    #[test]
    fn unknown_workspace_is_not_created() {
        let fixture = Fixture::new();
        fixture.cgroup("/kubepods/pod1", "7\n");

        let reply = fixture.binder.handle("/kubepods/pod1 zzzzz\n");

        assert_ne!(reply, "ok");
        assert!(!fixture.workspaces.path(&AlnairId::parse("zzzzz").expect("id")).exists());
    }

    #[tokio::test]
    async fn serve_must_reply_over_the_socket() {
        let fixture = Fixture::new();
        let workspace = fixture.workspaces.create("vmem:1").expect("create");
        fixture.cgroup("/kubepods/pod1", "7\n");
        let socket = fixture.root.join("run").join("alnair.sock");
        let server =
            CgroupServer::bind(&socket, fixture.binder.clone()).expect("bind");
        let (tx, rx) = watch::channel(());
        let handle = tokio::spawn(server.serve(rx));

        let mut stream = UnixStream::connect(&socket).await.expect("connect");
        stream
            .write_all(format!("/kubepods/pod1 {}\n", workspace.id).as_bytes())
            .await
            .expect("write");
        let mut reply = String::new();
        let _ = stream.read_to_string(&mut reply).await.expect("read");
        assert_eq!(reply, "ok");

        let _ = tx.send(());
        handle.await.expect("join").expect("serve");
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn oversized_requests_must_be_cut_off() {
        let fixture = Fixture::new();
        let socket = fixture.root.join("run").join("alnair.sock");
        let server =
            CgroupServer::bind(&socket, fixture.binder.clone()).expect("bind");
        let (tx, rx) = watch::channel(());
        let handle = tokio::spawn(server.serve(rx));

        let mut stream = UnixStream::connect(&socket).await.expect("connect");
        // No newline, and far more than a request may hold.
        let flood = vec![b'a'; 64 * 1024];
        let _ = stream.write_all(&flood).await;
        let mut reply = String::new();
        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            stream.read_to_string(&mut reply),
        )
        .await
        .expect("server kept reading");
        assert!(reply.starts_with("malformed"), "unexpected reply {reply:?}");

        let _ = tx.send(());
        handle.await.expect("join").expect("serve");
    }
}
