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

//! Per allocation workspaces.
//!
//! ```text
//! <root>/<alnair id>/limits        vmem:<bytes>, written at allocation
//! <root>/<alnair id>/containerID   written once the workload registers
//! <root>/<alnair id>/cgroup.procs  snapshot of the workload's cgroup
//! ```
//!
//! A workspace is only ever reclaimed once a container id has been recorded
//! and that container is gone. See [Recycler].

pub use alnair_id::AlnairId;
pub use error::WorkspaceError;
pub use recycler::{Recycler, DEFAULT_RECYCLE_INTERVAL};

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, trace};

mod alnair_id;
mod error;
mod recycler;

pub(crate) type Result<T> = std::result::Result<T, WorkspaceError>;

/// Default host directory holding all workspaces. Workspaces are also
/// mounted at this path inside allocated containers.
pub const ALNAIR_WORKSPACE_ROOT: &str = "/var/lib/alnair/workspace";

pub const LIMITS_FILE: &str = "limits";
pub const CONTAINER_ID_FILE: &str = "containerID";
pub const CGROUP_PROCS_FILE: &str = "cgroup.procs";

const MAX_CREATE_ATTEMPTS: usize = 16;

/// Limits file content for a memory allocation of `bytes`.
pub fn vmem_limit(bytes: u64) -> String {
    format!("vmem:{bytes}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: AlnairId,
    pub host_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, id: &AlnairId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Runs `f` against this manager on the blocking pool. Async callers go
    /// through here so filesystem work stays off the runtime workers.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WorkspaceManager) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || f(&manager)).await?
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|source| {
            WorkspaceError::FailedToCreateWorkspace {
                path: self.root.clone(),
                source,
            }
        })
    }

    /// The workspace `id` would live in. Nothing is created.
    pub fn workspace(&self, id: AlnairId) -> Workspace {
        Workspace { host_path: self.path(&id), id }
    }

    /// Creates a workspace under a fresh id and writes `limits` into it.
    ///
    /// Ids are retried when a directory with the same name already exists.
    pub fn create(&self, limits: &str) -> Result<Workspace> {
        self.ensure_root()?;

        let mut attempts = 0;
        let workspace = loop {
            let workspace = self.workspace(AlnairId::random());
            match fs::create_dir(&workspace.host_path) {
                Ok(()) => break workspace,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    attempts += 1;
                    trace!("alnair id {} already taken", workspace.id);
                    if attempts >= MAX_CREATE_ATTEMPTS {
                        return Err(WorkspaceError::IdSpaceExhausted {
                            attempts,
                        });
                    }
                }
                Err(source) => {
                    return Err(WorkspaceError::FailedToCreateWorkspace {
                        path: workspace.host_path,
                        source,
                    })
                }
            }
        };

        let limits_path = workspace.host_path.join(LIMITS_FILE);
        fs::write(&limits_path, limits).map_err(|source| {
            WorkspaceError::FailedToWriteFile { path: limits_path, source }
        })?;

        Ok(workspace)
    }

    /// Removes workspace `id`. Removing an absent workspace is not an error.
    pub fn reclaim(&self, id: &AlnairId) -> Result<()> {
        let path = self.path(id);
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                info!("reclaimed alnair workspace {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => {
                Err(WorkspaceError::FailedToReclaimWorkspace { path, source })
            }
        }
    }

    /// Ids of all workspace directories under the root. Entries that are not
    /// directories or not named like an [AlnairId] are skipped.
    pub fn list(&self) -> Result<Vec<AlnairId>> {
        let entries = fs::read_dir(&self.root).map_err(|source| {
            WorkspaceError::FailedToListWorkspaces {
                path: self.root.clone(),
                source,
            }
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().map(AlnairId::parse) {
                Some(Ok(id)) => ids.push(id),
                _ => trace!("skipping foreign workspace entry {name:?}"),
            }
        }
        Ok(ids)
    }

    pub fn limits(&self, id: &AlnairId) -> Result<String> {
        let path = self.path(id).join(LIMITS_FILE);
        fs::read_to_string(&path)
            .map_err(|source| WorkspaceError::FailedToReadFile { path, source })
    }

    /// Container recorded for workspace `id`, `None` while unbound.
    pub fn container_id(&self, id: &AlnairId) -> Result<Option<String>> {
        let path = self.path(id).join(CONTAINER_ID_FILE);
        match fs::read_to_string(&path) {
            Ok(container_id) => {
                let container_id = container_id.trim();
                Ok((!container_id.is_empty()).then(|| container_id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => {
                Err(WorkspaceError::FailedToReadFile { path, source })
            }
        }
    }

    /// Binds workspace `id` to a workload: replaces the cgroup.procs snapshot
    /// with a copy of `cgroup_procs` and records `container_id` if known.
    ///
    /// The workspace must still exist; a workspace reclaimed in the meantime
    /// is reported as [WorkspaceError::WorkspaceNotFound], never recreated.
    pub fn bind(
        &self,
        id: &AlnairId,
        container_id: Option<&str>,
        cgroup_procs: &Path,
    ) -> Result<()> {
        let path = self.path(id);
        if !path.is_dir() {
            return Err(WorkspaceError::WorkspaceNotFound { id: id.clone() });
        }

        let snapshot = path.join(CGROUP_PROCS_FILE);
        match fs::remove_file(&snapshot) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(WorkspaceError::FailedToWriteFile {
                    path: snapshot,
                    source,
                })
            }
        }

        let procs = fs::read(cgroup_procs).map_err(|source| {
            WorkspaceError::FailedToReadFile {
                path: cgroup_procs.to_path_buf(),
                source,
            }
        })?;
        fs::write(&snapshot, procs).map_err(|source| {
            WorkspaceError::FailedToWriteFile { path: snapshot, source }
        })?;

        if let Some(container_id) = container_id {
            let container_id_path = path.join(CONTAINER_ID_FILE);
            fs::write(&container_id_path, container_id).map_err(|source| {
                WorkspaceError::FailedToWriteFile {
                    path: container_id_path,
                    source,
                }
            })?;
        }

        Ok(())
    }
}
