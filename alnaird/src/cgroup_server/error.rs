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

use crate::workspace::{AlnairId, WorkspaceError};
use std::path::PathBuf;
use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, CgroupServerError>;

#[derive(Debug, Error)]
pub enum CgroupServerError {
    #[error("failed to bind '{socket}': {source}")]
    FailedToBind { socket: PathBuf, source: std::io::Error },
    #[error("failed to accept registration: {0}")]
    Accept(std::io::Error),
    #[error("malformed registration request '{request}'")]
    MalformedRequest { request: String },
    #[error("invalid cgroup path '{path}'")]
    InvalidCgroupPath { path: String },
    #[error("cgroup.procs not found at '{path}'")]
    CgroupProcsNotFound { path: PathBuf },
    #[error("workspace '{id}': {source}")]
    Workspace { id: AlnairId, source: WorkspaceError },
    #[error(transparent)]
    InvalidAlnairId(#[from] WorkspaceError),
}
