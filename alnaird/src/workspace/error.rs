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

use super::AlnairId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace '{path}': {source}")]
    FailedToCreateWorkspace { path: PathBuf, source: std::io::Error },
    #[error("failed to reclaim workspace '{path}': {source}")]
    FailedToReclaimWorkspace { path: PathBuf, source: std::io::Error },
    #[error("failed to list workspaces in '{path}': {source}")]
    FailedToListWorkspaces { path: PathBuf, source: std::io::Error },
    #[error("failed to read '{path}': {source}")]
    FailedToReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to write '{path}': {source}")]
    FailedToWriteFile { path: PathBuf, source: std::io::Error },
    #[error("workspace '{id}' not found")]
    WorkspaceNotFound { id: AlnairId },
    #[error("invalid alnair id '{id}'")]
    InvalidAlnairId { id: String },
    #[error("no free alnair id after {attempts} attempts")]
    IdSpaceExhausted { attempts: usize },
    #[error("workspace task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}
