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

//! Container existence lookups used when reclaiming workspaces.

pub use docker::DockerRegistry;

use std::fmt::Debug;
use thiserror::Error;

mod docker;

/// Default Docker Engine API socket.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to connect to '{socket}': {source}")]
    Connect { socket: String, source: std::io::Error },
    #[error(transparent)]
    Http(#[from] hyper::Error),
    #[error(transparent)]
    Request(#[from] hyper::http::Error),
    #[error("failed to decode container state: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected status {status} inspecting container '{container_id}'")]
    UnexpectedStatus { container_id: String, status: u16 },
    #[error("invalid container id '{container_id}'")]
    InvalidContainerId { container_id: String },
}

/// Answers whether a container is still present on the node.
#[tonic::async_trait]
pub trait ContainerRegistry: Send + Sync + Debug {
    /// `Ok(false)` only when the registry positively reports the container
    /// as absent or stopped. Any doubt is an error.
    async fn exists(&self, container_id: &str) -> Result<bool, RegistryError>;
}
