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

use super::{ContainerRegistry, RegistryError};
use hyper::{body, Body, Request, StatusCode};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tracing::{trace, warn};

#[derive(Debug, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "State")]
    state: ContainerState,
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Running")]
    running: bool,
}

/// [ContainerRegistry] backed by the Docker Engine API over its unix socket.
#[derive(Debug, Clone)]
pub struct DockerRegistry {
    socket: PathBuf,
}

impl DockerRegistry {
    pub fn new<P: Into<PathBuf>>(socket: P) -> Self {
        Self { socket: socket.into() }
    }
}

#[tonic::async_trait]
impl ContainerRegistry for DockerRegistry {
    async fn exists(&self, container_id: &str) -> Result<bool, RegistryError> {
        if container_id.is_empty()
            || !container_id.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(RegistryError::InvalidContainerId {
                container_id: container_id.to_string(),
            });
        }

        let stream =
            UnixStream::connect(&self.socket).await.map_err(|source| {
                RegistryError::Connect {
                    socket: self.socket.display().to_string(),
                    source,
                }
            })?;
        let (mut sender, connection) =
            hyper::client::conn::handshake(stream).await?;
        let _ = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("docker connection closed: {e}");
            }
        });

        let request = Request::get(format!("/containers/{container_id}/json"))
            .header("Host", "docker")
            .body(Body::empty())?;
        let response = sender.send_request(request).await?;

        match response.status() {
            StatusCode::OK => {
                let bytes = body::to_bytes(response.into_body()).await?;
                let inspect: ContainerInspect = serde_json::from_slice(&bytes)?;
                trace!(
                    "container {container_id} running: {}",
                    inspect.state.running
                );
                Ok(inspect.state.running)
            }
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RegistryError::UnexpectedStatus {
                container_id: container_id.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Serves one canned HTTP response per connection.
    fn fake_engine(response: &'static str) -> PathBuf {
        let socket = std::env::temp_dir()
            .join(format!("alnaird-docker-{}.sock", uuid::Uuid::new_v4()));
        let listener = UnixListener::bind(&socket).expect("bind fake engine");
        let _ = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        socket
    }

    #[tokio::test]
    async fn running_container_exists() {
        let body = r#"{"Id":"abc","State":{"Running":true,"Status":"running"}}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .into_boxed_str(),
        );
        let registry = DockerRegistry::new(fake_engine(response));

        assert!(registry.exists("abc").await.expect("lookup"));
    }

    #[tokio::test]
    async fn stopped_container_does_not_exist() {
        let body = r#"{"State":{"Running":false}}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .into_boxed_str(),
        );
        let registry = DockerRegistry::new(fake_engine(response));

        assert!(!registry.exists("abc").await.expect("lookup"));
    }

    #[tokio::test]
    async fn unknown_container_does_not_exist() {
        let registry = DockerRegistry::new(fake_engine(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ));

        assert!(!registry.exists("abc").await.expect("lookup"));
    }

    #[tokio::test]
    async fn server_errors_are_not_absence() {
        let registry = DockerRegistry::new(fake_engine(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ));

        assert!(matches!(
            registry.exists("abc").await,
            Err(RegistryError::UnexpectedStatus { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_engine_is_an_error() {
        let registry = DockerRegistry::new(
            std::env::temp_dir().join(format!("missing-{}.sock", uuid::Uuid::new_v4())),
        );

        assert!(matches!(
            registry.exists("abc").await,
            Err(RegistryError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn ids_must_be_alphanumeric() {
        let registry = DockerRegistry::new("/nonexistent.sock");

        assert!(matches!(
            registry.exists("../images").await,
            Err(RegistryError::InvalidContainerId { .. })
        ));
    }
}
