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

use super::error::{DevicePluginError, Result};
use super::registration::{connect_unix, register_with_kubelet};
use proto::deviceplugin::v1beta1::device_plugin_server::{
    DevicePlugin, DevicePluginServer,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, trace};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a plugin listens and which resource it announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEndpoint {
    pub resource_name: String,
    /// File name of the plugin socket inside `device_plugin_dir`.
    pub socket_name: String,
    pub device_plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
}

impl PluginEndpoint {
    pub fn socket(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.socket_name)
    }
}

/// Lifecycle of one device plugin: bind, serve, wait until the socket
/// answers, register with kubelet, serve until shutdown.
#[derive(Debug)]
pub struct PluginServer<S> {
    endpoint: PluginEndpoint,
    service: S,
}

impl<S: DevicePlugin> PluginServer<S> {
    pub fn new(endpoint: PluginEndpoint, service: S) -> Self {
        Self { endpoint, service }
    }

    /// Starts serving and registers with kubelet. The returned handle
    /// resolves once the server has stopped after `shutdown` fired.
    ///
    /// A plugin kubelet does not know about is useless, so a failed
    /// registration stops the server and is returned as an error.
    pub async fn start(
        self,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<JoinHandle<Result<()>>> {
        let socket = self.endpoint.socket();
        let failed_to_bind = |source: std::io::Error| DevicePluginError::FailedToBind {
            socket: socket.clone(),
            source,
        };

        match fs::remove_file(&socket) {
            Ok(()) => trace!("removed stale socket {}", socket.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(failed_to_bind(e)),
        }
        fs::create_dir_all(&self.endpoint.device_plugin_dir)
            .map_err(failed_to_bind)?;
        let listener = UnixListener::bind(&socket).map_err(failed_to_bind)?;
        let incoming = UnixListenerStream::new(listener);

        let (mut health_reporter, health_service) =
            tonic_health::server::health_reporter();
        health_reporter.set_serving::<DevicePluginServer<S>>().await;

        let resource_name = self.endpoint.resource_name.clone();
        let stopping = resource_name.clone();
        let plugin = DevicePluginServer::new(self.service);
        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(health_service)
                .add_service(plugin)
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = shutdown.changed().await;
                    health_reporter
                        .set_not_serving::<DevicePluginServer<S>>()
                        .await;
                    info!("stopping {stopping} device plugin");
                })
                .await
                .map_err(|source| DevicePluginError::ServeFailure {
                    resource_name,
                    source,
                })
        });

        if let Err(e) = wait_until_ready(&socket).await {
            handle.abort();
            return Err(e);
        }

        if let Err(e) =
            register_with_kubelet(&self.endpoint, DIAL_TIMEOUT).await
        {
            handle.abort();
            let _ = fs::remove_file(&socket);
            return Err(e);
        }

        info!(
            "{} device plugin serving on {}",
            self.endpoint.resource_name,
            socket.display()
        );
        Ok(handle)
    }
}

async fn wait_until_ready(socket: &Path) -> Result<()> {
    match tokio::time::timeout(DIAL_TIMEOUT, connect_unix(socket)).await {
        Ok(Ok(_channel)) => Ok(()),
        Ok(Err(source)) => {
            Err(DevicePluginError::Dial { socket: socket.to_path_buf(), source })
        }
        Err(_) => {
            Err(DevicePluginError::DialTimeout { socket: socket.to_path_buf() })
        }
    }
}
