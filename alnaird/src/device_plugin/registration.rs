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
use super::{plugin_options, PluginEndpoint, API_VERSION};
use proto::deviceplugin::v1beta1::registration_client::RegistrationClient;
use proto::deviceplugin::v1beta1::RegisterRequest;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::info;

/// Address handed to tonic for unix socket channels. The connector ignores it.
const KNOWN_IGNORED_SOCKET_ADDR: &str = "http://[::]:50051";

pub(crate) async fn connect_unix(
    socket: &Path,
) -> std::result::Result<Channel, tonic::transport::Error> {
    let socket = socket.to_path_buf();
    Endpoint::from_static(KNOWN_IGNORED_SOCKET_ADDR)
        .connect_with_connector(service_fn(move |_: Uri| {
            UnixStream::connect(socket.clone())
        }))
        .await
}

/// Announces `endpoint` to kubelet. Only a registered plugin is asked for
/// devices, so any failure here is fatal for the plugin. A kubelet that does
/// not answer within `timeout` counts as a failure.
pub(crate) async fn register_with_kubelet(
    endpoint: &PluginEndpoint,
    timeout: Duration,
) -> Result<()> {
    let failure = |reason: String| DevicePluginError::RegistrationFailure {
        resource_name: endpoint.resource_name.clone(),
        reason,
    };

    let register = async {
        let channel = connect_unix(&endpoint.kubelet_socket).await.map_err(|e| {
            failure(format!("{}: {e}", endpoint.kubelet_socket.display()))
        })?;

        let _ = RegistrationClient::new(channel)
            .register(RegisterRequest {
                version: API_VERSION.into(),
                endpoint: endpoint.socket_name.clone(),
                resource_name: endpoint.resource_name.clone(),
                options: Some(plugin_options()),
            })
            .await
            .map_err(|status| failure(status.message().to_string()))?;
        Ok::<(), DevicePluginError>(())
    };

    tokio::time::timeout(timeout, register).await.map_err(|_| {
        failure(format!(
            "no answer from {} within {timeout:?}",
            endpoint.kubelet_socket.display()
        ))
    })??;

    info!(
        "registered {} device plugin with kubelet at {}",
        endpoint.resource_name,
        endpoint.kubelet_socket.display()
    );
    Ok(())
}
