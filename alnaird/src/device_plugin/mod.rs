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

//! Kubelet device plugins, one per [ResourceClass].
//!
//! Each plugin serves the `v1beta1.DevicePlugin` API on its own socket in
//! the kubelet device plugin directory and registers itself with kubelet
//! once its socket answers.
//!
//! [ResourceClass]: crate::slices::ResourceClass

pub use annotations::{AnnotationError, LogAnnotator, NodeAnnotator};
pub use compute_service::ComputeDevicePlugin;
pub use error::DevicePluginError;
pub use memory_service::{ContainerPaths, MemoryDevicePlugin};
pub use server::{PluginEndpoint, PluginServer};

use crate::allocation::{self, AllocationError};
use proto::deviceplugin::v1beta1::{
    ContainerPreferredAllocationResponse, Device, DevicePluginOptions,
    ListAndWatchResponse, PreferredAllocationRequest,
    PreferredAllocationResponse,
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::{error, trace};

mod annotations;
mod compute_service;
mod error;
mod memory_service;
mod registration;
mod server;

pub const API_VERSION: &str = "v1beta1";
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";
pub const KUBELET_SOCKET: &str = "kubelet.sock";

pub const MEMORY_RESOURCE_NAME: &str = "alnair/vgpu-memory";
pub const MEMORY_SOCKET: &str = "alnair-gpu-mem.sock";
pub const COMPUTE_RESOURCE_NAME: &str = "alnair/vgpu-compute";
pub const COMPUTE_SOCKET: &str = "alnair-gpu-compute.sock";

/// Library preloaded into memory allocated containers to enforce limits.
pub const INTERPOSE_LIB: &str = "/opt/alnair/libcuinterpose.so";

pub const ENV_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";
pub const ENV_ALNAIR_ID: &str = "ALNAIR_ID";
pub const ENV_WORKSPACE_PATH: &str = "ALNAIR_WORKSPACE_PATH";
pub const ENV_ALNAIR_SOCKET: &str = "ALNAIR_SOCKET";
pub const ENV_LD_PRELOAD: &str = "LD_PRELOAD";
pub const ENV_COMPUTE_PERCENTILE: &str = "ALNAIR_VGPU_COMPUTE_PERCENTILE";

type ListAndWatchStream = ReceiverStream<Result<ListAndWatchResponse, Status>>;

pub(crate) fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: true,
    }
}

/// Sends `devices` once, then holds the stream open until `stop` fires or
/// kubelet hangs up. Kubelet reads a closed stream as all devices gone.
pub(crate) fn watch_devices(
    devices: Vec<Device>,
    mut stop: watch::Receiver<()>,
) -> ListAndWatchStream {
    let (tx, rx) = mpsc::channel(1);
    let _ = tokio::spawn(async move {
        if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
            return;
        }
        tokio::select! {
            _ = stop.changed() => trace!("device list stream stopped"),
            _ = tx.closed() => trace!("kubelet closed the device list stream"),
        }
    });
    ReceiverStream::new(rx)
}

/// Answers every container sub-request independently. A sub-request the
/// pool cannot satisfy gets an empty preference; malformed ids reject the
/// whole request.
pub(crate) fn preferred_allocation(
    request: PreferredAllocationRequest,
) -> Result<PreferredAllocationResponse, DevicePluginError> {
    let mut container_responses = Vec::new();
    for container in request.container_requests {
        let count = usize::try_from(container.allocation_size).unwrap_or(0);
        let available = container.available_device_ids.as_slice();
        let device_ids = match allocation::select_preferred(available, count) {
            Ok(selection) => selection.device_ids,
            Err(e @ AllocationError::InsufficientCapacity { .. }) => {
                error!("{e}");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        container_responses
            .push(ContainerPreferredAllocationResponse { device_ids });
    }
    Ok(PreferredAllocationResponse { container_responses })
}
