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

use super::error::DevicePluginError;
use super::{
    plugin_options, preferred_allocation, watch_devices, ListAndWatchStream,
    NodeAnnotator, COMPUTE_RESOURCE_NAME, ENV_COMPUTE_PERCENTILE,
};
use crate::allocation::clamp_percentile;
use crate::devices::DeviceInventory;
use crate::slices::{self, ResourceClass};
use proto::deviceplugin::v1beta1::{
    device_plugin_server::DevicePlugin, AllocateRequest, AllocateResponse,
    ContainerAllocateResponse, DevicePluginOptions, Empty,
    PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

/// Serves `alnair/vgpu-compute`, one slice per percent of a device.
#[derive(Debug, Clone)]
pub struct ComputeDevicePlugin {
    inventory: Arc<dyn DeviceInventory>,
    annotator: Arc<dyn NodeAnnotator>,
    stop: watch::Receiver<()>,
}

impl ComputeDevicePlugin {
    pub fn new(
        inventory: Arc<dyn DeviceInventory>,
        annotator: Arc<dyn NodeAnnotator>,
        stop: watch::Receiver<()>,
    ) -> Self {
        Self { inventory, annotator, stop }
    }
}

#[tonic::async_trait]
impl DevicePlugin for ComputeDevicePlugin {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream = ListAndWatchStream;

    #[tracing::instrument(skip(self))]
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let devices =
            slices::enumerate(self.inventory.as_ref(), ResourceClass::Compute)
                .map_err(DevicePluginError::from)?;
        info!("advertising {} compute slices", devices.len());
        Ok(Response::new(watch_devices(devices, self.stop.clone())))
    }

    #[tracing::instrument(skip(self))]
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(preferred_allocation(request.into_inner())?))
    }

    #[tracing::instrument(skip(self))]
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let mut allocated = Vec::new();
        let mut container_responses = Vec::new();
        for container in request.into_inner().container_requests {
            let percentile = clamp_percentile(container.devices_ids.len());
            info!(percentile, "allocated gpu compute");
            container_responses.push(ContainerAllocateResponse {
                envs: HashMap::from([(
                    ENV_COMPUTE_PERCENTILE.to_string(),
                    percentile.to_string(),
                )]),
                ..Default::default()
            });
            allocated.extend(container.devices_ids);
        }

        if let Err(e) = self
            .annotator
            .record_allocation(COMPUTE_RESOURCE_NAME, &allocated)
            .await
        {
            warn!("failed to annotate allocation: {e}");
        }

        Ok(Response::new(AllocateResponse { container_responses }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_plugin::LogAnnotator;
    use crate::devices::{PhysicalDevice, StaticInventory};
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;
    use proto::deviceplugin::v1beta1::ContainerAllocateRequest;

    fn plugin() -> (ComputeDevicePlugin, watch::Sender<()>) {
        let inventory = StaticInventory::new(vec![
            PhysicalDevice::new("GPU-1", 16 << 30),
            PhysicalDevice::new("GPU-2", 0),
        ]);
        let (tx, rx) = watch::channel(());
        (
            ComputeDevicePlugin::new(
                Arc::new(inventory),
                Arc::new(LogAnnotator),
                rx,
            ),
            tx,
        )
    }

    #[tokio::test]
    async fn list_and_watch_must_advertise_one_hundred_slices_per_device() {
        let (plugin, _tx) = plugin();

        let mut stream = plugin
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream")
            .into_inner();
        let devices = stream.next().await.expect("first").expect("ok").devices;

        assert_eq!(devices.len(), 200);
        assert_eq!(devices[0].id, "GPU-1_0");
        assert_eq!(devices[199].id, "GPU-2_99");
        assert!(devices.iter().all(|d| d.topology.is_none()));
    }

    #[tokio::test]
    async fn allocate_must_expose_the_percentile() {
        let (plugin, _tx) = plugin();
        let cases = [(1, "1"), (40, "40"), (100, "100"), (150, "100")];

        let response = plugin
            .allocate(Request::new(AllocateRequest {
                container_requests: cases
                    .iter()
                    .map(|(slices, _)| ContainerAllocateRequest {
                        devices_ids: (0..*slices)
                            .map(|i| crate::slices::encode("GPU-1", i))
                            .collect(),
                    })
                    .collect(),
            }))
            .await
            .expect("allocate")
            .into_inner();

        assert_eq!(response.container_responses.len(), cases.len());
        for (container, (_, expected)) in
            response.container_responses.iter().zip(cases)
        {
            assert_eq!(container.envs[ENV_COMPUTE_PERCENTILE], expected);
            assert!(container.mounts.is_empty());
        }
    }
}
