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
    NodeAnnotator, ENV_ALNAIR_ID, ENV_ALNAIR_SOCKET, ENV_LD_PRELOAD,
    ENV_VISIBLE_DEVICES, ENV_WORKSPACE_PATH, INTERPOSE_LIB,
    MEMORY_RESOURCE_NAME,
};
use crate::allocation;
use crate::cgroup_server::ALNAIR_SOCKET;
use crate::devices::DeviceInventory;
use crate::slices::{self, ResourceClass, MEMORY_CHUNK_SIZE};
use crate::workspace::{
    vmem_limit, AlnairId, WorkspaceManager, ALNAIR_WORKSPACE_ROOT,
};
use proto::deviceplugin::v1beta1::{
    device_plugin_server::DevicePlugin, AllocateRequest, AllocateResponse,
    ContainerAllocateResponse, DevicePluginOptions, Empty, Mount,
    PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

/// Paths exposed to memory allocated containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPaths {
    /// Where the workspace is mounted inside the container.
    pub workspace: String,
    /// Registration socket, mounted at the same path.
    pub alnair_socket: String,
    /// Enforcement library, mounted at the same path and preloaded.
    pub interpose_lib: String,
}

impl Default for ContainerPaths {
    fn default() -> Self {
        Self {
            workspace: ALNAIR_WORKSPACE_ROOT.into(),
            alnair_socket: ALNAIR_SOCKET.into(),
            interpose_lib: INTERPOSE_LIB.into(),
        }
    }
}

/// Serves `alnair/vgpu-memory`, one slice per GiB of device memory.
#[derive(Debug, Clone)]
pub struct MemoryDevicePlugin {
    inventory: Arc<dyn DeviceInventory>,
    workspaces: WorkspaceManager,
    annotator: Arc<dyn NodeAnnotator>,
    paths: ContainerPaths,
    stop: watch::Receiver<()>,
}

impl MemoryDevicePlugin {
    pub fn new(
        inventory: Arc<dyn DeviceInventory>,
        workspaces: WorkspaceManager,
        annotator: Arc<dyn NodeAnnotator>,
        paths: ContainerPaths,
        stop: watch::Receiver<()>,
    ) -> Self {
        Self { inventory, workspaces, annotator, paths, stop }
    }

    async fn allocate_container(
        &self,
        physical: Vec<String>,
        slice_count: usize,
    ) -> ContainerAllocateResponse {
        let limits = vmem_limit(slice_count as u64 * MEMORY_CHUNK_SIZE);
        let created = {
            let limits = limits.clone();
            self.workspaces
                .blocking(move |workspaces| workspaces.create(&limits))
                .await
        };
        let workspace = match created {
            Ok(workspace) => workspace,
            Err(e) => {
                // The container still starts, only without enforced limits.
                error!("{e}");
                self.workspaces.workspace(AlnairId::random())
            }
        };
        let visible_devices = physical.join(",");
        info!(
            alnair_id = %workspace.id,
            devices = %visible_devices,
            limits = %limits,
            "allocated gpu memory"
        );

        let envs = HashMap::from([
            (ENV_VISIBLE_DEVICES.to_string(), visible_devices),
            (ENV_ALNAIR_ID.to_string(), workspace.id.to_string()),
            (ENV_WORKSPACE_PATH.to_string(), self.paths.workspace.clone()),
            (ENV_ALNAIR_SOCKET.to_string(), self.paths.alnair_socket.clone()),
            (ENV_LD_PRELOAD.to_string(), self.paths.interpose_lib.clone()),
        ]);
        let mounts = vec![
            Mount {
                container_path: self.paths.workspace.clone(),
                host_path: workspace.host_path.display().to_string(),
                read_only: false,
            },
            Mount {
                container_path: self.paths.interpose_lib.clone(),
                host_path: self.paths.interpose_lib.clone(),
                read_only: false,
            },
            Mount {
                container_path: self.paths.alnair_socket.clone(),
                host_path: self.paths.alnair_socket.clone(),
                read_only: false,
            },
        ];

        ContainerAllocateResponse {
            envs,
            mounts,
            devices: vec![],
            annotations: HashMap::new(),
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for MemoryDevicePlugin {
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
            slices::enumerate(self.inventory.as_ref(), ResourceClass::Memory)
                .map_err(DevicePluginError::from)?;
        info!("advertising {} memory slices", devices.len());
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
        let request = request.into_inner();

        // Reject malformed requests before any workspace exists.
        let mut containers = Vec::with_capacity(request.container_requests.len());
        for container in request.container_requests {
            let physical = allocation::realize(&container.devices_ids)
                .map_err(DevicePluginError::from)?;
            containers.push((physical, container.devices_ids));
        }

        let mut allocated = Vec::new();
        let mut container_responses = Vec::with_capacity(containers.len());
        for (physical, devices_ids) in containers {
            let response =
                self.allocate_container(physical, devices_ids.len()).await;
            container_responses.push(response);
            allocated.extend(devices_ids);
        }

        if let Err(e) = self
            .annotator
            .record_allocation(MEMORY_RESOURCE_NAME, &allocated)
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
