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

use alnaird::device_plugin::{
    ComputeDevicePlugin, ContainerPaths, DevicePluginError, LogAnnotator,
    MemoryDevicePlugin, PluginEndpoint, PluginServer, COMPUTE_RESOURCE_NAME,
    COMPUTE_SOCKET, ENV_ALNAIR_ID, ENV_VISIBLE_DEVICES, MEMORY_RESOURCE_NAME,
    MEMORY_SOCKET,
};
use alnaird::devices::{PhysicalDevice, StaticInventory};
use alnaird::slices::MEMORY_CHUNK_SIZE;
use alnaird::workspace::{AlnairId, WorkspaceManager};
use common::{connect_unix, scratch_dir, FakeKubelet};
use pretty_assertions::assert_eq;
use proto::deviceplugin::v1beta1::device_plugin_client::DevicePluginClient;
use proto::deviceplugin::v1beta1::{
    AllocateRequest, ContainerAllocateRequest,
    ContainerPreferredAllocationRequest, Empty, PreferredAllocationRequest,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

mod common;

fn endpoint(dir: &Path, resource_name: &str, socket_name: &str) -> PluginEndpoint {
    PluginEndpoint {
        resource_name: resource_name.into(),
        socket_name: socket_name.into(),
        device_plugin_dir: dir.to_path_buf(),
        kubelet_socket: dir.join("kubelet.sock"),
    }
}

fn inventory() -> Arc<StaticInventory> {
    Arc::new(StaticInventory::new(vec![PhysicalDevice::new(
        "GPU-1",
        3 * MEMORY_CHUNK_SIZE,
    )]))
}

#[tokio::test]
async fn memory_plugin_must_register_advertise_and_allocate() {
    let dir = scratch_dir("device-plugin");
    let kubelet = FakeKubelet::default();
    let _ = kubelet.serve(&dir);
    let workspaces = WorkspaceManager::new(dir.join("workspace"));
    let (tx, rx) = watch::channel(());

    let plugin = MemoryDevicePlugin::new(
        inventory(),
        workspaces.clone(),
        Arc::new(LogAnnotator),
        ContainerPaths::default(),
        rx.clone(),
    );
    let handle = PluginServer::new(
        endpoint(&dir, MEMORY_RESOURCE_NAME, MEMORY_SOCKET),
        plugin,
    )
    .start(rx)
    .await
    .expect("plugin failed to start");

    let registered = kubelet.registered();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].version, "v1beta1");
    assert_eq!(registered[0].endpoint, MEMORY_SOCKET);
    assert_eq!(registered[0].resource_name, MEMORY_RESOURCE_NAME);
    assert!(
        registered[0]
            .options
            .as_ref()
            .expect("options")
            .get_preferred_allocation_available
    );

    let mut client =
        DevicePluginClient::new(connect_unix(&dir.join(MEMORY_SOCKET)).await);

    let mut devices = client
        .list_and_watch(Empty {})
        .await
        .expect("list_and_watch")
        .into_inner();
    let first = devices.message().await.expect("stream").expect("devices");
    let ids: Vec<&str> = first.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["GPU-1_0", "GPU-1_1", "GPU-1_2"]);
    assert!(first.devices.iter().all(|d| d.health == "Healthy"));

    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["GPU-1_0".into(), "GPU-1_1".into()],
            }],
        })
        .await
        .expect("allocate")
        .into_inner();
    let envs = &response.container_responses[0].envs;
    assert_eq!(envs[ENV_VISIBLE_DEVICES], "GPU-1");
    let id = AlnairId::parse(&envs[ENV_ALNAIR_ID]).expect("alnair id");
    assert_eq!(
        workspaces.limits(&id).expect("limits"),
        format!("vmem:{}", 2 * MEMORY_CHUNK_SIZE)
    );

    let _ = tx.send(());
    let end = tokio::time::timeout(Duration::from_secs(5), devices.message())
        .await
        .expect("device stream still open after shutdown");
    assert!(!matches!(end, Ok(Some(_))));

    drop(devices);
    drop(client);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("plugin did not stop")
        .expect("join")
        .expect("serve");

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn compute_plugin_must_prefer_a_single_device() {
    let dir = scratch_dir("device-plugin");
    let kubelet = FakeKubelet::default();
    let _ = kubelet.serve(&dir);
    let (_tx, rx) = watch::channel(());

    let plugin =
        ComputeDevicePlugin::new(inventory(), Arc::new(LogAnnotator), rx.clone());
    let _handle = PluginServer::new(
        endpoint(&dir, COMPUTE_RESOURCE_NAME, COMPUTE_SOCKET),
        plugin,
    )
    .start(rx)
    .await
    .expect("plugin failed to start");

    assert_eq!(kubelet.registered()[0].resource_name, COMPUTE_RESOURCE_NAME);

    let mut client =
        DevicePluginClient::new(connect_unix(&dir.join(COMPUTE_SOCKET)).await);
    let options = client
        .get_device_plugin_options(Empty {})
        .await
        .expect("options")
        .into_inner();
    assert!(options.get_preferred_allocation_available);
    assert!(!options.pre_start_required);

    let preferred = client
        .get_preferred_allocation(PreferredAllocationRequest {
            container_requests: vec![ContainerPreferredAllocationRequest {
                available_device_ids: vec![
                    "GPU-2_7".into(),
                    "GPU-1_3".into(),
                    "GPU-2_5".into(),
                    "GPU-2_6".into(),
                ],
                must_include_device_ids: vec![],
                allocation_size: 3,
            }],
        })
        .await
        .expect("preferred allocation")
        .into_inner();

    assert_eq!(
        preferred.container_responses[0].device_ids,
        vec!["GPU-2_5", "GPU-2_6", "GPU-2_7"]
    );

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn plugin_must_not_start_without_kubelet() {
    let dir = scratch_dir("device-plugin");
    let (_tx, rx) = watch::channel(());

    let plugin =
        ComputeDevicePlugin::new(inventory(), Arc::new(LogAnnotator), rx.clone());
    let result = PluginServer::new(
        endpoint(&dir, COMPUTE_RESOURCE_NAME, COMPUTE_SOCKET),
        plugin,
    )
    .start(rx)
    .await;

    assert!(matches!(
        result,
        Err(DevicePluginError::RegistrationFailure { .. })
    ));
    assert!(!dir.join(COMPUTE_SOCKET).exists());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn plugin_must_replace_a_stale_socket() {
    let dir = scratch_dir("device-plugin");
    let kubelet = FakeKubelet::default();
    let _ = kubelet.serve(&dir);
    std::fs::write(dir.join(MEMORY_SOCKET), "stale").expect("stale socket");
    let (_tx, rx) = watch::channel(());

    let plugin = MemoryDevicePlugin::new(
        inventory(),
        WorkspaceManager::new(dir.join("workspace")),
        Arc::new(LogAnnotator),
        ContainerPaths::default(),
        rx.clone(),
    );
    let _handle = PluginServer::new(
        endpoint(&dir, MEMORY_RESOURCE_NAME, MEMORY_SOCKET),
        plugin,
    )
    .start(rx)
    .await
    .expect("plugin failed to start");

    assert_eq!(kubelet.registered().len(), 1);

    let _ = std::fs::remove_dir_all(dir);
}
