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

//! GPU sharing device plugin daemon.
//!
//! Advertises fractional GPUs (1 GiB memory slices and 1% compute slices)
//! to kubelet, prepares a workspace with the enforced limits for every
//! memory allocation, binds workspaces to the workloads that register over
//! a unix socket, and reclaims workspaces once their container is gone.

#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
#![warn(clippy::unwrap_used)]

use crate::cgroup_server::{CgroupBinder, CgroupServer};
use crate::device_plugin::{
    ComputeDevicePlugin, ContainerPaths, LogAnnotator, MemoryDevicePlugin,
    NodeAnnotator, PluginEndpoint, PluginServer, COMPUTE_RESOURCE_NAME,
    COMPUTE_SOCKET, MEMORY_RESOURCE_NAME, MEMORY_SOCKET,
};
use crate::devices::{DeviceInventory, NvmlInventory};
use crate::graceful_shutdown::GracefulShutdown;
use crate::registry::DockerRegistry;
use crate::workspace::{Recycler, WorkspaceManager};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

pub mod allocation;
pub mod cgroup_server;
pub mod device_plugin;
pub mod devices;
mod graceful_shutdown;
pub mod init;
pub mod registry;
pub mod slices;
pub mod workspace;

const EXIT_OKAY: i32 = 0;
const EXIT_ERROR: i32 = 1;

/// Command line options for alnaird.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct AlnairdOptions {
    /// Kubelet device plugin directory holding the plugin sockets.
    #[clap(long, default_value = device_plugin::DEVICE_PLUGIN_PATH)]
    pub device_plugin_dir: PathBuf,
    /// Kubelet registration socket. Defaults to kubelet.sock in the device
    /// plugin directory.
    #[clap(long)]
    pub kubelet_socket: Option<PathBuf>,
    /// Host directory holding the per allocation workspaces.
    #[clap(long, default_value = workspace::ALNAIR_WORKSPACE_ROOT)]
    pub workspace_root: PathBuf,
    /// Socket workloads register their cgroup on.
    #[clap(long, default_value = cgroup_server::ALNAIR_SOCKET)]
    pub cgroup_socket: PathBuf,
    /// Memory cgroup hierarchy registered cgroup paths are resolved in.
    #[clap(long, default_value = cgroup_server::CGROUP_MEMORY_ROOT)]
    pub cgroup_root: PathBuf,
    /// Enforcement library preloaded into memory allocated containers.
    #[clap(long, default_value = device_plugin::INTERPOSE_LIB)]
    pub interpose_lib: String,
    /// Docker Engine API socket used to find gone containers.
    #[clap(long, default_value = registry::DOCKER_SOCKET)]
    pub docker_socket: PathBuf,
    /// Seconds between two workspace reclamation sweeps.
    #[clap(long, default_value_t = workspace::DEFAULT_RECYCLE_INTERVAL.as_secs())]
    pub recycle_interval_secs: u64,
    /// Toggle verbosity. Default false
    #[clap(short, long)]
    pub verbose: bool,
}

impl AlnairdOptions {
    fn kubelet_socket(&self) -> PathBuf {
        self.kubelet_socket.clone().unwrap_or_else(|| {
            self.device_plugin_dir.join(device_plugin::KUBELET_SOCKET)
        })
    }
}

pub async fn daemon() -> i32 {
    let options = AlnairdOptions::parse();

    if let Err(e) = init::init(options.verbose) {
        eprintln!("failed to initialize alnaird: {e}");
        return EXIT_ERROR;
    }

    info!("Starting Alnair Daemon");
    info!("Options: {options:#?}");
    info!("Alnair Daemon is pid {}", std::process::id());

    let inventory = match NvmlInventory::init() {
        Ok(inventory) => Arc::new(inventory),
        Err(e) => {
            error!("failed to open the gpu inventory: {e}");
            return EXIT_ERROR;
        }
    };

    let runtime = AlnairdRuntime::new(&options, inventory, Arc::new(LogAnnotator));
    match runtime.run().await {
        Ok(()) => EXIT_OKAY,
        Err(e) => {
            error!("{e:?}");
            EXIT_ERROR
        }
    }
}

/// Wiring of one daemon instance. Every path can be pointed elsewhere,
/// which is how the integration tests run the daemon.
#[derive(Debug)]
pub struct AlnairdRuntime {
    pub device_plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    pub cgroup_socket: PathBuf,
    pub cgroup_root: PathBuf,
    pub docker_socket: PathBuf,
    pub recycle_interval: Duration,
    pub workspaces: WorkspaceManager,
    pub container_paths: ContainerPaths,
    pub inventory: Arc<dyn DeviceInventory>,
    pub annotator: Arc<dyn NodeAnnotator>,
}

impl AlnairdRuntime {
    pub fn new(
        options: &AlnairdOptions,
        inventory: Arc<dyn DeviceInventory>,
        annotator: Arc<dyn NodeAnnotator>,
    ) -> Self {
        Self {
            device_plugin_dir: options.device_plugin_dir.clone(),
            kubelet_socket: options.kubelet_socket(),
            cgroup_socket: options.cgroup_socket.clone(),
            cgroup_root: options.cgroup_root.clone(),
            docker_socket: options.docker_socket.clone(),
            recycle_interval: Duration::from_secs(options.recycle_interval_secs),
            workspaces: WorkspaceManager::new(&options.workspace_root),
            container_paths: ContainerPaths {
                alnair_socket: options.cgroup_socket.display().to_string(),
                interpose_lib: options.interpose_lib.clone(),
                ..Default::default()
            },
            inventory,
            annotator,
        }
    }

    fn endpoint(&self, resource_name: &str, socket_name: &str) -> PluginEndpoint {
        PluginEndpoint {
            resource_name: resource_name.into(),
            socket_name: socket_name.into(),
            device_plugin_dir: self.device_plugin_dir.clone(),
            kubelet_socket: self.kubelet_socket.clone(),
        }
    }

    /// Runs until SIGTERM or SIGINT, or until a server fails.
    pub async fn run(self) -> anyhow::Result<()> {
        trace!("{self:#?}");
        let shutdown = GracefulShutdown::new();

        match self.inventory.devices() {
            Ok(devices) => {
                if let Err(e) = self.annotator.publish_inventory(&devices).await
                {
                    warn!("failed to publish gpu inventory: {e}");
                }
            }
            Err(e) => warn!("failed to read gpu inventory: {e}"),
        }

        self.workspaces.ensure_root().with_context(|| {
            format!(
                "failed to create workspace root {}",
                self.workspaces.root().display()
            )
        })?;

        let cgroup_server = CgroupServer::bind(
            &self.cgroup_socket,
            CgroupBinder::new(&self.cgroup_root, self.workspaces.clone()),
        )?;
        let cgroup_handle = tokio::spawn(cgroup_server.serve(shutdown.subscribe()));

        let recycler = Recycler::new(
            self.workspaces.clone(),
            Arc::new(DockerRegistry::new(&self.docker_socket)),
            self.recycle_interval,
        );
        let recycler_handle = tokio::spawn(recycler.run(shutdown.subscribe()));

        let memory_handle = PluginServer::new(
            self.endpoint(MEMORY_RESOURCE_NAME, MEMORY_SOCKET),
            MemoryDevicePlugin::new(
                self.inventory.clone(),
                self.workspaces.clone(),
                self.annotator.clone(),
                self.container_paths.clone(),
                shutdown.subscribe(),
            ),
        )
        .start(shutdown.subscribe())
        .await?;

        let compute_handle = PluginServer::new(
            self.endpoint(COMPUTE_RESOURCE_NAME, COMPUTE_SOCKET),
            ComputeDevicePlugin::new(
                self.inventory.clone(),
                self.annotator.clone(),
                shutdown.subscribe(),
            ),
        )
        .start(shutdown.subscribe())
        .await?;

        let _ = tokio::try_join!(
            flatten(memory_handle),
            flatten(compute_handle),
            flatten(cgroup_handle),
            async { recycler_handle.await.map_err(anyhow::Error::from) },
            async { shutdown.wait().await.map_err(anyhow::Error::from) },
        )?;

        info!("alnaird stopped");
        Ok(())
    }
}

async fn flatten<E>(handle: JoinHandle<Result<(), E>>) -> anyhow::Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    handle.await?.map_err(anyhow::Error::from)
}
