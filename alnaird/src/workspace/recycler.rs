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

use super::{Result, WorkspaceManager};
use crate::registry::ContainerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_RECYCLE_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically reclaims workspaces whose container is gone.
///
/// Unbound workspaces are never touched: the workload may still be starting.
/// A registry lookup that fails keeps the workspace for the next sweep.
#[derive(Debug)]
pub struct Recycler {
    workspaces: WorkspaceManager,
    registry: Arc<dyn ContainerRegistry>,
    interval: Duration,
}

impl Recycler {
    pub fn new(
        workspaces: WorkspaceManager,
        registry: Arc<dyn ContainerRegistry>,
        interval: Duration,
    ) -> Self {
        Self { workspaces, registry, interval }
    }

    /// A single pass over all workspaces. Returns how many were reclaimed.
    pub async fn sweep(&self) -> Result<usize> {
        let mut reclaimed = 0;
        let ids =
            self.workspaces.blocking(|workspaces| workspaces.list()).await?;
        for id in ids {
            let lookup = {
                let id = id.clone();
                self.workspaces
                    .blocking(move |workspaces| workspaces.container_id(&id))
                    .await
            };
            let container_id = match lookup {
                Ok(Some(container_id)) => container_id,
                Ok(None) => {
                    trace!("workspace {id} not bound yet");
                    continue;
                }
                Err(e) => {
                    warn!("skipping workspace {id}: {e}");
                    continue;
                }
            };

            match self.registry.exists(&container_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("container {container_id} of workspace {id} is gone");
                    let reclaim = {
                        let id = id.clone();
                        self.workspaces
                            .blocking(move |workspaces| workspaces.reclaim(&id))
                            .await
                    };
                    match reclaim {
                        Ok(()) => reclaimed += 1,
                        Err(e) => error!("{e}"),
                    }
                }
                Err(e) => {
                    warn!("failed to look up container {container_id}: {e}");
                }
            }
        }
        Ok(reclaimed)
    }

    /// Sweeps every interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        info!(
            "recycling workspaces under {} every {:?}",
            self.workspaces.root().display(),
            self.interval
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(n) => info!("reclaimed {n} workspaces"),
                        Err(e) => error!("{e}"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("workspace recycler stopped");
                    return;
                }
            }
        }
    }
}
