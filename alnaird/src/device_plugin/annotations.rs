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

use crate::devices::PhysicalDevice;
use crate::slices::memory_slice_count;
use std::fmt::Debug;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Publishes node level facts about the device plugin to the cluster.
///
/// Every call is best-effort. Failures are logged by the caller and never
/// fail the request that triggered them.
#[tonic::async_trait]
pub trait NodeAnnotator: Send + Sync + Debug {
    /// Called once at startup with the physical devices found on the node.
    async fn publish_inventory(
        &self,
        devices: &[PhysicalDevice],
    ) -> Result<(), AnnotationError>;

    /// Called after every successful allocation.
    async fn record_allocation(
        &self,
        resource_name: &str,
        device_ids: &[String],
    ) -> Result<(), AnnotationError>;
}

/// [NodeAnnotator] emitting structured log events only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnnotator;

#[tonic::async_trait]
impl NodeAnnotator for LogAnnotator {
    async fn publish_inventory(
        &self,
        devices: &[PhysicalDevice],
    ) -> Result<(), AnnotationError> {
        for device in devices {
            info!(
                uuid = %device.uuid,
                memory_slices = memory_slice_count(device.total_memory_bytes),
                "gpu inventory"
            );
        }
        Ok(())
    }

    async fn record_allocation(
        &self,
        resource_name: &str,
        device_ids: &[String],
    ) -> Result<(), AnnotationError> {
        info!(
            resource = resource_name,
            slices = device_ids.len(),
            devices = %device_ids.join(","),
            "allocation"
        );
        Ok(())
    }
}
