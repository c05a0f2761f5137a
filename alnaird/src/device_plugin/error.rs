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

use crate::allocation::AllocationError;
use crate::devices::InventoryError;
use crate::slices::SliceError;
use std::path::PathBuf;
use thiserror::Error;
use tonic::Status;
use tracing::error;

pub(crate) type Result<T> = std::result::Result<T, DevicePluginError>;

#[derive(Debug, Error)]
pub enum DevicePluginError {
    #[error("failed to bind device plugin socket '{socket}': {source}")]
    FailedToBind { socket: PathBuf, source: std::io::Error },
    #[error("failed to dial '{socket}': {source}")]
    Dial { socket: PathBuf, source: tonic::transport::Error },
    #[error("timed out dialing '{socket}'")]
    DialTimeout { socket: PathBuf },
    #[error("failed to register {resource_name} with kubelet: {reason}")]
    RegistrationFailure { resource_name: String, reason: String },
    #[error("{resource_name} device plugin server failed: {source}")]
    ServeFailure { resource_name: String, source: tonic::transport::Error },
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Slice(#[from] SliceError),
}

impl From<DevicePluginError> for Status {
    fn from(err: DevicePluginError) -> Self {
        let msg = err.to_string();
        error!("{msg}");
        match err {
            DevicePluginError::Slice(SliceError::MalformedIdentifier {
                ..
            })
            | DevicePluginError::Allocation(AllocationError::Slice(
                SliceError::MalformedIdentifier { .. },
            )) => Status::invalid_argument(msg),
            DevicePluginError::Allocation(
                AllocationError::InsufficientCapacity { .. },
            ) => Status::out_of_range(msg),
            DevicePluginError::FailedToBind { .. }
            | DevicePluginError::Dial { .. }
            | DevicePluginError::DialTimeout { .. }
            | DevicePluginError::RegistrationFailure { .. }
            | DevicePluginError::ServeFailure { .. }
            | DevicePluginError::Inventory(_) => Status::internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn malformed_ids_are_invalid_arguments() {
        let status: Status = DevicePluginError::from(
            SliceError::MalformedIdentifier { id: "GPU-1".into() },
        )
        .into();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test]
    fn exhausted_pools_are_out_of_range() {
        let status: Status = DevicePluginError::from(
            AllocationError::InsufficientCapacity { requested: 4, available: 2 },
        )
        .into();
        assert_eq!(status.code(), Code::OutOfRange);
    }

    #[test]
    fn inventory_failures_are_internal() {
        let status: Status = DevicePluginError::from(
            InventoryError::IndexOutOfRange { index: 3, count: 1 },
        )
        .into();
        assert_eq!(status.code(), Code::Internal);
    }
}
