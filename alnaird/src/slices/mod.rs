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

//! Virtual device identifiers.
//!
//! Each physical device is cut into slices, one set per [ResourceClass].
//! A slice is named `<physical uuid>_<index>`; the owner of a slice is
//! recovered by splitting on the first `_`. Uniqueness follows from the
//! construction, nothing is stored.

use crate::devices::{DeviceInventory, InventoryError, PhysicalDevice};
use proto::deviceplugin::v1beta1::{Device, NumaNode, TopologyInfo};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Size of one memory slice. 1 GiB.
pub const MEMORY_CHUNK_SIZE: u64 = 1 << 30;

/// Compute slices per physical device, one per percent.
pub const COMPUTE_SLICES: u64 = 100;

/// Health reported for every advertised slice.
pub const HEALTHY: &str = "Healthy";

const SEPARATOR: char = '_';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SliceError {
    #[error("malformed virtual device id '{id}', expected <uuid>_<index>")]
    MalformedIdentifier { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Memory,
    Compute,
}

impl ResourceClass {
    /// Number of slices `device` is cut into for this class.
    pub fn slice_count(&self, device: &PhysicalDevice) -> u64 {
        match self {
            ResourceClass::Memory => {
                memory_slice_count(device.total_memory_bytes)
            }
            ResourceClass::Compute => COMPUTE_SLICES,
        }
    }
}

impl Display for ResourceClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceClass::Memory => f.write_str("memory"),
            ResourceClass::Compute => f.write_str("compute"),
        }
    }
}

/// Memory slices for a device, rounding half a chunk up.
pub fn memory_slice_count(total_memory_bytes: u64) -> u64 {
    total_memory_bytes.saturating_add(MEMORY_CHUNK_SIZE / 2) / MEMORY_CHUNK_SIZE
}

pub fn encode(uuid: &str, index: u64) -> String {
    format!("{uuid}{SEPARATOR}{index}")
}

/// Returns the physical uuid owning the virtual device `id`.
pub fn physical_of(id: &str) -> Result<&str, SliceError> {
    match id.split_once(SEPARATOR) {
        Some((uuid, _)) if !uuid.is_empty() => Ok(uuid),
        _ => Err(SliceError::MalformedIdentifier { id: id.to_string() }),
    }
}

/// Virtual device ids of one physical device, in index order.
pub fn virtual_ids(
    device: &PhysicalDevice,
    class: ResourceClass,
) -> impl Iterator<Item = String> + '_ {
    (0..class.slice_count(device)).map(move |index| encode(&device.uuid, index))
}

/// Every slice of every device currently in `inventory`, as advertised to
/// kubelet. Memory slices carry the NUMA node of their device when known.
pub fn enumerate(
    inventory: &dyn DeviceInventory,
    class: ResourceClass,
) -> Result<Vec<Device>, InventoryError> {
    let mut devices = Vec::new();
    for physical in inventory.devices()? {
        let topology = match (class, physical.numa_node) {
            (ResourceClass::Memory, Some(id)) => {
                Some(TopologyInfo { nodes: vec![NumaNode { id }] })
            }
            _ => None,
        };

        devices.extend(virtual_ids(&physical, class).map(|id| Device {
            id,
            health: HEALTHY.into(),
            topology: topology.clone(),
        }));
    }
    Ok(devices)
}
