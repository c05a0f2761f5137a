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

//! Physical accelerator inventory.
//!
//! The daemon never caches what it finds here. Every caller enumerates again
//! so that only currently present hardware is advertised.

pub use nvml::NvmlInventory;
use thiserror::Error;

mod nvml;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error(transparent)]
    Nvml(#[from] nvml_wrapper::error::NvmlError),
    #[error("device index {index} out of range, inventory holds {count} devices")]
    IndexOutOfRange { index: u32, count: u32 },
}

/// A physical accelerator as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub uuid: String,
    pub total_memory_bytes: u64,
    pub numa_node: Option<i64>,
}

impl PhysicalDevice {
    pub fn new<S: Into<String>>(uuid: S, total_memory_bytes: u64) -> Self {
        Self { uuid: uuid.into(), total_memory_bytes, numa_node: None }
    }

    pub fn with_numa_node(mut self, numa_node: i64) -> Self {
        self.numa_node = Some(numa_node);
        self
    }
}

pub trait DeviceInventory: Send + Sync + std::fmt::Debug {
    /// Number of physical devices currently present.
    fn count(&self) -> Result<u32, InventoryError>;

    /// Describes the device at `index`, in inventory order.
    fn describe(&self, index: u32) -> Result<PhysicalDevice, InventoryError>;

    /// All devices in inventory order.
    fn devices(&self) -> Result<Vec<PhysicalDevice>, InventoryError> {
        (0..self.count()?).map(|index| self.describe(index)).collect()
    }
}

/// Fixed, in-memory inventory.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    devices: Vec<PhysicalDevice>,
}

impl StaticInventory {
    pub fn new(devices: Vec<PhysicalDevice>) -> Self {
        Self { devices }
    }
}

impl DeviceInventory for StaticInventory {
    fn count(&self) -> Result<u32, InventoryError> {
        Ok(self.devices.len() as u32)
    }

    fn describe(&self, index: u32) -> Result<PhysicalDevice, InventoryError> {
        self.devices.get(index as usize).cloned().ok_or(
            InventoryError::IndexOutOfRange {
                index,
                count: self.devices.len() as u32,
            },
        )
    }
}
