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

use super::{DeviceInventory, InventoryError, PhysicalDevice};
use nvml_wrapper::Nvml;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use tracing::trace;

const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Inventory backed by the NVIDIA management library.
pub struct NvmlInventory {
    nvml: Nvml,
    pci_devices: PathBuf,
}

impl NvmlInventory {
    /// Loads libnvidia-ml. Fails on hosts without the NVIDIA driver.
    pub fn init() -> Result<Self, InventoryError> {
        Ok(Self { nvml: Nvml::init()?, pci_devices: SYSFS_PCI_DEVICES.into() })
    }
}

impl Debug for NvmlInventory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmlInventory")
            .field("pci_devices", &self.pci_devices)
            .finish_non_exhaustive()
    }
}

impl DeviceInventory for NvmlInventory {
    fn count(&self) -> Result<u32, InventoryError> {
        Ok(self.nvml.device_count()?)
    }

    fn describe(&self, index: u32) -> Result<PhysicalDevice, InventoryError> {
        let device = self.nvml.device_by_index(index)?;
        let uuid = device.uuid()?;
        let total_memory_bytes = device.memory_info()?.total;
        let numa_node = match device.pci_info() {
            Ok(pci) => numa_node(&self.pci_devices, &pci.bus_id),
            Err(e) => {
                trace!("no pci info for {uuid}: {e}");
                None
            }
        };

        Ok(PhysicalDevice { uuid, total_memory_bytes, numa_node })
    }
}

/// NVML reports an 8 digit PCI domain ("00000000:3B:00.0") where sysfs uses
/// 4 lowercase digits ("0000:3b:00.0"). A node of -1 means no affinity.
fn numa_node(pci_devices: &Path, bus_id: &str) -> Option<i64> {
    let bus_id = bus_id.to_ascii_lowercase();
    let bus_id = match bus_id.split_once(':') {
        Some((domain, rest)) if domain.len() > 4 => {
            format!("{}:{rest}", &domain[domain.len() - 4..])
        }
        _ => bus_id,
    };

    let node = std::fs::read_to_string(pci_devices.join(bus_id).join("numa_node"))
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    (node >= 0).then_some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pci_root_with(bus_id: &str, node: &str) -> PathBuf {
        let root = std::env::temp_dir()
            .join(format!("alnaird-pci-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join(bus_id)).expect("create pci dir");
        std::fs::write(root.join(bus_id).join("numa_node"), node)
            .expect("write numa_node");
        root
    }

    #[test]
    fn numa_node_must_translate_nvml_bus_id() {
        let root = pci_root_with("0000:3b:00.0", "1\n");
        assert_eq!(numa_node(&root, "00000000:3B:00.0"), Some(1));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn numa_node_must_ignore_negative_affinity() {
        let root = pci_root_with("0000:af:00.0", "-1\n");
        assert_eq!(numa_node(&root, "00000000:AF:00.0"), None);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn numa_node_must_be_none_when_sysfs_entry_is_missing() {
        let root = std::env::temp_dir().join("alnaird-pci-missing");
        assert_eq!(numa_node(&root, "00000000:01:00.0"), None);
    }
}
