// Device inventory
//
// Enumerates NVIDIA PCI devices from sysfs and resolves their bound driver.
// Nothing is cached: every call is a fresh scan.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::host::Host;
use crate::error::{MdevError, Result};
use crate::gpu::NVIDIA_VENDOR;

/// PCI address in domain:bus:device.function form, e.g. 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Snapshot of one PCI device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PciDevice {
    pub address: String,
    pub vendor_id: String,
    /// Bound driver, None if unbound
    pub driver: Option<String>,
    /// Whether the device has an entry on the mdev bus
    pub mdev: bool,
}

pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Addresses of every PCI device whose vendor is NVIDIA
pub fn list_nvidia_devices(host: &Host) -> Result<BTreeSet<String>> {
    let root = &host.paths.pci_devices;
    let entries = host.fs.list(root).map_err(|e| MdevError::io(root, e))?;

    let mut devices = BTreeSet::new();
    for address in entries {
        let vendor_node = host.node(host.paths.device_dir(&address).join("vendor"));
        let vendor = match vendor_node.read() {
            Ok(v) => normalize_vendor(&v),
            Err(e) => {
                debug!(address = %address, error = %e, "Skipping device without readable vendor");
                continue;
            }
        };
        if vendor == NVIDIA_VENDOR {
            devices.insert(address);
        }
    }

    debug!(count = devices.len(), "Found NVIDIA PCI devices");
    Ok(devices)
}

/// Driver currently bound to a device
///
/// `NoDriver` means the device exists but is unbound, which callers treat as
/// a valid state.
pub fn driver_of(host: &Host, address: &str) -> Result<String> {
    let device_dir = host.paths.device_dir(address);
    if !host.fs.exists(&device_dir) {
        return Err(MdevError::DeviceNotFound { address: address.to_string() });
    }

    let link = device_dir.join("driver");
    if !host.fs.exists(&link) {
        return Err(MdevError::NoDriver { address: address.to_string() });
    }

    let target = host.fs.read_link(&link).map_err(|e| MdevError::io(&link, e))?;
    target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| MdevError::NoDriver { address: address.to_string() })
}

/// Like `driver_of`, folding `NoDriver` into `None`
pub fn bound_driver(host: &Host, address: &str) -> Result<Option<String>> {
    match driver_of(host, address) {
        Ok(driver) => Ok(Some(driver)),
        Err(MdevError::NoDriver { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Snapshot of the given devices, including unbound and passthrough ones
///
/// Devices that are absent from the bus are listed too, with no vendor.
pub fn describe<'a>(host: &Host, addresses: impl IntoIterator<Item = &'a String>) -> Vec<PciDevice> {
    addresses
        .into_iter()
        .map(|address| {
            let vendor_id = host
                .node(host.paths.device_dir(address).join("vendor"))
                .read()
                .map(|v| normalize_vendor(&v))
                .unwrap_or_default();
            PciDevice {
                address: address.clone(),
                vendor_id,
                driver: bound_driver(host, address).ok().flatten(),
                mdev: host.fs.exists(&host.paths.mdev_entry(address)),
            }
        })
        .collect()
}

fn normalize_vendor(raw: &str) -> String {
    raw.trim().trim_start_matches("0x").to_lowercase()
}
