// PCI device removal and bus rescan (hard recovery)

use tracing::{error, info, warn};

use crate::core::host::Host;
use crate::error::{MdevError, Result};
use crate::gpu::binding::DriverBinder;
use crate::gpu::inventory::bound_driver;

pub struct DeviceLifecycle<'a> {
    host: &'a Host,
}

impl<'a> DeviceLifecycle<'a> {
    pub fn new(host: &'a Host) -> Self {
        Self { host }
    }

    /// Detach and remove each device from the PCI bus
    ///
    /// Strict: the first device that cannot be confirmed detached, or whose
    /// remove control is missing or fails, aborts the batch. Earlier devices
    /// stay removed.
    pub fn remove(&self, addresses: &[String]) -> Result<Vec<String>> {
        let binder = DriverBinder::new(self.host);
        let mut removed = Vec::with_capacity(addresses.len());

        for address in addresses {
            if let Err(e) = binder.unbind_device(address) {
                warn!(address = %address, error = %e, "Unbind before removal failed");
            }

            match bound_driver(self.host, address) {
                Ok(None) => {}
                Ok(Some(driver)) => {
                    error!(address = %address, driver = %driver, "Driver still bound, aborting removal");
                    return Err(MdevError::device(
                        address.as_str(),
                        format!("driver {} still bound after unbind", driver),
                    ));
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Cannot remove device");
                    return Err(e);
                }
            }

            let remove = self.host.node(self.host.paths.device_dir(address).join("remove"));
            if !remove.exists() {
                warn!(address = %address, "Device has no remove control");
                return Err(MdevError::device(address.as_str(), "no remove control"));
            }

            info!(address = %address, "Removing PCI device");
            remove.write("1").map_err(|e| {
                warn!(address = %address, error = %e, "Removal failed");
                MdevError::device(address.as_str(), e.to_string())
            })?;
            removed.push(address.clone());
        }
        Ok(removed)
    }

    /// Ask the kernel to re-enumerate every PCI device
    pub fn rescan_bus(&self) -> Result<()> {
        let rescan = self.host.node(&self.host.paths.pci_rescan);
        if !rescan.exists() {
            return Err(MdevError::BusControlMissing { path: rescan.path().to_path_buf() });
        }
        info!("Rescanning PCI bus");
        rescan.write("1")
    }
}
