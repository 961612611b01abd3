// Driver binding management
//
// Binds and unbinds PCI devices through the driver registry's `bind` and
// `unbind` controls. One stuck device never stops the rest of the batch; a
// driver with no control interface at all aborts the whole batch.

use tracing::{debug, info, warn};

use crate::core::host::Host;
use crate::error::{MdevError, Result};
use crate::gpu::inventory::driver_of;
use crate::gpu::modules::ModuleCoordinator;
use crate::gpu::{module_for_driver, NVIDIA_DRIVER, NVIDIA_VGPU_MODULE};

/// Per-device results of a bind or unbind batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub done: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Binds and unbinds devices
pub struct DriverBinder<'a> {
    host: &'a Host,
}

impl<'a> DriverBinder<'a> {
    pub fn new(host: &'a Host) -> Self {
        Self { host }
    }

    /// Unbind `driver` from each address currently attached to it
    ///
    /// Addresses not bound to the driver are skipped with a warning.
    /// Fails with `DriverNotLoaded` when the driver has no unbind control.
    pub fn unbind(&self, driver: &str, addresses: &[String]) -> Result<BatchOutcome> {
        if !self.host.fs.exists(&self.host.paths.driver_dir(driver).join("unbind")) {
            return Err(MdevError::DriverNotLoaded { driver: driver.to_string() });
        }

        let mut outcome = BatchOutcome::default();
        for address in addresses {
            match self.unbind_one(driver, address) {
                Ok(true) => outcome.done.push(address.clone()),
                Ok(false) => {
                    warn!(address = %address, driver = %driver, "Device not bound to driver, skipping unbind");
                    outcome.skipped.push(address.clone());
                }
                Err(e) => {
                    warn!(address = %address, driver = %driver, error = %e, "Unbind failed");
                    outcome.failed.push((address.clone(), e.to_string()));
                }
            }
        }
        Ok(outcome)
    }

    /// Bind each address to `driver`, loading its module first if needed
    ///
    /// Binding to `nvidia` also loads the vGPU companion module. Fails with
    /// `DriverMissing`, before any device is touched, when the driver still
    /// has no bind control after the load attempt.
    pub fn bind(&self, driver: &str, addresses: &[String]) -> Result<BatchOutcome> {
        self.ensure_driver(driver)?;
        let bind = self.host.node(self.host.paths.driver_dir(driver).join("bind"));

        let mut outcome = BatchOutcome::default();
        for address in addresses {
            let override_node =
                self.host.node(self.host.paths.device_dir(address).join("driver_override"));
            debug!(address = %address, driver = %driver, "Setting driver_override");
            if let Err(e) = override_node.write(driver) {
                warn!(address = %address, error = %e, "Could not set driver_override");
                outcome.failed.push((address.clone(), e.to_string()));
                continue;
            }

            if self.host.fs.exists(&self.host.paths.driver_dir(driver).join(address)) {
                info!(address = %address, driver = %driver, "Device already bound");
                outcome.done.push(address.clone());
                continue;
            }

            info!(address = %address, driver = %driver, "Binding device");
            match bind.write(address) {
                Ok(()) => outcome.done.push(address.clone()),
                Err(e) => {
                    warn!(address = %address, driver = %driver, error = %e, "Bind failed");
                    outcome.failed.push((address.clone(), e.to_string()));
                }
            }
        }
        Ok(outcome)
    }

    /// Unbind each address from whatever driver currently holds it
    pub fn unbind_from_current_driver(&self, addresses: &[String]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for address in addresses {
            match self.unbind_device(address) {
                Ok(Some(_)) => outcome.done.push(address.clone()),
                Ok(None) => {
                    debug!(address = %address, "No driver bound");
                    outcome.skipped.push(address.clone());
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Unbind failed");
                    outcome.failed.push((address.clone(), e.to_string()));
                }
            }
        }
        Ok(outcome)
    }

    /// Detach one device from its current driver
    ///
    /// Returns the driver it was detached from, None if it was unbound.
    pub fn unbind_device(&self, address: &str) -> Result<Option<String>> {
        let driver = match driver_of(self.host, address) {
            Ok(driver) => driver,
            Err(MdevError::NoDriver { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !self.host.fs.exists(&self.host.paths.driver_dir(&driver).join("unbind")) {
            return Err(MdevError::DriverNotLoaded { driver });
        }
        Ok(self.unbind_one(&driver, address)?.then_some(driver))
    }

    /// Write one address to the driver's unbind control; false if it was not bound
    fn unbind_one(&self, driver: &str, address: &str) -> Result<bool> {
        let driver_dir = self.host.paths.driver_dir(driver);
        if !self.host.fs.exists(&driver_dir.join(address)) {
            return Ok(false);
        }
        info!(address = %address, driver = %driver, "Unbinding device");
        self.host
            .node(driver_dir.join("unbind"))
            .write(address)
            .map_err(|e| MdevError::device(address, e.to_string()))?;
        Ok(true)
    }

    fn ensure_driver(&self, driver: &str) -> Result<()> {
        let bind_path = self.host.paths.driver_dir(driver).join("bind");
        if self.host.fs.exists(&bind_path) {
            return Ok(());
        }

        info!(driver = %driver, "Driver not loaded, loading its module");
        let coordinator = ModuleCoordinator::new(self.host);
        if let Err(e) = coordinator.load(&module_for_driver(driver)) {
            warn!(driver = %driver, error = %e, "Module load failed");
        }
        if !self.host.fs.exists(&bind_path) {
            return Err(MdevError::DriverMissing { driver: driver.to_string() });
        }
        if driver == NVIDIA_DRIVER {
            coordinator.load(NVIDIA_VGPU_MODULE)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fake::{FakeHost, VGPU_MODULES};

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let fake = FakeHost::new()
            .device("0000:01:00.0")
            .device("0000:02:00.0")
            .boot(&VGPU_MODULES);
        let host = fake.host();
        let binder = DriverBinder::new(&host);
        let devices = addrs(&["0000:01:00.0", "0000:02:00.0"]);

        let first = binder.unbind("nvidia", &devices).unwrap();
        assert_eq!(first.done, devices);
        assert_eq!(fake.driver("0000:01:00.0"), None);

        let second = binder.unbind("nvidia", &devices).unwrap();
        assert!(second.done.is_empty());
        assert_eq!(second.skipped, devices);
    }

    #[test]
    fn test_unbind_without_driver_interface_fails_fast() {
        let fake = FakeHost::new().device("0000:01:00.0");
        let host = fake.host();
        let err = DriverBinder::new(&host).unbind("nvidia", &addrs(&["0000:01:00.0"])).unwrap_err();
        assert!(matches!(err, MdevError::DriverNotLoaded { .. }));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_stuck_device_does_not_stop_batch() {
        let fake = FakeHost::new()
            .device("0000:01:00.0")
            .device("0000:02:00.0")
            .boot(&VGPU_MODULES)
            .stuck_unbind("0000:01:00.0");
        let host = fake.host();
        let outcome = DriverBinder::new(&host)
            .unbind("nvidia", &addrs(&["0000:01:00.0", "0000:02:00.0"]))
            .unwrap();
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.done, addrs(&["0000:02:00.0"]));
    }

    #[test]
    fn test_bind_loads_nvidia_and_companion() {
        let fake = FakeHost::new().passthrough_device("0000:01:00.0", "vfio-pci");
        let host = fake.host();
        let outcome = DriverBinder::new(&host).bind("nvidia", &addrs(&["0000:01:00.0"])).unwrap();
        assert_eq!(outcome.done, addrs(&["0000:01:00.0"]));
        assert_eq!(fake.driver("0000:01:00.0").as_deref(), Some("nvidia"));
        assert!(fake.has_mdev("0000:01:00.0"));
        assert_eq!(
            fake.calls(),
            vec![
                "modprobe nvidia",
                "modprobe nvidia_vgpu_vfio",
                "write /sys/bus/pci/devices/0000:01:00.0/driver_override nvidia",
                "write /sys/bus/pci/drivers/nvidia/bind 0000:01:00.0",
            ]
        );
    }

    #[test]
    fn test_bind_writes_bind_control_when_driver_loaded() {
        let fake = FakeHost::new().device("0000:01:00.0").boot(&VGPU_MODULES).boot(&["vfio_pci"]);
        let host = fake.host();
        let binder = DriverBinder::new(&host);
        let devices = addrs(&["0000:01:00.0"]);
        binder.unbind("nvidia", &devices).unwrap();
        binder.bind("vfio-pci", &devices).unwrap();
        assert_eq!(fake.driver("0000:01:00.0").as_deref(), Some("vfio-pci"));
        assert!(fake.calls().last().unwrap().contains("/sys/bus/pci/drivers/vfio-pci/bind"));
    }

    #[test]
    fn test_bind_unknown_driver_is_missing() {
        let fake = FakeHost::new().device("0000:01:00.0");
        let host = fake.host();
        let err = DriverBinder::new(&host).bind("pci-stub", &addrs(&["0000:01:00.0"])).unwrap_err();
        assert!(matches!(err, MdevError::DriverMissing { ref driver } if driver == "pci-stub"));
        // No override is left behind on a failed bind
        assert_eq!(fake.calls(), vec!["modprobe pci_stub"]);
    }

    #[test]
    fn test_bind_failed_module_load_is_missing_driver() {
        let fake = FakeHost::new()
            .passthrough_device("0000:01:00.0", "vfio-pci")
            .failing_load("nvidia");
        let host = fake.host();
        let err = DriverBinder::new(&host).bind("nvidia", &addrs(&["0000:01:00.0"])).unwrap_err();
        assert!(matches!(err, MdevError::DriverMissing { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Structural);
        assert!(!fake.calls().iter().any(|c| c.contains("driver_override")));
    }

    #[test]
    fn test_unbind_device_reports_previous_driver() {
        let fake = FakeHost::new().device("0000:01:00.0").boot(&VGPU_MODULES);
        let host = fake.host();
        let binder = DriverBinder::new(&host);
        assert_eq!(binder.unbind_device("0000:01:00.0").unwrap().as_deref(), Some("nvidia"));
        assert_eq!(binder.unbind_device("0000:01:00.0").unwrap(), None);
    }

    #[test]
    fn test_unbind_from_current_driver_mixed() {
        let fake = FakeHost::new()
            .device("0000:01:00.0")
            .passthrough_device("0000:02:00.0", "vfio-pci")
            .device_with("0000:03:00.0", "10de", Some("none"))
            .boot(&VGPU_MODULES)
            .boot(&["vfio_pci"]);
        let host = fake.host();
        let outcome = DriverBinder::new(&host)
            .unbind_from_current_driver(&addrs(&["0000:01:00.0", "0000:02:00.0", "0000:03:00.0"]))
            .unwrap();
        assert_eq!(outcome.done, addrs(&["0000:01:00.0", "0000:02:00.0"]));
        assert_eq!(outcome.skipped, addrs(&["0000:03:00.0"]));
        assert_eq!(fake.driver("0000:02:00.0"), None);
    }
}
