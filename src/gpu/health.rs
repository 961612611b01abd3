// Mdev health checks
//
// A verdict is always computed from live state: the module table, the mdev
// bus and the kernel log are re-read on every call.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::host::Host;
use crate::error::{MdevError, Result};
use crate::gpu::inventory::bound_driver;
use crate::gpu::NVIDIA_DRIVER;
use crate::utils::Waiter;

/// Whether a module appears in the live kernel module table
pub fn driver_is_loaded(host: &Host, name: &str) -> Result<bool> {
    let table = &host.paths.proc_modules;
    let content = host.fs.read(table).map_err(|e| MdevError::io(table, e))?;
    Ok(content.lines().any(|line| line.split_whitespace().next() == Some(name)))
}

/// Position in the kernel log, anchored on the newest line seen
///
/// The log is a ring buffer, so a line count alone drifts once old lines
/// fall off the front. The count is only trusted while the anchor still sits
/// at that index. The default cursor covers the whole log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogCursor {
    seen: usize,
    anchor: Option<String>,
}

impl LogCursor {
    /// Lines logged after the anchor; everything if the anchor is gone
    pub fn unread<'l>(&self, lines: &'l [String]) -> &'l [String] {
        let Some(anchor) = &self.anchor else {
            return lines;
        };
        if self.seen > 0 && lines.get(self.seen - 1) == Some(anchor) {
            return &lines[self.seen..];
        }
        // Rotated: the anchor moved towards the front, never past `seen`
        let window = &lines[..self.seen.min(lines.len())];
        match window.iter().rposition(|line| line == anchor) {
            Some(pos) => &lines[pos + 1..],
            None => {
                debug!("Log cursor anchor rotated out, scanning the whole log");
                lines
            }
        }
    }
}

/// Cursor just past the current end of the kernel log
pub fn log_cursor(host: &Host) -> Result<LogCursor> {
    let mut lines = host.kernel_log.lines()?;
    let seen = lines.len();
    Ok(LogCursor { seen, anchor: lines.pop() })
}

/// Decides whether the mdev bus needs fixing
pub struct HealthChecker<'a> {
    host: &'a Host,
    fault_signature: &'a str,
    wait: Option<(u32, Duration)>,
}

impl<'a> HealthChecker<'a> {
    pub fn new(host: &'a Host, fault_signature: &'a str) -> Self {
        Self { host, fault_signature, wait: None }
    }

    /// Poll for mdev bus paths instead of judging them on the first look
    pub fn with_wait(mut self, trials: u32, delay: Duration) -> Self {
        self.wait = Some((trials, delay));
        self
    }

    /// Every `nvidia`-bound device in the set must have an mdev bus entry
    ///
    /// Unbound and passthrough devices are not judged; a device missing from
    /// the PCI bus is not ready. Fails with `MdevBusMissing` when the mdev bus
    /// root itself is absent.
    pub fn mdev_bus_ready<'d>(&self, devices: impl IntoIterator<Item = &'d String>) -> Result<bool> {
        let root = &self.host.paths.mdev_bus;
        if !self.path_present(root) {
            return Err(MdevError::MdevBusMissing { path: root.clone() });
        }

        for address in devices {
            if !self.path_present(&self.host.paths.device_dir(address)) {
                warn!(address = %address, "Device is not on the PCI bus");
                return Ok(false);
            }
            let driver = bound_driver(self.host, address)?;
            if driver.as_deref() != Some(NVIDIA_DRIVER) {
                debug!(address = %address, driver = ?driver, "Not bound to nvidia, skipping mdev check");
                continue;
            }
            if !self.path_present(&self.host.paths.mdev_entry(address)) {
                info!(address = %address, "No mdev bus entry for nvidia device");
                return Ok(false);
            }
            debug!(address = %address, "mdev bus entry present");
        }
        Ok(true)
    }

    /// Whether the fault signature appears in kernel log lines after `since`
    pub fn log_contains_fault(&self, since: &LogCursor) -> Result<bool> {
        let lines = self.host.kernel_log.lines()?;
        let hit = since.unread(&lines).iter().find(|line| line.contains(self.fault_signature));
        if let Some(line) = hit {
            info!(line = %line.trim(), "Fault signature found in kernel log");
        }
        Ok(hit.is_some())
    }

    pub fn is_healthy(&self, devices: &[String]) -> Result<bool> {
        self.is_healthy_since(devices, &LogCursor::default())
    }

    /// Health verdict considering only kernel log lines after `log_since`
    ///
    /// Trivially healthy when `nvidia` is not loaded. Otherwise the device set
    /// must be non-empty, the mdev bus ready and the log free of the fault
    /// signature.
    pub fn is_healthy_since(&self, devices: &[String], log_since: &LogCursor) -> Result<bool> {
        if !driver_is_loaded(self.host, NVIDIA_DRIVER)? {
            info!("nvidia module not loaded, nothing to fix");
            return Ok(true);
        }
        if devices.is_empty() {
            return Err(MdevError::NoDevices);
        }

        let mut needs_fix = false;
        if !self.mdev_bus_ready(devices)? {
            needs_fix = true;
        }
        if self.log_contains_fault(log_since)? {
            needs_fix = true;
        }

        if needs_fix {
            warn!(devices = ?devices, "mdev configuration needs fixing");
        } else {
            info!(devices = ?devices, "mdev configuration is healthy");
        }
        Ok(!needs_fix)
    }

    fn path_present(&self, path: &Path) -> bool {
        match self.wait {
            Some((trials, delay)) => Waiter::new(
                self.host.clock.as_ref(),
                format!("Wait for path {}", path.display()),
                trials,
                delay,
            )
            .wait(|| self.host.fs.exists(path)),
            None => self.host.fs.exists(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fake::{Fault, FakeHost, VGPU_MODULES};

    const SIGNATURE: &str = "RmInitAdapter failed";

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_driver_is_loaded_exact_match() {
        let fake = FakeHost::new().boot(&VGPU_MODULES);
        let host = fake.host();
        assert!(driver_is_loaded(&host, "nvidia").unwrap());
        assert!(driver_is_loaded(&host, "nvidia_vgpu_vfio").unwrap());
        assert!(!driver_is_loaded(&host, "nvidia_vgpu").unwrap());
    }

    #[test]
    fn test_healthy_when_nvidia_not_loaded() {
        let fake = FakeHost::new().device("0000:01:00.0").log("NVRM: RmInitAdapter failed!");
        let host = fake.host();
        let checker = HealthChecker::new(&host, SIGNATURE);
        assert!(checker.is_healthy(&[]).unwrap());
        assert!(checker.is_healthy(&addrs(&["0000:01:00.0"])).unwrap());
    }

    #[test]
    fn test_empty_set_is_fatal_when_nvidia_loaded() {
        let fake = FakeHost::new().device("0000:01:00.0").boot(&VGPU_MODULES);
        let host = fake.host();
        let checker = HealthChecker::new(&host, SIGNATURE);
        assert!(matches!(checker.is_healthy(&[]), Err(MdevError::NoDevices)));
    }

    #[test]
    fn test_missing_entry_is_unhealthy() {
        let fake = FakeHost::new()
            .device("0000:01:00.0")
            .device("0000:02:00.0")
            .fault("0000:01:00.0", Fault::ClearedByReload)
            .boot(&VGPU_MODULES);
        let host = fake.host();
        let checker = HealthChecker::new(&host, SIGNATURE);
        let devices = addrs(&["0000:01:00.0", "0000:02:00.0"]);
        assert!(!checker.mdev_bus_ready(&devices).unwrap());
        assert!(!checker.is_healthy(&devices).unwrap());
        // The fault line logged for 01:00.0 still counts
        assert!(!checker.is_healthy(&addrs(&["0000:02:00.0"])).unwrap());
    }

    #[test]
    fn test_log_signature_alone_is_unhealthy() {
        let fake = FakeHost::new()
            .device("0000:01:00.0")
            .boot(&VGPU_MODULES)
            .log("NVRM: GPU 0000:01:00.0: RmInitAdapter failed! (0x22:0x56:667)");
        let host = fake.host();
        let checker = HealthChecker::new(&host, SIGNATURE);
        let devices = addrs(&["0000:01:00.0"]);
        assert!(checker.mdev_bus_ready(&devices).unwrap());
        assert!(!checker.is_healthy(&devices).unwrap());
        // Lines before the cursor are ignored
        let cursor = log_cursor(&host).unwrap();
        assert!(checker.is_healthy_since(&devices, &cursor).unwrap());
    }

    #[test]
    fn test_cursor_survives_log_rotation() {
        let fake = FakeHost::new()
            .device("0000:01:00.0")
            .boot(&VGPU_MODULES)
            .log_capacity(3)
            .log("[  1.0] a")
            .log("[  2.0] b")
            .log("[  3.0] c");
        let host = fake.host();
        let checker = HealthChecker::new(&host, SIGNATURE);
        let devices = addrs(&["0000:01:00.0"]);
        let cursor = log_cursor(&host).unwrap();
        assert!(checker.is_healthy_since(&devices, &cursor).unwrap());

        // The log stays three lines long while the new fault pushes "a" out
        fake.append_log("[  4.0] NVRM: RmInitAdapter failed! (0x26:0x56:1474)");
        assert!(!checker.is_healthy_since(&devices, &cursor).unwrap());
    }

    #[test]
    fn test_cursor_rotated_out_scans_everything() {
        let fake = FakeHost::new().device("0000:01:00.0").boot(&VGPU_MODULES).log_capacity(2);
        fake.append_log("[  1.0] a");
        let host = fake.host();
        let cursor = log_cursor(&host).unwrap();
        fake.append_log("[  2.0] NVRM: RmInitAdapter failed!");
        fake.append_log("[  3.0] b");
        let checker = HealthChecker::new(&host, SIGNATURE);
        assert!(checker.log_contains_fault(&cursor).unwrap());
    }

    #[test]
    fn test_repeated_anchor_line_does_not_hide_faults() {
        let fake = FakeHost::new().device("0000:01:00.0").boot(&VGPU_MODULES);
        fake.append_log("vfio-pci: ready");
        let host = fake.host();
        let cursor = log_cursor(&host).unwrap();
        fake.append_log("NVRM: RmInitAdapter failed!");
        fake.append_log("vfio-pci: ready");
        let checker = HealthChecker::new(&host, SIGNATURE);
        assert!(checker.log_contains_fault(&cursor).unwrap());
    }

    #[test]
    fn test_device_missing_from_bus_is_not_ready() {
        let fake = FakeHost::new().device("0000:01:00.0").boot(&VGPU_MODULES);
        let host = fake.host();
        let checker = HealthChecker::new(&host, SIGNATURE);
        assert!(!checker.mdev_bus_ready(&addrs(&["0000:01:00.0", "0000:07:00.0"])).unwrap());
    }

    #[test]
    fn test_passthrough_device_excluded_from_judgment() {
        let fake = FakeHost::new()
            .device("0000:01:00.0")
            .passthrough_device("0000:02:00.0", "vfio-pci")
            .boot(&VGPU_MODULES)
            .boot(&["vfio_pci"]);
        let host = fake.host();
        let checker = HealthChecker::new(&host, SIGNATURE);
        assert!(checker.is_healthy(&addrs(&["0000:01:00.0", "0000:02:00.0"])).unwrap());
    }

    #[test]
    fn test_missing_mdev_bus_root_is_distinct_error() {
        let fake = FakeHost::new().device("0000:01:00.0").boot(&["nvidia"]);
        let host = fake.host();
        let checker = HealthChecker::new(&host, SIGNATURE);
        let result = checker.mdev_bus_ready(&addrs(&["0000:01:00.0"]));
        assert!(matches!(result, Err(MdevError::MdevBusMissing { .. })));
    }

    #[test]
    fn test_wait_polls_through_clock() {
        let fake = FakeHost::new().device("0000:01:00.0").boot(&["nvidia"]);
        let host = fake.host();
        let checker =
            HealthChecker::new(&host, SIGNATURE).with_wait(2, Duration::from_millis(500));
        assert!(checker.mdev_bus_ready(&addrs(&["0000:01:00.0"])).is_err());
        assert_eq!(fake.sleeps(), vec![Duration::from_millis(500); 2]);
    }
}
