// Host capability seams
//
// The recovery logic only ever touches the machine through these traits:
// sysfs-style control files, the module loader, the service manager, the
// kernel log and the clock. Production implementations live in `linux`,
// the in-memory simulation used by tests lives in `fake`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MdevError, Result};

/// Read/write access to sysfs and procfs style files
pub trait Sysfs {
    /// Whether a file, directory or symlink exists at `path`
    fn exists(&self, path: &Path) -> bool;

    /// Read the full contents of a file
    fn read(&self, path: &Path) -> io::Result<String>;

    /// Write a value to a control file
    fn write(&self, path: &Path, value: &str) -> io::Result<()>;

    /// List entry names of a directory
    fn list(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Resolve a symbolic link
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Kernel module loader (modprobe / rmmod)
pub trait ModuleTool {
    /// Load a module by name
    fn load(&self, module: &str) -> Result<()>;

    /// Unload a single module; fails if references are still held
    fn unload(&self, module: &str) -> Result<()>;
}

/// Service manager (systemd)
pub trait ServiceManager {
    /// Restart a service by name
    fn restart(&self, service: &str) -> Result<()>;

    /// Last exit status of the service's main process
    fn exit_status(&self, service: &str) -> Result<i32>;
}

/// Kernel ring buffer
pub trait KernelLog {
    /// Current kernel log lines, oldest first
    fn lines(&self) -> Result<Vec<String>>;
}

/// Suspension points
pub trait Clock {
    fn sleep(&self, duration: Duration);
}

/// Roots of the control hierarchies the controller reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPaths {
    pub pci_devices: PathBuf,
    pub pci_drivers: PathBuf,
    pub pci_rescan: PathBuf,
    pub mdev_bus: PathBuf,
    pub proc_modules: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            pci_devices: PathBuf::from("/sys/bus/pci/devices"),
            pci_drivers: PathBuf::from("/sys/bus/pci/drivers"),
            pci_rescan: PathBuf::from("/sys/bus/pci/rescan"),
            mdev_bus: PathBuf::from("/sys/class/mdev_bus"),
            proc_modules: PathBuf::from("/proc/modules"),
        }
    }
}

impl HostPaths {
    pub fn device_dir(&self, address: &str) -> PathBuf {
        self.pci_devices.join(address)
    }

    pub fn driver_dir(&self, driver: &str) -> PathBuf {
        self.pci_drivers.join(driver)
    }

    pub fn mdev_entry(&self, address: &str) -> PathBuf {
        self.mdev_bus.join(address)
    }
}

/// Everything the controller needs from the host
pub struct Host {
    pub fs: Box<dyn Sysfs>,
    pub modules: Box<dyn ModuleTool>,
    pub services: Box<dyn ServiceManager>,
    pub kernel_log: Box<dyn KernelLog>,
    pub clock: Box<dyn Clock>,
    pub paths: HostPaths,
}

impl Host {
    /// Handle on a single control file
    pub fn node(&self, path: impl Into<PathBuf>) -> ControlNode<'_> {
        ControlNode { fs: self.fs.as_ref(), path: path.into() }
    }

    pub fn sleep_ms(&self, millis: u64) {
        if millis > 0 {
            self.clock.sleep(Duration::from_millis(millis));
        }
    }
}

/// A write-to-trigger control file such as `bind`, `unbind`, `remove` or `rescan`
pub struct ControlNode<'a> {
    fs: &'a dyn Sysfs,
    path: PathBuf,
}

impl ControlNode<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.fs.exists(&self.path)
    }

    /// Read the value with the trailing newline stripped
    pub fn read(&self) -> Result<String> {
        self.fs
            .read(&self.path)
            .map(|s| s.trim_end_matches('\n').to_string())
            .map_err(|e| MdevError::io(&self.path, e))
    }

    pub fn write(&self, value: &str) -> Result<()> {
        self.fs.write(&self.path, value).map_err(|e| MdevError::io(&self.path, e))
    }
}
