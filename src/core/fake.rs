// In-memory simulated host
//
// A small model of the pieces of the kernel the controller talks to: PCI
// devices with driver links, the driver registry, a module table with
// modprobe-style dependency loading, the mdev bus, the kernel log and the
// vGPU services. Every mutating call is recorded so tests can assert on
// ordering. Used by the unit tests and by tests/recovery_scenarios.rs.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::core::host::{Clock, Host, HostPaths, KernelLog, ModuleTool, ServiceManager, Sysfs};
use crate::error::{MdevError, Result};
use crate::gpu::NVIDIA_VENDOR;

/// Modules loaded on a healthy vGPU host, in load order
pub const VGPU_MODULES: [&str; 4] = ["nvidia", "mdev", "vfio_mdev", "nvidia_vgpu_vfio"];

/// Kernel log line emitted when a faulty adapter is bound to `nvidia`
pub const FAULT_LOG_LINE: &str = "NVRM: RmInitAdapter failed! (0x26:0x56:1474)";

/// How persistent a simulated adapter fault is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Cleared once the `nvidia` module is unloaded
    ClearedByReload,
    /// Cleared only when the device is removed from the bus
    ClearedByRemove,
    /// Never cleared
    Permanent,
}

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub vendor: String,
    pub driver: Option<String>,
    pub driver_override: Option<String>,
    pub mdev: bool,
    pub fault: Fault,
    pub present: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub devices: BTreeMap<String, FakeDevice>,
    pub loaded: Vec<String>,
    pub busy_modules: HashSet<String>,
    /// Module references released only when the device leaves the bus
    pub held_by_device: BTreeMap<String, String>,
    pub failing_loads: HashSet<String>,
    pub lost_on_rescan: HashSet<String>,
    pub stuck_unbind: HashSet<String>,
    pub failing_restarts: HashSet<String>,
    pub service_status: BTreeMap<String, i32>,
    pub autoload_on_rescan: Vec<String>,
    pub kernel_log: Vec<String>,
    /// Ring size of the kernel log, unbounded when None
    pub log_capacity: Option<usize>,
    pub calls: Vec<String>,
    pub sleeps: Vec<Duration>,
}

/// Shared handle on the simulated host state
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Rc<RefCell<FakeState>>,
    paths: HostPaths,
}

enum Node {
    DevicesRoot,
    Device(String),
    DeviceAttr(String, String),
    DriversRoot,
    Driver(String),
    DriverAttr(String, String),
    MdevRoot,
    MdevEntry(String),
    Rescan,
    ProcModules,
    Unknown,
}

fn module_deps(module: &str) -> &'static [&'static str] {
    match module {
        "vfio_mdev" => &["mdev"],
        "nvidia_vgpu_vfio" => &["nvidia", "mdev", "vfio_mdev"],
        _ => &[],
    }
}

fn is_known_module(module: &str) -> bool {
    VGPU_MODULES.contains(&module) || module == "vfio_pci"
}

fn driver_of_module(module: &str) -> Option<&'static str> {
    match module {
        "nvidia" => Some("nvidia"),
        "vfio_pci" => Some("vfio-pci"),
        _ => None,
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{}: No such file or directory", path.display()))
}

fn busy(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{}: Device or resource busy", path.display()))
}

impl FakeHost {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state.borrow_mut().autoload_on_rescan = vec!["nvidia_vgpu_vfio".to_string()];
        fake
    }

    /// Add an NVIDIA device that the `nvidia` driver will claim when loaded
    pub fn device(self, address: &str) -> Self {
        self.device_with(address, NVIDIA_VENDOR, None)
    }

    /// Add an NVIDIA device pinned to a passthrough driver
    pub fn passthrough_device(self, address: &str, driver: &str) -> Self {
        self.device_with(address, NVIDIA_VENDOR, Some(driver))
    }

    pub fn device_with(self, address: &str, vendor: &str, driver_override: Option<&str>) -> Self {
        self.state.borrow_mut().devices.insert(
            address.to_string(),
            FakeDevice {
                vendor: vendor.to_string(),
                driver: None,
                driver_override: driver_override.map(str::to_string),
                mdev: false,
                fault: Fault::None,
                present: true,
            },
        );
        self
    }

    pub fn fault(self, address: &str, fault: Fault) -> Self {
        if let Some(dev) = self.state.borrow_mut().devices.get_mut(address) {
            dev.fault = fault;
        }
        self
    }

    /// Load modules without recording calls, as if at boot
    pub fn boot(self, modules: &[&str]) -> Self {
        {
            let mut state = self.state.borrow_mut();
            for module in modules {
                state.load_module(module);
            }
        }
        self
    }

    /// `module` stays in use for as long as the device is on the bus
    pub fn held_by_device(self, address: &str, module: &str) -> Self {
        self.state.borrow_mut().held_by_device.insert(address.to_string(), module.to_string());
        self
    }

    pub fn failing_load(self, module: &str) -> Self {
        self.state.borrow_mut().failing_loads.insert(module.to_string());
        self
    }

    /// The device does not reappear when the bus is rescanned
    pub fn lost_on_rescan(self, address: &str) -> Self {
        self.state.borrow_mut().lost_on_rescan.insert(address.to_string());
        self
    }

    /// Keep only the newest `lines` kernel log lines, like the ring buffer
    pub fn log_capacity(self, lines: usize) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.log_capacity = Some(lines);
            state.trim_log();
        }
        self
    }

    pub fn busy_module(self, module: &str) -> Self {
        self.state.borrow_mut().busy_modules.insert(module.to_string());
        self
    }

    pub fn stuck_unbind(self, address: &str) -> Self {
        self.state.borrow_mut().stuck_unbind.insert(address.to_string());
        self
    }

    pub fn service_status(self, service: &str, status: i32) -> Self {
        self.state.borrow_mut().service_status.insert(service.to_string(), status);
        self
    }

    pub fn failing_restart(self, service: &str) -> Self {
        self.state.borrow_mut().failing_restarts.insert(service.to_string());
        self
    }

    pub fn no_autoload(self) -> Self {
        self.state.borrow_mut().autoload_on_rescan.clear();
        self
    }

    pub fn log(self, line: &str) -> Self {
        self.append_log(line);
        self
    }

    /// Emit a kernel log line after the host was built
    pub fn append_log(&self, line: &str) {
        self.state.borrow_mut().push_log(line.to_string());
    }

    /// A `Host` whose every seam is backed by this simulation
    pub fn host(&self) -> Host {
        Host {
            fs: Box::new(self.clone()),
            modules: Box::new(self.clone()),
            services: Box::new(self.clone()),
            kernel_log: Box::new(self.clone()),
            clock: Box::new(self.clone()),
            paths: self.paths.clone(),
        }
    }

    /// Mutating calls issued so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.borrow().sleeps.clone()
    }

    pub fn loaded_modules(&self) -> Vec<String> {
        self.state.borrow().loaded.clone()
    }

    pub fn driver(&self, address: &str) -> Option<String> {
        self.state.borrow().devices.get(address).and_then(|d| d.driver.clone())
    }

    pub fn has_mdev(&self, address: &str) -> bool {
        self.state.borrow().devices.get(address).is_some_and(|d| d.mdev)
    }

    pub fn is_present(&self, address: &str) -> bool {
        self.state.borrow().devices.get(address).is_some_and(|d| d.present)
    }

    fn classify(&self, path: &Path) -> Node {
        let p = &self.paths;
        if path == p.pci_rescan {
            return Node::Rescan;
        }
        if path == p.proc_modules {
            return Node::ProcModules;
        }
        let parts = |root: &Path| -> Option<Vec<String>> {
            path.strip_prefix(root)
                .ok()
                .map(|rest| rest.iter().map(|c| c.to_string_lossy().to_string()).collect())
        };
        if let Some(rest) = parts(&p.pci_devices) {
            return match rest.as_slice() {
                [] => Node::DevicesRoot,
                [addr] => Node::Device(addr.clone()),
                [addr, attr] => Node::DeviceAttr(addr.clone(), attr.clone()),
                _ => Node::Unknown,
            };
        }
        if let Some(rest) = parts(&p.pci_drivers) {
            return match rest.as_slice() {
                [] => Node::DriversRoot,
                [drv] => Node::Driver(drv.clone()),
                [drv, attr] => Node::DriverAttr(drv.clone(), attr.clone()),
                _ => Node::Unknown,
            };
        }
        if let Some(rest) = parts(&p.mdev_bus) {
            return match rest.as_slice() {
                [] => Node::MdevRoot,
                [addr] => Node::MdevEntry(addr.clone()),
                _ => Node::Unknown,
            };
        }
        Node::Unknown
    }
}

impl FakeState {
    fn present(&self, address: &str) -> Option<&FakeDevice> {
        self.devices.get(address).filter(|d| d.present)
    }

    fn driver_loaded(&self, driver: &str) -> bool {
        self.loaded.iter().any(|m| driver_of_module(m) == Some(driver))
    }

    fn push_log(&mut self, line: String) {
        self.kernel_log.push(line);
        self.trim_log();
    }

    fn trim_log(&mut self) {
        if let Some(capacity) = self.log_capacity {
            let excess = self.kernel_log.len().saturating_sub(capacity);
            self.kernel_log.drain(..excess);
        }
    }

    fn is_loaded(&self, module: &str) -> bool {
        self.loaded.iter().any(|m| m == module)
    }

    fn load_module(&mut self, module: &str) {
        for dep in module_deps(module) {
            self.load_module(dep);
        }
        if self.is_loaded(module) {
            return;
        }
        self.loaded.push(module.to_string());
        if let Some(driver) = driver_of_module(module) {
            self.probe(driver);
        }
        self.refresh_mdev();
    }

    /// Bind every unclaimed device the driver would match
    fn probe(&mut self, driver: &str) {
        let mut log = Vec::new();
        for (addr, dev) in self.devices.iter_mut() {
            if !dev.present || dev.driver.is_some() {
                continue;
            }
            let matches = match dev.driver_override.as_deref() {
                Some(target) => target == driver,
                None => driver == "nvidia" && dev.vendor == NVIDIA_VENDOR,
            };
            if matches {
                dev.driver = Some(driver.to_string());
                if driver == "nvidia" && dev.fault != Fault::None {
                    log.push(format!("{} {}", FAULT_LOG_LINE, addr));
                }
            }
        }
        for line in log {
            self.push_log(line);
        }
    }

    fn refresh_mdev(&mut self) {
        let registered = self.is_loaded("nvidia_vgpu_vfio") && self.is_loaded("mdev");
        for dev in self.devices.values_mut() {
            dev.mdev = registered
                && dev.present
                && dev.driver.as_deref() == Some("nvidia")
                && dev.fault == Fault::None;
        }
    }

    fn unload_module(&mut self, module: &str) -> std::result::Result<(), String> {
        if !self.is_loaded(module) {
            return Err(format!("ERROR: Module {} is not currently loaded", module));
        }
        if self.busy_modules.contains(module) {
            return Err(format!("ERROR: Module {} is in use", module));
        }
        if let Some(user) = self.loaded.iter().find(|m| module_deps(m.as_str()).contains(&module)) {
            return Err(format!("ERROR: Module {} is in use by: {}", module, user));
        }
        let holder = self
            .held_by_device
            .iter()
            .find(|(addr, held)| held.as_str() == module && self.present(addr).is_some());
        if let Some((addr, _)) = holder {
            return Err(format!("ERROR: Module {} is in use (held by {})", module, addr));
        }
        self.loaded.retain(|m| m != module);
        if let Some(driver) = driver_of_module(module) {
            for dev in self.devices.values_mut() {
                if dev.driver.as_deref() == Some(driver) {
                    dev.driver = None;
                }
                if driver == "nvidia" && dev.fault == Fault::ClearedByReload {
                    dev.fault = Fault::None;
                }
            }
        }
        self.refresh_mdev();
        Ok(())
    }

    fn proc_modules(&self) -> String {
        self.loaded
            .iter()
            .map(|m| format!("{} 16384 0 - Live 0xffffffffc0000000\n", m))
            .collect()
    }
}

impl Sysfs for FakeHost {
    fn exists(&self, path: &Path) -> bool {
        let state = self.state.borrow();
        match self.classify(path) {
            Node::DevicesRoot | Node::DriversRoot | Node::Rescan | Node::ProcModules => true,
            Node::Device(addr) => state.present(&addr).is_some(),
            Node::DeviceAttr(addr, attr) => match state.present(&addr) {
                Some(dev) => match attr.as_str() {
                    "vendor" | "driver_override" | "remove" => true,
                    "driver" => dev.driver.is_some(),
                    _ => false,
                },
                None => false,
            },
            Node::Driver(drv) => state.driver_loaded(&drv),
            Node::DriverAttr(drv, attr) => {
                state.driver_loaded(&drv)
                    && match attr.as_str() {
                        "bind" | "unbind" => true,
                        addr => state.present(addr).is_some_and(|d| d.driver.as_deref() == Some(drv.as_str())),
                    }
            }
            Node::MdevRoot => state.is_loaded("mdev"),
            Node::MdevEntry(addr) => state.is_loaded("mdev") && state.present(&addr).is_some_and(|d| d.mdev),
            Node::Unknown => false,
        }
    }

    fn read(&self, path: &Path) -> io::Result<String> {
        if !self.exists(path) {
            return Err(not_found(path));
        }
        let state = self.state.borrow();
        match self.classify(path) {
            Node::ProcModules => Ok(state.proc_modules()),
            Node::DeviceAttr(addr, attr) => {
                let dev = state.present(&addr).ok_or_else(|| not_found(path))?;
                match attr.as_str() {
                    "vendor" => Ok(format!("0x{}\n", dev.vendor)),
                    "driver_override" => {
                        Ok(format!("{}\n", dev.driver_override.as_deref().unwrap_or("(null)")))
                    }
                    _ => Err(io::Error::new(io::ErrorKind::PermissionDenied, "write-only")),
                }
            }
            _ => Err(io::Error::new(io::ErrorKind::Other, "Is a directory")),
        }
    }

    fn write(&self, path: &Path, value: &str) -> io::Result<()> {
        if !self.exists(path) {
            return Err(not_found(path));
        }
        let node = self.classify(path);
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("write {} {}", path.display(), value));
        let value = value.trim();
        match node {
            Node::DeviceAttr(addr, attr) => match attr.as_str() {
                "driver_override" => {
                    if let Some(dev) = state.devices.get_mut(&addr) {
                        dev.driver_override = (!value.is_empty()).then(|| value.to_string());
                    }
                    Ok(())
                }
                "remove" => {
                    if let Some(dev) = state.devices.get_mut(&addr) {
                        dev.present = false;
                        dev.driver = None;
                        if dev.fault != Fault::Permanent {
                            dev.fault = Fault::None;
                        }
                    }
                    state.refresh_mdev();
                    Ok(())
                }
                _ => Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only")),
            },
            Node::DriverAttr(drv, attr) if attr == "bind" => {
                let dev = state.devices.get_mut(value).filter(|d| d.present).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "No such device")
                })?;
                if dev.driver.is_some() {
                    return Err(busy(path));
                }
                dev.driver = Some(drv.clone());
                let faulty = drv == "nvidia" && dev.fault != Fault::None;
                if faulty {
                    state.push_log(format!("{} {}", FAULT_LOG_LINE, value));
                }
                state.refresh_mdev();
                Ok(())
            }
            Node::DriverAttr(drv, attr) if attr == "unbind" => {
                if state.stuck_unbind.contains(value) {
                    return Err(busy(path));
                }
                let dev = state
                    .devices
                    .get_mut(value)
                    .filter(|d| d.present && d.driver.as_deref() == Some(drv.as_str()))
                    .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "No such device"))?;
                dev.driver = None;
                state.refresh_mdev();
                Ok(())
            }
            Node::Rescan => {
                let lost = state.lost_on_rescan.clone();
                for (addr, dev) in state.devices.iter_mut() {
                    if !lost.contains(addr) {
                        dev.present = true;
                    }
                }
                let drivers: Vec<&str> =
                    state.loaded.iter().filter_map(|m| driver_of_module(m)).collect();
                for driver in drivers {
                    state.probe(driver);
                }
                for module in state.autoload_on_rescan.clone() {
                    state.load_module(&module);
                }
                state.refresh_mdev();
                Ok(())
            }
            _ => Err(io::Error::new(io::ErrorKind::PermissionDenied, "not writable")),
        }
    }

    fn list(&self, path: &Path) -> io::Result<Vec<String>> {
        if !self.exists(path) {
            return Err(not_found(path));
        }
        let state = self.state.borrow();
        match self.classify(path) {
            Node::DevicesRoot => Ok(state
                .devices
                .iter()
                .filter(|(_, d)| d.present)
                .map(|(a, _)| a.clone())
                .collect()),
            Node::MdevRoot => Ok(state
                .devices
                .iter()
                .filter(|(_, d)| d.present && d.mdev)
                .map(|(a, _)| a.clone())
                .collect()),
            _ => Err(io::Error::new(io::ErrorKind::Other, "Not a directory")),
        }
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        let state = self.state.borrow();
        match self.classify(path) {
            Node::DeviceAttr(addr, attr) if attr == "driver" => state
                .present(&addr)
                .and_then(|d| d.driver.as_ref())
                .map(|drv| PathBuf::from("../../../bus/pci/drivers").join(drv))
                .ok_or_else(|| not_found(path)),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "Invalid argument")),
        }
    }
}

impl ModuleTool for FakeHost {
    fn load(&self, module: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("modprobe {}", module));
        if !is_known_module(module) {
            return Err(MdevError::ModuleLoad {
                module: module.to_string(),
                reason: format!("modprobe: FATAL: Module {} not found", module),
            });
        }
        if state.failing_loads.contains(module) {
            return Err(MdevError::ModuleLoad {
                module: module.to_string(),
                reason: format!("modprobe: ERROR: could not insert '{}': No such device", module),
            });
        }
        state.load_module(module);
        Ok(())
    }

    fn unload(&self, module: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("rmmod {}", module));
        state
            .unload_module(module)
            .map_err(|reason| MdevError::ModuleBusy { module: module.to_string(), reason })
    }
}

impl ServiceManager for FakeHost {
    fn restart(&self, service: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("restart {}", service));
        if state.failing_restarts.contains(service) {
            return Err(MdevError::ServiceRestart {
                service: service.to_string(),
                reason: format!("Job for {}.service failed", service),
            });
        }
        Ok(())
    }

    fn exit_status(&self, service: &str) -> Result<i32> {
        Ok(self.state.borrow().service_status.get(service).copied().unwrap_or(0))
    }
}

impl KernelLog for FakeHost {
    fn lines(&self) -> Result<Vec<String>> {
        Ok(self.state.borrow().kernel_log.clone())
    }
}

impl Clock for FakeHost {
    fn sleep(&self, duration: Duration) {
        self.state.borrow_mut().sleeps.push(duration);
    }
}
