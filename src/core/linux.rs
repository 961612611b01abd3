// Production host implementation
//
// Direct sysfs/procfs file access, modprobe/rmmod for modules,
// systemctl for services and dmesg for the kernel log.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::core::host::{Clock, Host, HostPaths, KernelLog, ModuleTool, ServiceManager, Sysfs};
use crate::error::{MdevError, Result};
use crate::utils::run_command;

/// Sysfs access through the real filesystem
pub struct LinuxSysfs;

impl Sysfs for LinuxSysfs {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn read(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write(&self, path: &Path, value: &str) -> io::Result<()> {
        // Control files must already exist, never create them
        let mut file = fs::OpenOptions::new().write(true).truncate(true).open(path)?;
        write!(file, "{}", value)?;
        file.flush()
    }

    fn list(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }
}

/// Module loading via `modprobe`, unloading via `rmmod`
///
/// `rmmod` removes exactly one module and refuses when it is in use,
/// which keeps the unload chain strictly ordered.
pub struct Modprobe;

impl ModuleTool for Modprobe {
    fn load(&self, module: &str) -> Result<()> {
        run_command("modprobe", &[module]).map(|_| ()).map_err(|e| MdevError::ModuleLoad {
            module: module.to_string(),
            reason: e.to_string(),
        })
    }

    fn unload(&self, module: &str) -> Result<()> {
        run_command("rmmod", &[module]).map(|_| ()).map_err(|e| MdevError::ModuleBusy {
            module: module.to_string(),
            reason: e.to_string(),
        })
    }
}

/// systemd service control
pub struct Systemctl;

impl ServiceManager for Systemctl {
    fn restart(&self, service: &str) -> Result<()> {
        run_command("systemctl", &["restart", service]).map(|_| ()).map_err(|e| {
            MdevError::ServiceRestart { service: service.to_string(), reason: e.to_string() }
        })
    }

    fn exit_status(&self, service: &str) -> Result<i32> {
        let value = run_command("systemctl", &["show", "-p", "ExecMainStatus", "--value", service])?;
        debug!(service = %service, status = %value, "Read service exit status");
        parse_exit_status(service, &value)
    }
}

fn parse_exit_status(service: &str, value: &str) -> Result<i32> {
    // `systemctl show -p ExecMainStatus` without --value prints KEY=VALUE
    let value = value.rsplit('=').next().unwrap_or(value).trim();
    value.parse().map_err(|_| MdevError::ServiceRestart {
        service: service.to_string(),
        reason: format!("unparseable exit status '{}'", value),
    })
}

/// Kernel log read through `dmesg`
pub struct Dmesg;

impl KernelLog for Dmesg {
    fn lines(&self) -> Result<Vec<String>> {
        Ok(run_command("dmesg", &[])?.lines().map(str::to_string).collect())
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl Host {
    /// Host backed by the running Linux kernel and systemd
    pub fn linux(paths: HostPaths) -> Self {
        Self {
            fs: Box::new(LinuxSysfs),
            modules: Box::new(Modprobe),
            services: Box::new(Systemctl),
            kernel_log: Box::new(Dmesg),
            clock: Box::new(SystemClock),
            paths,
        }
    }
}
