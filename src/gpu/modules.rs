// Kernel module chain handling
//
// The vGPU stack has to come down in dependency order; a module that still
// has users cannot be removed, and removing anything out of order is unsafe.

use tracing::{error, info};

use crate::core::host::Host;
use crate::error::{MdevError, Result};
use crate::gpu::health::driver_is_loaded;

/// Unload order of the vGPU module stack, users first
pub const UNLOAD_CHAIN: [&str; 4] = ["nvidia_vgpu_vfio", "vfio_mdev", "mdev", "nvidia"];

/// Result of one module step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStep {
    Unloaded(String),
    NotLoaded(String),
}

pub struct ModuleCoordinator<'a> {
    host: &'a Host,
}

impl<'a> ModuleCoordinator<'a> {
    pub fn new(host: &'a Host) -> Self {
        Self { host }
    }

    /// Unload every loaded module of `UNLOAD_CHAIN`, in order
    ///
    /// The first failed unload aborts the chain with `ModuleBusy`; modules
    /// already unloaded stay unloaded.
    pub fn unload_chain(&self) -> Result<Vec<ModuleStep>> {
        let mut steps = Vec::with_capacity(UNLOAD_CHAIN.len());
        for module in UNLOAD_CHAIN {
            if !driver_is_loaded(self.host, module)? {
                info!(module = %module, "Module not loaded");
                steps.push(ModuleStep::NotLoaded(module.to_string()));
                continue;
            }

            info!(module = %module, "Unloading module");
            if let Err(e) = self.host.modules.unload(module) {
                error!(module = %module, error = %e, "Unload failed, aborting module chain");
                return Err(match e {
                    e @ MdevError::ModuleBusy { .. } => e,
                    other => MdevError::ModuleBusy {
                        module: module.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
            steps.push(ModuleStep::Unloaded(module.to_string()));
        }
        Ok(steps)
    }

    /// Load a single module
    ///
    /// Companion modules are the caller's responsibility.
    pub fn load(&self, module: &str) -> Result<()> {
        info!(module = %module, "Loading module");
        self.host.modules.load(module)?;
        info!(module = %module, "Module loaded");
        Ok(())
    }
}
