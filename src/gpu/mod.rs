// GPU management module for the mdev recovery controller
//
// Device inventory, driver binding, module chain handling, device removal,
// mdev health checks and vGPU service restarts.

pub mod binding;
pub mod health;
pub mod inventory;
pub mod lifecycle;
pub mod modules;
pub mod services;

/// PCI vendor ID of NVIDIA devices (without the 0x prefix)
pub const NVIDIA_VENDOR: &str = "10de";

/// Driver that exposes the mdev bus for vGPU
pub const NVIDIA_DRIVER: &str = "nvidia";

/// vGPU companion module of the `nvidia` driver
pub const NVIDIA_VGPU_MODULE: &str = "nvidia_vgpu_vfio";

/// Kernel module name backing a PCI driver name (`vfio-pci` -> `vfio_pci`)
pub fn module_for_driver(driver: &str) -> String {
    driver.replace('-', "_")
}
