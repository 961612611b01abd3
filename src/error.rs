// Error types for the mdev recovery controller
//
// Every failure is a variant of MdevError; `kind()` groups the variants
// into the categories the orchestrator and the batch loops act on.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for recovery operations
pub type Result<T> = std::result::Result<T, MdevError>;

/// Broad category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    /// A required control interface is entirely absent
    Structural,
    /// An operation on one specific device failed
    Device,
    /// A module could not be unloaded because references are held
    Dependency,
    /// A service restart failed or exited non-zero
    Service,
    /// Nothing to act on, or an invalid request
    Precondition,
    /// I/O, command spawning or configuration plumbing
    Environment,
}

/// Errors raised while inspecting or repairing the mdev configuration
#[derive(Debug, Error)]
pub enum MdevError {
    #[error("No such PCI device: {address}")]
    DeviceNotFound { address: String },

    #[error("PCI device {address} has no driver bound")]
    NoDriver { address: String },

    #[error("Driver {driver} is not loaded (no control interface)")]
    DriverNotLoaded { driver: String },

    #[error("Driver {driver} still has no control interface after loading its module")]
    DriverMissing { driver: String },

    #[error("No such mdev bus path: {path:?}")]
    MdevBusMissing { path: PathBuf },

    #[error("PCI bus control not available: {path:?}")]
    BusControlMissing { path: PathBuf },

    #[error("Device {address}: {reason}")]
    Device { address: String, reason: String },

    #[error("Module {module} could not be unloaded: {reason}")]
    ModuleBusy { module: String, reason: String },

    #[error("Module {module} could not be loaded: {reason}")]
    ModuleLoad { module: String, reason: String },

    #[error("Service {service} could not be restarted: {reason}")]
    ServiceRestart { service: String, reason: String },

    #[error("Service {service} exited with status {status}")]
    ServiceExit { service: String, status: i32 },

    #[error("No target devices to act on")]
    NoDevices,

    #[error("Target device {address} is not on the PCI bus")]
    MissingTarget { address: String },

    #[error("Invalid PCI address format: {address} (expected: 0000:01:00.0)")]
    InvalidAddress { address: String },

    #[error("mdev bus still unhealthy after recovery for devices {devices:?}")]
    StillUnhealthy { devices: Vec<String> },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl MdevError {
    /// Create an I/O error tied to a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Create a per-device error
    pub fn device(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Device { address: address.into(), reason: reason.into() }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    /// Category used by the orchestrator when mapping a failure to a terminal state
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DriverNotLoaded { .. }
            | Self::DriverMissing { .. }
            | Self::MdevBusMissing { .. }
            | Self::BusControlMissing { .. } => ErrorKind::Structural,
            Self::DeviceNotFound { .. } | Self::NoDriver { .. } | Self::Device { .. } => {
                ErrorKind::Device
            }
            Self::ModuleBusy { .. } => ErrorKind::Dependency,
            Self::ServiceRestart { .. } | Self::ServiceExit { .. } => ErrorKind::Service,
            Self::NoDevices
            | Self::MissingTarget { .. }
            | Self::InvalidAddress { .. }
            | Self::StillUnhealthy { .. } => ErrorKind::Precondition,
            Self::ModuleLoad { .. }
            | Self::Io { .. }
            | Self::Command { .. }
            | Self::Config { .. } => ErrorKind::Environment,
        }
    }
}
