// NVIDIA vGPU mdev Recovery Controller
//
// Detects a broken mdev bus on vGPU hosts and brings it back by reloading the
// driver stack or by removing and rescanning the affected PCI devices

// Host seams and their production/simulated implementations
pub mod core;

// Configuration
pub mod config;

// Error types
pub mod error;

// GPU management modules
pub mod gpu;

// Recovery state machine
pub mod recovery;

// Utility functions
pub mod utils;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
