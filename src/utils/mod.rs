// Utility functions for the mdev recovery controller

use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::core::host::Clock;
use crate::error::{MdevError, Result};

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Run a program and return its trimmed stdout
pub fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let command = std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" ");
    debug!(command = %command, "Executing");

    let output = Command::new(program).args(args).output().map_err(|e| MdevError::Command {
        command: command.clone(),
        reason: format!("failed to execute: {}", e),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(MdevError::Command {
            command,
            reason: format!("exit code {:?}: {}", output.status.code(), stderr),
        })
    }
}

/// Retries a check a bounded number of times with a fixed delay
pub struct Waiter<'a> {
    clock: &'a dyn Clock,
    message: String,
    trials: u32,
    delay: Duration,
}

impl<'a> Waiter<'a> {
    pub fn new(clock: &'a dyn Clock, message: impl Into<String>, trials: u32, delay: Duration) -> Self {
        Self { clock, message: message.into(), trials, delay }
    }

    /// Returns true as soon as `check` passes, false once the trials are exhausted
    pub fn wait(&self, mut check: impl FnMut() -> bool) -> bool {
        if check() {
            return true;
        }
        for trial in 1..=self.trials {
            info!("[Trial {} / {}] {}", trial, self.trials, self.message);
            self.clock.sleep(self.delay);
            if check() {
                return true;
            }
        }
        false
    }
}
