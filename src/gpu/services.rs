// vGPU service restarts

use std::time::Duration;

use tracing::{error, info};

use crate::core::host::Host;
use crate::error::{MdevError, Result};

pub struct ServiceSupervisor<'a> {
    host: &'a Host,
}

impl<'a> ServiceSupervisor<'a> {
    pub fn new(host: &'a Host) -> Self {
        Self { host }
    }

    /// Restart services in order, confirming each one started cleanly
    ///
    /// After each restart waits `poll_delay` and reads the last exit status.
    /// A failed restart or a non-zero status stops before the next service.
    pub fn restart_and_verify(&self, services: &[String], poll_delay: Duration) -> Result<()> {
        for service in services {
            info!(service = %service, "Restarting service");
            self.host.services.restart(service).map_err(|e| {
                error!(service = %service, error = %e, "Restart failed");
                e
            })?;

            self.host.clock.sleep(poll_delay);

            let status = self.host.services.exit_status(service)?;
            if status != 0 {
                error!(service = %service, status, "Service exited with non-zero status");
                return Err(MdevError::ServiceExit { service: service.clone(), status });
            }
            info!(service = %service, "Service restarted");
        }
        Ok(())
    }
}
