// Recovery orchestrator
//
// One state machine drives both recovery strategies:
//
//   Idle -> Checking -> Done                                  (already healthy)
//   Idle -> Checking -> Recovering -> Reloading -> RestartingServices
//        -> Verifying -> Done | Failed
//
// Any fatal error moves the session to Failed from whatever state it was in.
// There is no automatic retry; a caller that wants the hard strategy after a
// failed soft run starts a new session.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::host::Host;
use crate::error::{ErrorKind, MdevError, Result};
use crate::gpu::binding::{BatchOutcome, DriverBinder};
use crate::gpu::health::{log_cursor, HealthChecker};
use crate::gpu::inventory::{describe, is_valid_pci_address, list_nvidia_devices, PciDevice};
use crate::gpu::lifecycle::DeviceLifecycle;
use crate::gpu::modules::ModuleCoordinator;
use crate::gpu::services::ServiceSupervisor;
use crate::gpu::{NVIDIA_DRIVER, NVIDIA_VGPU_MODULE};

/// How to bring the mdev bus back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    /// Unbind the driver and reload the module stack
    Soft,
    /// Remove the devices from the PCI bus and rescan
    Hard,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    Idle,
    Checking,
    Recovering(RecoveryStrategy),
    Reloading,
    RestartingServices,
    Verifying,
    Done,
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recovering(strategy) => write!(f, "Recovering({})", strategy),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub at: DateTime<Local>,
}

/// Terminal result of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// The first health check passed; nothing was touched
    Unnecessary,
    Recovered,
    Failed {
        kind: ErrorKind,
        reason: String,
        /// State the session was in when the error surfaced
        state: State,
    },
}

/// Audit record of one orchestrator session
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub strategy: RecoveryStrategy,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub devices: Vec<String>,
    pub transitions: Vec<Transition>,
    pub before: Vec<PciDevice>,
    pub after: Vec<PciDevice>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_recovery_error: Option<String>,
}

impl RecoveryReport {
    pub fn final_state(&self) -> State {
        self.transitions.last().map(|t| t.to).unwrap_or(State::Idle)
    }

    /// Every state visited, starting with Idle
    pub fn states(&self) -> Vec<State> {
        std::iter::once(State::Idle).chain(self.transitions.iter().map(|t| t.to)).collect()
    }

    pub fn succeeded(&self) -> bool {
        !matches!(self.outcome, Outcome::Failed { .. })
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Outcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Action run once a session has actually recovered the mdev bus,
/// e.g. restoring a saved device to mdev type assignment
pub trait PostRecoveryAction {
    fn name(&self) -> &str;
    fn run(&self, host: &Host, devices: &[String]) -> Result<()>;
}

struct Session {
    strategy: RecoveryStrategy,
    started: DateTime<Local>,
    state: State,
    transitions: Vec<Transition>,
    devices: Vec<String>,
    before: Vec<PciDevice>,
}

impl Session {
    fn new(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            started: Local::now(),
            state: State::Idle,
            transitions: Vec::new(),
            devices: Vec::new(),
            before: Vec::new(),
        }
    }

    fn enter(&mut self, next: State) {
        debug!(from = %self.state, to = %next, "State transition");
        self.transitions.push(Transition { from: self.state, to: next, at: Local::now() });
        self.state = next;
    }
}

pub struct Orchestrator<'a> {
    host: &'a Host,
    config: &'a Config,
    post_recovery: Option<Box<dyn PostRecoveryAction + 'a>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(host: &'a Host, config: &'a Config) -> Self {
        Self { host, config, post_recovery: None }
    }

    pub fn with_post_recovery(mut self, action: Box<dyn PostRecoveryAction + 'a>) -> Self {
        self.post_recovery = Some(action);
        self
    }

    /// Target set: the explicit addresses if any, otherwise every NVIDIA device
    ///
    /// The resolved set is never empty.
    pub fn resolve_devices(&self, explicit: &[String]) -> Result<Vec<String>> {
        let devices: Vec<String> = if explicit.is_empty() {
            list_nvidia_devices(self.host)?.into_iter().collect()
        } else {
            for address in explicit {
                if !is_valid_pci_address(address) {
                    return Err(MdevError::InvalidAddress { address: address.clone() });
                }
                if !self.host.fs.exists(&self.host.paths.device_dir(address)) {
                    return Err(MdevError::MissingTarget { address: address.clone() });
                }
            }
            explicit.to_vec()
        };

        if devices.is_empty() {
            return Err(MdevError::NoDevices);
        }
        info!(devices = ?devices, "Target devices");
        Ok(devices)
    }

    /// Health verdict only, no mutation
    pub fn check(&self, explicit: &[String]) -> Result<bool> {
        let devices = self.resolve_devices(explicit)?;
        HealthChecker::new(self.host, &self.config.fault_signature).is_healthy(&devices)
    }

    /// Run one session to a terminal state
    ///
    /// Never returns early on error: failures are recorded in the report's
    /// outcome together with the state they happened in.
    pub fn run(&self, strategy: RecoveryStrategy, explicit: &[String]) -> RecoveryReport {
        let mut session = Session::new(strategy);
        info!(strategy = %strategy, "Starting mdev recovery session");

        let outcome = match self.drive(&mut session, strategy, explicit) {
            Ok(outcome) => {
                session.enter(State::Done);
                outcome
            }
            Err(e) => {
                let state = session.state;
                error!(state = %state, kind = ?e.kind(), error = %e, "Recovery failed");
                session.enter(State::Failed);
                Outcome::Failed { kind: e.kind(), reason: e.to_string(), state }
            }
        };

        let post_recovery_error = match (&outcome, &self.post_recovery) {
            (Outcome::Recovered, Some(action)) => {
                info!(action = %action.name(), "Running post-recovery action");
                action.run(self.host, &session.devices).err().map(|e| {
                    warn!(action = %action.name(), error = %e, "Post-recovery action failed");
                    e.to_string()
                })
            }
            _ => None,
        };

        let after = describe(self.host, &session.devices);
        for device in &after {
            debug!(address = %device.address, driver = ?device.driver, mdev = device.mdev, "Device state after session");
        }
        if !matches!(outcome, Outcome::Failed { .. }) {
            info!(outcome = ?outcome, "Recovery session finished");
        }

        RecoveryReport {
            strategy: session.strategy,
            started: session.started,
            finished: Local::now(),
            devices: session.devices,
            transitions: session.transitions,
            before: session.before,
            after,
            outcome,
            post_recovery_error,
        }
    }

    fn drive(
        &self,
        session: &mut Session,
        strategy: RecoveryStrategy,
        explicit: &[String],
    ) -> Result<Outcome> {
        let devices = self.resolve_devices(explicit)?;
        session.before = describe(self.host, &devices);
        for device in &session.before {
            debug!(address = %device.address, driver = ?device.driver, mdev = device.mdev, "Device state");
        }
        session.devices = devices.clone();

        session.enter(State::Checking);
        let checker = HealthChecker::new(self.host, &self.config.fault_signature);
        if checker.is_healthy(&devices)? {
            info!("mdev bus healthy, nothing to recover");
            return Ok(Outcome::Unnecessary);
        }

        // Fault lines logged before this point triggered the recovery
        let cursor = log_cursor(self.host)?;

        session.enter(State::Recovering(strategy));
        match strategy {
            RecoveryStrategy::Soft => self.soft_recover(session, &devices)?,
            RecoveryStrategy::Hard => self.hard_recover(session, &devices)?,
        }

        session.enter(State::RestartingServices);
        ServiceSupervisor::new(self.host)
            .restart_and_verify(&self.config.services, self.config.service_poll_delay())?;

        session.enter(State::Verifying);
        self.host.sleep_ms(self.config.verify_settle_ms);
        let verifier = if self.config.wait_for_mdev_bus {
            checker.with_wait(self.config.wait_trials, self.config.wait_delay())
        } else {
            checker
        };
        if verifier.is_healthy_since(&devices, &cursor)? {
            info!(devices = ?devices, "mdev bus recovered");
            Ok(Outcome::Recovered)
        } else {
            Err(MdevError::StillUnhealthy { devices })
        }
    }

    fn soft_recover(&self, session: &mut Session, devices: &[String]) -> Result<()> {
        let unbound = DriverBinder::new(self.host).unbind(NVIDIA_DRIVER, devices)?;
        log_batch("unbind", &unbound);

        let modules = ModuleCoordinator::new(self.host);
        modules.unload_chain()?;
        self.host.sleep_ms(self.config.module_settle_ms);

        session.enter(State::Reloading);
        modules.load(NVIDIA_VGPU_MODULE)?;
        self.host.sleep_ms(self.config.module_settle_ms);
        Ok(())
    }

    fn hard_recover(&self, session: &mut Session, devices: &[String]) -> Result<()> {
        let unbound = DriverBinder::new(self.host).unbind_from_current_driver(devices)?;
        log_batch("unbind", &unbound);

        let modules = ModuleCoordinator::new(self.host);
        let lifecycle = DeviceLifecycle::new(self.host);
        // Some modules only release their references once the device is gone,
        // so a busy module here is retried after removal
        if let Err(e) = modules.unload_chain() {
            if e.kind() != ErrorKind::Dependency {
                return Err(e);
            }
            warn!(error = %e, "Module still in use, retrying after device removal");
        }
        let removed = lifecycle.remove(devices)?;
        info!(removed = ?removed, "Devices removed from the PCI bus");
        modules.unload_chain()?;

        session.enter(State::Reloading);
        lifecycle.rescan_bus()?;
        self.host.sleep_ms(self.config.rescan_settle_ms);
        Ok(())
    }
}

fn log_batch(step: &str, outcome: &BatchOutcome) {
    if outcome.failed.is_empty() {
        info!(step, done = outcome.done.len(), skipped = outcome.skipped.len(), "Batch complete");
    } else {
        warn!(
            step,
            done = outcome.done.len(),
            skipped = outcome.skipped.len(),
            failed = ?outcome.failed,
            "Batch complete with per-device failures"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fake::{Fault, FakeHost, VGPU_MODULES};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    struct Recorder {
        runs: Rc<RefCell<Vec<Vec<String>>>>,
        fail: bool,
    }

    impl PostRecoveryAction for Recorder {
        fn name(&self) -> &str {
            "restore-mdev-types"
        }

        fn run(&self, _host: &Host, devices: &[String]) -> Result<()> {
            self.runs.borrow_mut().push(devices.to_vec());
            if self.fail {
                return Err(MdevError::config("saved mapping unreadable"));
            }
            Ok(())
        }
    }

    fn faulty_host() -> FakeHost {
        FakeHost::new()
            .device("0000:01:00.0")
            .fault("0000:01:00.0", Fault::ClearedByReload)
            .boot(&VGPU_MODULES)
    }

    #[test]
    fn test_soft_session_visits_every_state() {
        let fake = faulty_host();
        let host = fake.host();
        let config = Config::default();
        let report = Orchestrator::new(&host, &config).run(RecoveryStrategy::Soft, &[]);
        assert_eq!(report.outcome, Outcome::Recovered);
        assert_eq!(
            report.states(),
            vec![
                State::Idle,
                State::Checking,
                State::Recovering(RecoveryStrategy::Soft),
                State::Reloading,
                State::RestartingServices,
                State::Verifying,
                State::Done,
            ]
        );
        assert!(!report.before[0].mdev);
        assert!(report.after[0].mdev);
    }

    #[test]
    fn test_failure_records_state() {
        let fake = faulty_host().failing_restart("nvidia-vgpud");
        let host = fake.host();
        let config = Config::default();
        let report = Orchestrator::new(&host, &config).run(RecoveryStrategy::Soft, &[]);
        assert_eq!(report.final_state(), State::Failed);
        assert!(report.final_state().is_terminal());
        match report.outcome {
            Outcome::Failed { kind, state, .. } => {
                assert_eq!(kind, ErrorKind::Service);
                assert_eq!(state, State::RestartingServices);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!report.states().contains(&State::Verifying));
    }

    #[test]
    fn test_invalid_and_missing_targets_are_preconditions() {
        let fake = faulty_host();
        let host = fake.host();
        let config = Config::default();
        let orchestrator = Orchestrator::new(&host, &config);

        let report = orchestrator.run(RecoveryStrategy::Soft, &addrs(&["01:00.0"]));
        assert_eq!(report.failure_kind(), Some(ErrorKind::Precondition));
        let report = orchestrator.run(RecoveryStrategy::Soft, &addrs(&["0000:09:00.0"]));
        assert_eq!(report.failure_kind(), Some(ErrorKind::Precondition));
        assert_eq!(report.states(), vec![State::Idle, State::Failed]);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_no_devices_is_fatal_before_mutation() {
        let fake = FakeHost::new().device_with("0000:00:02.0", "8086", None).boot(&VGPU_MODULES);
        let host = fake.host();
        let config = Config::default();
        let report = Orchestrator::new(&host, &config).run(RecoveryStrategy::Hard, &[]);
        assert!(matches!(
            report.outcome,
            Outcome::Failed { kind: ErrorKind::Precondition, state: State::Idle, .. }
        ));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_missing_mdev_bus_fails_before_mutation() {
        let fake = FakeHost::new().device("0000:01:00.0").boot(&["nvidia"]);
        let host = fake.host();
        let config = Config::default();
        let report = Orchestrator::new(&host, &config).run(RecoveryStrategy::Soft, &[]);
        assert!(matches!(
            report.outcome,
            Outcome::Failed { kind: ErrorKind::Structural, state: State::Checking, .. }
        ));
        assert_eq!(report.final_state(), State::Failed);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_post_recovery_runs_only_after_recovery() {
        let runs = Rc::new(RefCell::new(Vec::new()));
        let config = Config::default();

        let healthy = FakeHost::new().device("0000:01:00.0").boot(&VGPU_MODULES);
        let host = healthy.host();
        let report = Orchestrator::new(&host, &config)
            .with_post_recovery(Box::new(Recorder { runs: runs.clone(), fail: false }))
            .run(RecoveryStrategy::Soft, &[]);
        assert_eq!(report.outcome, Outcome::Unnecessary);
        assert!(runs.borrow().is_empty());

        let fake = faulty_host();
        let host = fake.host();
        let report = Orchestrator::new(&host, &config)
            .with_post_recovery(Box::new(Recorder { runs: runs.clone(), fail: false }))
            .run(RecoveryStrategy::Soft, &[]);
        assert_eq!(report.outcome, Outcome::Recovered);
        assert_eq!(*runs.borrow(), vec![addrs(&["0000:01:00.0"])]);
    }

    #[test]
    fn test_post_recovery_failure_keeps_outcome() {
        let runs = Rc::new(RefCell::new(Vec::new()));
        let config = Config::default();
        let fake = faulty_host();
        let host = fake.host();
        let report = Orchestrator::new(&host, &config)
            .with_post_recovery(Box::new(Recorder { runs, fail: true }))
            .run(RecoveryStrategy::Soft, &[]);
        assert_eq!(report.outcome, Outcome::Recovered);
        assert!(report.succeeded());
        assert!(report.post_recovery_error.unwrap().contains("saved mapping unreadable"));
    }

    #[test]
    fn test_verification_waits_for_mdev_bus_when_configured() {
        let fake = faulty_host();
        let host = fake.host();
        let config = Config { wait_for_mdev_bus: true, ..Config::default() };
        let report = Orchestrator::new(&host, &config).run(RecoveryStrategy::Soft, &[]);
        assert_eq!(report.outcome, Outcome::Recovered);
        // Paths are present on the first look, so the waiter never sleeps
        assert_eq!(
            fake.sleeps().last().copied(),
            Some(std::time::Duration::from_millis(config.verify_settle_ms))
        );
    }

    #[test]
    fn test_report_serializes() {
        let fake = faulty_host();
        let host = fake.host();
        let config = Config::default();
        let report = Orchestrator::new(&host, &config).run(RecoveryStrategy::Hard, &[]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["strategy"], "hard");
        assert_eq!(json["outcome"]["result"], "recovered");
        assert_eq!(json["transitions"][1]["to"]["Recovering"], "hard");
        assert!(json.get("post_recovery_error").is_none());
    }

    #[test]
    fn test_check_does_not_mutate() {
        let fake = faulty_host();
        let host = fake.host();
        let config = Config::default();
        assert!(!Orchestrator::new(&host, &config).check(&[]).unwrap());
        assert!(fake.calls().is_empty());
    }
}
