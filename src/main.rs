use mdev_recover::config::Config;
use mdev_recover::core::host::Host;
use mdev_recover::gpu::inventory::describe;
use mdev_recover::recovery::{Orchestrator, Outcome, RecoveryReport, RecoveryStrategy};
use mdev_recover::utils::init_logging;
use std::env;
use std::process::ExitCode;

const USAGE: &str = "Usage: mdev-recover [--check] [--hard] [--json] [ADDRESS...]

  --check    Only report whether the mdev bus needs fixing
  --hard     Remove and rescan the devices instead of reloading the driver
  --json     Print the recovery report as JSON
  ADDRESS    PCI address to act on (default: every NVIDIA device)";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }
    if args.iter().any(|arg| arg == "--version") {
        println!("mdev-recover {}", mdev_recover::VERSION);
        return ExitCode::SUCCESS;
    }
    if let Some(unknown) = args.iter().find(|arg| arg.starts_with('-') && !is_known_flag(arg)) {
        eprintln!("Unknown option: {}\n\n{}", unknown, USAGE);
        return ExitCode::from(2);
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration from {}: {}", Config::config_path().display(), e);
            return ExitCode::from(2);
        }
    };
    init_logging(&config.log_level);

    let mut devices: Vec<String> = args.iter().filter(|arg| !arg.starts_with('-')).cloned().collect();
    if devices.is_empty() {
        devices = config.devices.clone();
    }

    let host = Host::linux(config.paths.clone());
    let orchestrator = Orchestrator::new(&host, &config);

    if args.iter().any(|arg| arg == "--check") {
        return run_check(&host, &orchestrator, &devices);
    }

    let strategy = if args.iter().any(|arg| arg == "--hard") {
        RecoveryStrategy::Hard
    } else {
        RecoveryStrategy::Soft
    };
    let report = orchestrator.run(strategy, &devices);

    if args.iter().any(|arg| arg == "--json") {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error serializing report: {}", e),
        }
    } else {
        print_summary(&report);
    }

    if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn is_known_flag(arg: &str) -> bool {
    matches!(arg, "--check" | "--hard" | "--json")
}

/// Print the health verdict and the device snapshot
fn run_check(host: &Host, orchestrator: &Orchestrator, explicit: &[String]) -> ExitCode {
    let devices = match orchestrator.resolve_devices(explicit) {
        Ok(devices) => devices,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    for device in describe(host, &devices) {
        println!(
            "{}  vendor {}  driver {}  mdev {}",
            device.address,
            device.vendor_id,
            device.driver.as_deref().unwrap_or("None"),
            if device.mdev { "yes" } else { "no" }
        );
    }

    match orchestrator.check(&devices) {
        Ok(true) => {
            println!("mdev bus is healthy");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("mdev bus needs fixing");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_summary(report: &RecoveryReport) {
    println!("NVIDIA vGPU mdev Recovery ({} strategy)", report.strategy);
    println!("=========================================\n");
    println!("Version: {}", mdev_recover::VERSION);
    println!("Devices: {}", report.devices.join(", "));

    println!("\nStates:");
    for transition in &report.transitions {
        println!("  {}  {} -> {}", transition.at.format("%H:%M:%S"), transition.from, transition.to);
    }

    println!("\nDevices after recovery:");
    for device in &report.after {
        println!(
            "  {}  driver {}  mdev {}",
            device.address,
            device.driver.as_deref().unwrap_or("None"),
            if device.mdev { "yes" } else { "no" }
        );
    }

    println!();
    match &report.outcome {
        Outcome::Unnecessary => println!("mdev bus already healthy, nothing done"),
        Outcome::Recovered => println!("mdev bus recovered"),
        Outcome::Failed { kind, reason, state } => {
            println!("Recovery failed in {} ({:?}): {}", state, kind, reason);
            if report.strategy == RecoveryStrategy::Soft {
                println!("Some faults only clear with --hard, or a reboot");
            }
        }
    }
    if let Some(error) = &report.post_recovery_error {
        println!("Post-recovery action failed: {}", error);
    }
}
