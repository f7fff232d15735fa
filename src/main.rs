//! deskprov - Main entry point
//!
//! Loads a plan, verifies the host, then hands the steps to the
//! orchestrator and reports the summary.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use deskprov::cli::{Cli, Commands};
use deskprov::context::ProvisionContext;
use deskprov::hardware::{HardwareProbe, HardwareProfile};
use deskprov::orchestrator::{Orchestrator, RunSummary};
use deskprov::packages::PackageManagerKind;
use deskprov::plan::Plan;
use deskprov::process_guard::{self, ProcessGuard};
use deskprov::settings::GsettingsStore;
use deskprov::{heartbeat, sanity, SystemRunner};

/// Exit status for anything that prevents the run from starting.
const EXIT_PRECONDITION: u8 = 1;

/// Initialize the logger with appropriate settings
fn init_logger() {
    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logger();

    // Children are terminated if we receive SIGINT/SIGTERM
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {e}");
    }
    debug!("Signal handlers initialized");

    let cli = Cli::parse_args();
    let dry_run = cli.dry_run;
    let package_manager = cli.package_manager;

    match cli.command {
        Commands::Validate { plan } => validate_command(&plan),
        Commands::Probe { plan } => match probe_command(plan.as_deref()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e:#}");
                eprintln!("✗ {e:#}");
                ExitCode::from(EXIT_PRECONDITION)
            }
        },
        Commands::Run {
            plan,
            summary_json,
            no_heartbeat,
        } => {
            let _guard = ProcessGuard::new();
            match run_command(&plan, package_manager, dry_run, !no_heartbeat) {
                Ok(summary) => {
                    println!("{summary}");
                    if let Some(path) = summary_json {
                        if let Err(e) = write_summary(&summary, &path) {
                            error!("{e:#}");
                            eprintln!("✗ {e:#}");
                        }
                    }
                    ExitCode::from(summary.exit_code() as u8)
                }
                Err(e) => {
                    error!("{e:#}");
                    eprintln!("✗ {e:#}");
                    ExitCode::from(EXIT_PRECONDITION)
                }
            }
        }
    }
}

fn validate_command(path: &Path) -> ExitCode {
    info!("Validating plan file: {}", path.display());
    let result = Plan::load_from_file(path).and_then(|plan| {
        plan.validate()?;
        Ok(plan)
    });
    match result {
        Ok(plan) => {
            println!(
                "✓ Plan is valid: {} ({} steps)",
                plan.name.as_deref().unwrap_or("unnamed"),
                plan.steps.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Plan validation failed: {e:#}");
            ExitCode::from(EXIT_PRECONDITION)
        }
    }
}

fn probe_command(plan: Option<&Path>) -> Result<()> {
    let profile = match plan {
        Some(path) => Plan::load_from_file(path)?.expected_hardware,
        None => HardwareProfile::default(),
    };
    for fact in HardwareProbe::default().probe(&profile) {
        println!("{fact}");
    }
    Ok(())
}

/// Everything up to and including the orchestrated run. Errors here are
/// precondition failures; a fatal step is reported through the summary.
fn run_command(
    path: &Path,
    package_manager: Option<PackageManagerKind>,
    dry_run: bool,
    heartbeat_enabled: bool,
) -> Result<RunSummary> {
    let plan = Plan::load_from_file(path)?;
    plan.validate()?;
    info!(
        plan = plan.name.as_deref().unwrap_or("unnamed"),
        steps = plan.steps.len(),
        dry_run,
        "plan loaded"
    );

    let detected = package_manager.or_else(PackageManagerKind::detect);
    let check = sanity::verify_environment(&plan, detected, dry_run);
    if !check.is_ok() {
        eprintln!("{}", check.report());
        anyhow::bail!("environment check failed");
    }

    let ctx = ProvisionContext::detect(dry_run).context("Failed to resolve the target user")?;
    debug!(user = %ctx.user().name, elevated = ctx.is_elevated(), "context resolved");

    if heartbeat_enabled && !dry_run {
        heartbeat::spawn(&ctx, heartbeat::DEFAULT_INTERVAL);
    }

    let runner = SystemRunner;
    let store = GsettingsStore::new(&ctx, &runner);
    let mut orchestrator =
        Orchestrator::new(&ctx, &runner, &store, detected.unwrap_or_default());
    orchestrator.consult_hardware(&HardwareProbe::default(), &plan.expected_hardware);

    Ok(orchestrator.run(&plan.steps)?)
}

fn write_summary(summary: &RunSummary, path: &Path) -> Result<()> {
    let json = summary.to_json()?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    info!("summary written to {}", path.display());
    Ok(())
}
