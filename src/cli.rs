use crate::packages::PackageManagerKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// deskprov - idempotent provisioning for a Linux desktop host
#[derive(Parser, Debug)]
#[command(name = "deskprov")]
#[command(about = "Deploy config files, install package groups, toggle services and merge desktop settings")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be changed without changing anything.
    ///
    /// Package installs, service toggles and settings writes are skipped and
    /// logged. Read-only queries (hardware probe, package preflight, settings
    /// reads) still execute so the preview is realistic.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Package manager to use instead of auto-detection (pacman, apt, dnf).
    #[arg(long, global = true)]
    pub package_manager: Option<PackageManagerKind>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a provisioning plan
    Run {
        /// Path to the plan file (JSON)
        plan: PathBuf,

        /// Also write the run summary as JSON to this path
        #[arg(long)]
        summary_json: Option<PathBuf>,

        /// Do not keep sudo credentials alive during the run
        #[arg(long)]
        no_heartbeat: bool,
    },
    /// Validate a plan file without running it
    Validate {
        /// Path to the plan file (JSON)
        plan: PathBuf,
    },
    /// Print detected hardware facts
    Probe {
        /// Compare against the expected hardware of this plan
        #[arg(long)]
        plan: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
