//! deskprov Library
//!
//! Idempotent provisioning primitives for a single Linux desktop host:
//! atomic configuration deployment with backups, package-group installation
//! with preflight, hardware fact probing, settings-store set merges, and the
//! orchestrator that sequences them under explicit failure policies.

pub mod cli;
pub mod command;
pub mod context;
pub mod deploy;
pub mod error;
pub mod hardware;
pub mod heartbeat;
pub mod orchestrator;
pub mod packages;
pub mod plan;
pub mod process_guard;
pub mod sanity;
pub mod services;
pub mod settings;
pub mod step;

// Re-export main types for convenience
pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use context::{ProvisionContext, TargetUser};
pub use deploy::{BackupRecord, ConfigDeployer, DeployReport};
pub use error::{ProvisionError, Result};
pub use hardware::{FactKind, HardwareFact, HardwareProbe, HardwareProfile};
pub use orchestrator::{Orchestrator, RunState, RunSummary, RunTransitionError};
pub use packages::{PackageInstaller, PackageManagerKind};
pub use plan::Plan;
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use services::ServiceToggler;
pub use settings::{GsettingsStore, MergeReport, MergedSet, SettingsStore, StateSetMerger, StoreKey};
pub use step::{FailurePolicy, PlannedStep, ProvisioningStep, StepRef, StepResult, StepStatus};
