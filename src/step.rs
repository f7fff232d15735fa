//! Provisioning step model
//!
//! A step is declared data: the plan file lists them in order and the
//! orchestrator never mutates one. Executing a step yields a [`StepResult`]
//! whose status is decided by the step's [`FailurePolicy`].

use crate::error::ProvisionError;
use crate::hardware::FactKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use strum::{Display, EnumString};

/// One declarative unit of host configuration change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProvisioningStep {
    /// Write `content` to an absolute path, backing up what was there.
    FileDeploy {
        target_path: PathBuf,
        #[serde(default)]
        content: String,
    },
    /// Install a group of packages with one package-manager invocation.
    PackageInstall {
        description: String,
        package_ids: Vec<String>,
        #[serde(default)]
        critical: bool,
        /// Hardware fact this group exists for (e.g. GPU drivers).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requires_hardware: Option<FactKind>,
    },
    /// Enable+start or disable+stop a service.
    ServiceToggle { name: String, enabled: bool },
    /// Merge identifiers into a collection in the settings store.
    StateMerge {
        store_key: String,
        candidate_ids: Vec<String>,
    },
}

impl ProvisioningStep {
    /// Policy applied when the step fails and the plan does not override it.
    pub fn default_policy(&self) -> FailurePolicy {
        match self {
            Self::FileDeploy { .. } => FailurePolicy::Fatal,
            Self::PackageInstall { critical: true, .. } => FailurePolicy::Fatal,
            Self::PackageInstall { .. } => FailurePolicy::Degraded,
            Self::ServiceToggle { .. } => FailurePolicy::Degraded,
            Self::StateMerge { .. } => FailurePolicy::Degraded,
        }
    }

    /// Short human-readable description used in logs and the summary.
    pub fn label(&self) -> String {
        match self {
            Self::FileDeploy { target_path, .. } => format!("deploy {}", target_path.display()),
            Self::PackageInstall { description, .. } => format!("install {description}"),
            Self::ServiceToggle { name, enabled: true } => format!("enable {name}"),
            Self::ServiceToggle { name, enabled: false } => format!("disable {name}"),
            Self::StateMerge { store_key, .. } => format!("merge into {store_key}"),
        }
    }
}

/// How a failing step affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Abort the run.
    Fatal,
    /// Record a warning and continue.
    Degraded,
    /// Record the failure as a note and count the step as successful.
    Ignore,
}

/// A step as listed in a plan, with an optional policy override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    #[serde(flatten)]
    pub step: ProvisioningStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<FailurePolicy>,
}

impl PlannedStep {
    pub fn policy(&self) -> FailurePolicy {
        self.policy.unwrap_or_else(|| self.step.default_policy())
    }
}

impl From<ProvisioningStep> for PlannedStep {
    fn from(step: ProvisioningStep) -> Self {
        Self { step, policy: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[derive(Display)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[strum(serialize = "ok")]
    Success,
    #[strum(serialize = "warn")]
    Degraded,
    #[strum(serialize = "FAIL")]
    Fatal,
}

/// Position and label of the step a result belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRef {
    /// Zero-based position in the plan.
    pub index: usize,
    pub label: String,
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.index + 1, self.label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub step_ref: StepRef,
    pub status: StepStatus,
    pub detail: String,
}

impl StepResult {
    /// Convert a step outcome into a result under `policy`.
    pub fn from_outcome(
        step_ref: StepRef,
        outcome: Result<String, ProvisionError>,
        policy: FailurePolicy,
    ) -> Self {
        let (status, detail) = match outcome {
            Ok(detail) => (StepStatus::Success, detail),
            Err(err) => {
                let reason = describe_failure(&err);
                match policy {
                    FailurePolicy::Fatal => (StepStatus::Fatal, reason),
                    FailurePolicy::Degraded => (StepStatus::Degraded, reason),
                    FailurePolicy::Ignore => {
                        (StepStatus::Success, format!("ignored failure: {reason}"))
                    }
                }
            }
        };
        Self {
            step_ref,
            status,
            detail,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.status == StepStatus::Fatal
    }
}

fn describe_failure(err: &ProvisionError) -> String {
    match err {
        ProvisionError::StoreUnavailable(_) => {
            format!("deferred until the user's next session: {err}")
        }
        _ => err.to_string(),
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>4}] {}: {}", self.status, self.step_ref, self.detail)
    }
}
