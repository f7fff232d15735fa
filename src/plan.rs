//! Plan file handling.
//!
//! A plan is a JSON document listing the expected hardware profile and the
//! ordered provisioning steps:
//!
//! ```json
//! {
//!   "name": "workstation",
//!   "supported_distros": ["arch"],
//!   "expected_hardware": { "gpu": "nvidia", "memory": ">=16" },
//!   "steps": [
//!     { "type": "package_install", "description": "GPU drivers",
//!       "package_ids": ["nvidia", "nvidia-utils"], "critical": true,
//!       "requires_hardware": "gpu" },
//!     { "type": "file_deploy", "target_path": "/etc/foo/bar.conf",
//!       "source": "files/bar.conf" },
//!     { "type": "service_toggle", "name": "bluetooth", "enabled": true,
//!       "policy": "ignore" },
//!     { "type": "state_merge", "store_key": "org.gnome.shell enabled-extensions",
//!       "candidate_ids": ["appindicatorsupport@rgcjonas.gmail.com"] }
//!   ]
//! }
//! ```
//!
//! `file_deploy` takes either inline `content` or a `source` path relative
//! to the plan file; the source is read once at load time.

use crate::error::ProvisionError;
use crate::hardware::HardwareProfile;
use crate::packages::validate_group;
use crate::settings::StoreKey;
use crate::step::{FailurePolicy, PlannedStep, ProvisioningStep};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// A validated, fully resolved provisioning plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub name: Option<String>,
    /// `/etc/os-release` IDs this plan may run on; empty means any.
    pub supported_distros: Vec<String>,
    pub expected_hardware: HardwareProfile,
    pub steps: Vec<PlannedStep>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlan {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    supported_distros: Vec<String>,
    #[serde(default)]
    expected_hardware: HardwareProfile,
    steps: Vec<Map<String, Value>>,
}

impl Plan {
    /// Load a plan from a JSON file, resolving `source` paths against the
    /// file's directory.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan from {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&content, base_dir)
            .with_context(|| format!("Invalid plan {}", path.display()))
    }

    /// Parse a plan from JSON text.
    pub fn from_json(json: &str, base_dir: &Path) -> Result<Self> {
        let raw: RawPlan = serde_json::from_str(json).context("Failed to parse plan JSON")?;

        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, raw)| resolve_step(raw, base_dir).with_context(|| format!("step #{}", i + 1)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: raw.name,
            supported_distros: raw.supported_distros,
            expected_hardware: raw.expected_hardware,
            steps,
        })
    }

    /// Check every step before anything runs. All problems are reported.
    pub fn validate(&self) -> std::result::Result<(), ProvisionError> {
        let mut problems = Vec::new();
        if self.steps.is_empty() {
            problems.push("plan has no steps".to_string());
        }
        for (i, planned) in self.steps.iter().enumerate() {
            if let Err(e) = validate_step(&planned.step) {
                problems.push(format!("step #{} ({}): {e}", i + 1, planned.step.label()));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::validation(problems.join("\n")))
        }
    }

    pub fn has_step(&self, pred: impl Fn(&ProvisioningStep) -> bool) -> bool {
        self.steps.iter().any(|p| pred(&p.step))
    }
}

/// Split the plan-level keys (`policy`, `source`) off a step object and
/// parse the rest strictly, so a misspelled field is an error rather than a
/// silently defaulted one.
fn resolve_step(mut raw: Map<String, Value>, base_dir: &Path) -> Result<PlannedStep> {
    let policy: Option<FailurePolicy> = raw
        .remove("policy")
        .map(serde_json::from_value)
        .transpose()
        .context("invalid policy")?;
    let source: Option<PathBuf> = raw
        .remove("source")
        .map(serde_json::from_value)
        .transpose()
        .context("invalid source")?;
    let step: ProvisioningStep =
        serde_json::from_value(Value::Object(raw)).context("invalid step")?;

    let step = match (step, source) {
        (step, None) => step,
        (
            ProvisioningStep::FileDeploy {
                target_path,
                content,
            },
            Some(source),
        ) => {
            if !content.is_empty() {
                anyhow::bail!("file_deploy takes either content or source, not both");
            }
            let source = base_dir.join(source);
            let content = fs::read_to_string(&source)
                .with_context(|| format!("Failed to read source {}", source.display()))?;
            ProvisioningStep::FileDeploy {
                target_path,
                content,
            }
        }
        (_, Some(_)) => anyhow::bail!("only file_deploy steps take a source"),
    };
    Ok(PlannedStep { step, policy })
}

fn validate_step(step: &ProvisioningStep) -> std::result::Result<(), ProvisionError> {
    match step {
        ProvisioningStep::FileDeploy { target_path, .. } => {
            if !target_path.is_absolute() || target_path.file_name().is_none() {
                return Err(ProvisionError::validation(format!(
                    "target path must be an absolute file path: {}",
                    target_path.display()
                )));
            }
        }
        ProvisioningStep::PackageInstall {
            description,
            package_ids,
            ..
        } => {
            if description.trim().is_empty() {
                return Err(ProvisionError::validation("package group needs a description"));
            }
            validate_group(package_ids)?;
        }
        ProvisioningStep::ServiceToggle { name, .. } => {
            if name.trim().is_empty() {
                return Err(ProvisionError::validation("service name is empty"));
            }
        }
        ProvisioningStep::StateMerge {
            store_key,
            candidate_ids,
        } => {
            store_key.parse::<StoreKey>()?;
            if candidate_ids.is_empty() {
                return Err(ProvisionError::validation("no candidate identifiers to merge"));
            }
        }
    }
    Ok(())
}
