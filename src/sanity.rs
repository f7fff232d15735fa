//! Pre-flight checks for the runtime environment
//!
//! Verified before the orchestrator starts:
//! - Running with root privileges (EUID 0), unless this is a dry run
//! - The tools the plan needs are present
//! - The host distribution is one the plan supports
//!
//! Any failure is a precondition failure: the run never starts and the
//! process exits with status 1.

use crate::command::find_program;
use crate::packages::PackageManagerKind;
use crate::plan::Plan;
use crate::services::SYSTEMCTL;
use crate::settings::GSETTINGS;
use crate::step::ProvisioningStep;
use std::fmt::Write as _;
use std::path::Path;

/// Set to `1` or `true` to skip the root check during development.
pub const SKIP_ROOT_CHECK_VAR: &str = "DESKPROV_SKIP_ROOT_CHECK";

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
    /// `Some((host, supported))` when the host is not supported.
    pub unsupported_host: Option<(String, Vec<String>)>,
}

impl SanityCheckResult {
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root && self.unsupported_host.is_none()
    }

    /// Human-readable explanation of every failed check.
    pub fn report(&self) -> String {
        let mut out = String::from("Pre-flight check failed\n");
        if !self.is_root {
            out.push_str("\n  ERROR: root privileges required\n");
            out.push_str("    Run with sudo so packages, services and system files can be changed.\n");
            let _ = writeln!(out, "    (set {SKIP_ROOT_CHECK_VAR}=1 to skip during development)");
        }
        if !self.missing_binaries.is_empty() {
            out.push_str("\n  ERROR: missing required programs\n");
            for binary in &self.missing_binaries {
                let _ = writeln!(out, "    - {binary}");
            }
        }
        if let Some((host, supported)) = &self.unsupported_host {
            let _ = writeln!(
                out,
                "\n  ERROR: unsupported host '{host}' (plan supports: {})",
                supported.join(", ")
            );
        }
        out
    }
}

/// Programs the plan's steps will invoke.
pub fn required_binaries(plan: &Plan, manager: Option<PackageManagerKind>) -> Vec<String> {
    let mut required = Vec::new();
    if plan.has_step(|s| matches!(s, ProvisioningStep::PackageInstall { .. })) {
        match manager {
            Some(kind) => required.push(kind.program().to_string()),
            None => required.push("a package manager (pacman, apt-get or dnf)".to_string()),
        }
    }
    if plan.has_step(|s| matches!(s, ProvisioningStep::ServiceToggle { .. })) {
        required.push(SYSTEMCTL.to_string());
    }
    if plan.has_step(|s| matches!(s, ProvisioningStep::StateMerge { .. })) {
        required.push(GSETTINGS.to_string());
    }
    required
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Skip root check (for development/testing)
pub fn should_skip_root_check() -> bool {
    std::env::var(SKIP_ROOT_CHECK_VAR)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// `ID` and `ID_LIKE` entries of an os-release file.
pub fn parse_os_release(content: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        if key.trim() == "ID" || key.trim() == "ID_LIKE" {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            ids.extend(value.split_whitespace().map(str::to_lowercase));
        }
    }
    ids
}

/// `None` if the host is supported (or the plan does not restrict hosts).
pub fn check_host(plan: &Plan, os_release: &Path) -> Option<(String, Vec<String>)> {
    if plan.supported_distros.is_empty() {
        return None;
    }
    let ids = std::fs::read_to_string(os_release)
        .map(|c| parse_os_release(&c))
        .unwrap_or_default();
    let supported = plan
        .supported_distros
        .iter()
        .any(|want| ids.iter().any(|id| id.eq_ignore_ascii_case(want)));
    if supported {
        None
    } else {
        let host = ids.first().cloned().unwrap_or_else(|| "unknown".to_string());
        Some((host, plan.supported_distros.clone()))
    }
}

/// Perform all checks for `plan`.
pub fn verify_environment(
    plan: &Plan,
    manager: Option<PackageManagerKind>,
    dry_run: bool,
) -> SanityCheckResult {
    let missing_binaries = required_binaries(plan, manager)
        .into_iter()
        .filter(|b| find_program(b).is_none())
        .collect();

    let mut is_root = is_running_as_root();
    if !is_root && (dry_run || should_skip_root_check()) {
        tracing::warn!("root check skipped");
        is_root = true;
    }

    SanityCheckResult {
        missing_binaries,
        is_root,
        unsupported_host: check_host(plan, Path::new("/etc/os-release")),
    }
}
