//! Package group installation
//!
//! A group is installed with exactly one package-manager invocation, so the
//! group (not the individual package) is the unit of failure isolation.
//!
//! 1. Validate every identifier; nothing is invoked for a malformed group
//! 2. Preflight: a dry-run install of the whole group. Failure only warns
//! 3. Install the whole group non-interactively
//!
//! Whether a failed install aborts the run is the orchestrator's call (it
//! follows the group's `critical` flag); this module just reports.

use crate::command::{CommandOutput, CommandRunner, CommandSpec, execute, find_program};
use crate::context::ProvisionContext;
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Supported package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum PackageManagerKind {
    #[default]
    Pacman,
    Apt,
    Dnf,
}

impl PackageManagerKind {
    /// Executable that implements this manager.
    pub fn program(self) -> &'static str {
        match self {
            Self::Pacman => "pacman",
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
        }
    }

    /// First manager whose executable is on `PATH`.
    pub fn detect() -> Option<Self> {
        let found = Self::iter().find(|kind| find_program(kind.program()).is_some());
        if let Some(kind) = found {
            tracing::info!(manager = %kind, "package manager detected");
        }
        found
    }

    /// Dry-run install of the group: resolves targets without changing
    /// anything.
    pub fn preflight_command(self, package_ids: &[String]) -> CommandSpec {
        let spec = match self {
            Self::Pacman => CommandSpec::query(
                self.program(),
                ["-S", "--needed", "--noconfirm", "--print"],
            ),
            Self::Apt => CommandSpec::query(self.program(), ["install", "-y", "--simulate"]),
            Self::Dnf => CommandSpec::query(
                self.program(),
                ["install", "-y", "--setopt=tsflags=test"],
            ),
        };
        self.finish(spec, package_ids)
    }

    /// Real, non-interactive install of the group.
    pub fn install_command(self, package_ids: &[String]) -> CommandSpec {
        let spec = match self {
            Self::Pacman => CommandSpec::mutation(self.program(), ["-S", "--needed", "--noconfirm"]),
            Self::Apt => CommandSpec::mutation(self.program(), ["install", "-y"]),
            Self::Dnf => CommandSpec::mutation(self.program(), ["install", "-y"]),
        };
        self.finish(spec, package_ids)
    }

    fn finish(self, mut spec: CommandSpec, package_ids: &[String]) -> CommandSpec {
        spec.args.push("--".to_string());
        spec.args.extend(package_ids.iter().cloned());
        if self == Self::Apt {
            spec = spec.env("DEBIAN_FRONTEND", "noninteractive");
        }
        spec
    }
}

/// Reject identifiers that are empty, look like options, or carry
/// characters no package manager accepts in a name.
pub fn validate_package_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ProvisionError::validation("empty package identifier"));
    }
    if id.starts_with('-') {
        return Err(ProvisionError::validation(format!(
            "package identifier looks like an option: {id}"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || "@._+-:".contains(*c)))
    {
        return Err(ProvisionError::validation(format!(
            "invalid character {bad:?} in package identifier {id:?}"
        )));
    }
    Ok(())
}

/// Validate a whole group; every bad identifier is reported at once.
pub fn validate_group(package_ids: &[String]) -> Result<()> {
    if package_ids.is_empty() {
        return Err(ProvisionError::validation("package group is empty"));
    }
    let problems: Vec<String> = package_ids
        .iter()
        .filter_map(|id| validate_package_id(id).err())
        .map(|e| e.to_string())
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::validation(problems.join("; ")))
    }
}

/// Installs package groups through one package manager.
pub struct PackageInstaller<'a> {
    ctx: &'a ProvisionContext,
    runner: &'a dyn CommandRunner,
    manager: PackageManagerKind,
}

impl<'a> PackageInstaller<'a> {
    pub fn new(
        ctx: &'a ProvisionContext,
        runner: &'a dyn CommandRunner,
        manager: PackageManagerKind,
    ) -> Self {
        Self {
            ctx,
            runner,
            manager,
        }
    }

    /// Install `package_ids` as one group. Returns a detail line on success.
    pub fn install(&self, description: &str, package_ids: &[String]) -> Result<String> {
        validate_group(package_ids)?;

        tracing::info!(
            group = description,
            manager = %self.manager,
            packages = ?package_ids,
            "installing package group"
        );

        let preflight_note = self.preflight(description, package_ids);

        let output: CommandOutput =
            execute(self.runner, self.ctx, &self.manager.install_command(package_ids))?;
        output.ensure_success(&format!("{} install of '{description}'", self.manager))?;

        let mut detail = if output.dry_run {
            format!("[DRY RUN] would install {}", package_ids.join(" "))
        } else {
            format!("installed {}", package_ids.join(" "))
        };
        if let Some(note) = preflight_note {
            detail.push_str(&format!(" (preflight warned: {note})"));
        }
        Ok(detail)
    }

    /// Non-binding dry-run. Returns a warning note if it did not pass.
    fn preflight(&self, description: &str, package_ids: &[String]) -> Option<String> {
        let spec = self.manager.preflight_command(package_ids);
        let note = match execute(self.runner, self.ctx, &spec) {
            Ok(out) if out.success => return None,
            Ok(out) => out.failure_reason(),
            Err(e) => e.to_string(),
        };
        tracing::warn!(group = description, reason = %note, "preflight failed, installing anyway");
        Some(note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TargetUser;
    use std::cell::RefCell;
    use std::path::PathBuf;

    /// Fails preflight and install when a given package is in the group.
    struct Scripted {
        broken: &'static str,
        calls: RefCell<Vec<CommandSpec>>,
    }

    impl CommandRunner for Scripted {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.borrow_mut().push(spec.clone());
            if spec.args.iter().any(|a| a == self.broken) {
                Ok(CommandOutput::failed(1, format!("error: target not found: {}", self.broken)))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }
    }

    fn ctx() -> ProvisionContext {
        let user = TargetUser {
            name: "tester".to_string(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/home/tester"),
        };
        ProvisionContext::new(user, true, false)
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_package_id() {
        assert!(validate_package_id("nginx").is_ok());
        assert!(validate_package_id("lib32-mesa").is_ok());
        assert!(validate_package_id("gtk+3.0").is_ok());
        assert!(validate_package_id("python3.12:amd64").is_ok());
        assert!(validate_package_id("").is_err());
        assert!(validate_package_id("--overwrite").is_err());
        assert!(validate_package_id("vim; rm -rf /").is_err());
        assert!(validate_package_id("a b").is_err());
    }

    #[test]
    fn test_validate_group_reports_all_problems() {
        let err = validate_group(&ids(&["ok", "bad$", "-x"])).expect_err("invalid");
        let msg = err.to_string();
        assert!(msg.contains("bad$"));
        assert!(msg.contains("-x"));
        assert!(validate_group(&[]).is_err());
    }

    #[test]
    fn test_commands_end_with_group() {
        let group = ids(&["git", "curl"]);
        let spec = PackageManagerKind::Pacman.install_command(&group);
        assert_eq!(spec.to_string(), "pacman -S --needed --noconfirm -- git curl");
        assert!(spec.mutating);

        let spec = PackageManagerKind::Apt.preflight_command(&group);
        assert_eq!(spec.to_string(), "apt-get install -y --simulate -- git curl");
        assert!(!spec.mutating);
        assert!(spec.env.contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
    }

    #[test]
    fn test_manager_parse() {
        assert_eq!("dnf".parse::<PackageManagerKind>().ok(), Some(PackageManagerKind::Dnf));
        assert_eq!("APT".parse::<PackageManagerKind>().ok(), Some(PackageManagerKind::Apt));
        assert_eq!(PackageManagerKind::Pacman.to_string(), "pacman");
    }

    #[test]
    fn test_failed_group_reports_reason() {
        let runner = Scripted {
            broken: "this-package-does-not-exist",
            calls: RefCell::new(Vec::new()),
        };
        let ctx = ctx();
        let installer = PackageInstaller::new(&ctx, &runner, PackageManagerKind::Pacman);

        let err = installer
            .install("web", &ids(&["nginx", "this-package-does-not-exist"]))
            .expect_err("install must fail");
        assert!(err.to_string().contains("target not found"));
        // Preflight and install were both attempted.
        assert_eq!(runner.calls.borrow().len(), 2);
    }

    #[test]
    fn test_invalid_group_never_invokes_manager() {
        let runner = Scripted {
            broken: "",
            calls: RefCell::new(Vec::new()),
        };
        let ctx = ctx();
        let installer = PackageInstaller::new(&ctx, &runner, PackageManagerKind::Pacman);

        assert!(installer.install("bad", &ids(&["ok", "no|pipes"])).is_err());
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn test_successful_group() {
        let runner = Scripted {
            broken: "",
            calls: RefCell::new(Vec::new()),
        };
        let ctx = ctx();
        let installer = PackageInstaller::new(&ctx, &runner, PackageManagerKind::Dnf);

        let detail = installer.install("tools", &ids(&["git"])).expect("install");
        assert_eq!(detail, "installed git");
    }
}
