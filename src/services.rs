//! Service toggling through systemd.
//!
//! `enabled = true` runs `systemctl enable --now <name>`, `false` runs
//! `systemctl disable --now <name>`. Failures are reported to the
//! orchestrator, which downgrades them to warnings by default.

use crate::command::{CommandRunner, CommandSpec, execute};
use crate::context::ProvisionContext;
use crate::error::{ProvisionError, Result};

pub const SYSTEMCTL: &str = "systemctl";

/// Build the systemctl invocation for a toggle.
pub fn toggle_command(name: &str, enabled: bool) -> CommandSpec {
    let verb = if enabled { "enable" } else { "disable" };
    CommandSpec::mutation(SYSTEMCTL, [verb, "--now", "--", name])
}

fn validate_unit_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('-') || name.chars().any(char::is_whitespace) {
        return Err(ProvisionError::validation(format!("invalid service name: {name:?}")));
    }
    Ok(())
}

pub struct ServiceToggler<'a> {
    ctx: &'a ProvisionContext,
    runner: &'a dyn CommandRunner,
}

impl<'a> ServiceToggler<'a> {
    pub fn new(ctx: &'a ProvisionContext, runner: &'a dyn CommandRunner) -> Self {
        Self { ctx, runner }
    }

    pub fn toggle(&self, name: &str, enabled: bool) -> Result<String> {
        validate_unit_name(name)?;
        let output = execute(self.runner, self.ctx, &toggle_command(name, enabled))?;
        let action = if enabled { "enable" } else { "disable" };
        output.ensure_success(&format!("{action} {name}"))?;

        let done = if enabled { "enabled and started" } else { "disabled and stopped" };
        Ok(if output.dry_run {
            format!("[DRY RUN] {name} would be {done}")
        } else {
            format!("{name} {done}")
        })
    }
}
