//! Privilege keepalive.
//!
//! Long package installs can outlive the operator's sudo timestamp. When the
//! run was started through sudo on behalf of an unprivileged user, a detached
//! thread re-validates that user's cached credentials (`sudo -n -v` run as
//! the user) on an interval. It is never joined or cancelled; it ends with
//! the process. The first failed refresh stops it, since a non-interactive
//! refresh that fails once will keep failing.

use crate::command::{CommandRunner, CommandSpec, SystemRunner, find_program};
use crate::context::{ProvisionContext, TargetUser};
use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

const SUDO: &str = "sudo";

/// Non-interactive credential refresh for `user`, run with their identity so
/// their own timestamp is extended.
pub fn refresh_command(user: &TargetUser) -> CommandSpec {
    CommandSpec::query(SUDO, ["-n", "-v"])
        .env("HOME", user.home.display().to_string())
        .run_as(user.uid, user.gid)
}

/// Refresh through `runner` every `interval` until a refresh fails.
/// Returns the number of successful refreshes.
pub fn keepalive(runner: &dyn CommandRunner, spec: &CommandSpec, interval: Duration) -> usize {
    let mut refreshed = 0;
    loop {
        std::thread::sleep(interval);
        match runner.run(spec) {
            Ok(out) if out.success => {
                refreshed += 1;
                tracing::trace!("sudo credentials refreshed");
            }
            Ok(out) => {
                tracing::warn!(reason = %out.failure_reason(), "sudo credential refresh failed, heartbeat stopped");
                return refreshed;
            }
            Err(e) => {
                tracing::warn!(error = %e, "sudo credential refresh failed, heartbeat stopped");
                return refreshed;
            }
        }
    }
}

/// Start the keepalive for the context's user. Returns whether it started.
///
/// Only meaningful when running elevated for another user; a root target has
/// no grant to keep alive.
pub fn spawn(ctx: &ProvisionContext, interval: Duration) -> bool {
    if !ctx.acts_for_other_user() {
        tracing::debug!("not acting for another user, privilege heartbeat disabled");
        return false;
    }
    if find_program(SUDO).is_none() {
        tracing::debug!("sudo not found, privilege heartbeat disabled");
        return false;
    }

    let spec = refresh_command(ctx.user());
    let spawned = std::thread::Builder::new()
        .name("sudo-heartbeat".to_string())
        .spawn(move || keepalive(&SystemRunner, &spec, interval));

    match spawned {
        Ok(_) => {
            tracing::debug!(
                user = %ctx.user().name,
                interval_secs = interval.as_secs(),
                "privilege heartbeat started"
            );
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not start privilege heartbeat");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::error::Result;
    use std::cell::Cell;
    use std::path::PathBuf;

    fn alice() -> TargetUser {
        TargetUser {
            name: "alice".to_string(),
            uid: 1000,
            gid: 1001,
            home: PathBuf::from("/home/alice"),
        }
    }

    /// Succeeds `ok_runs` times, then fails.
    struct Countdown {
        ok_runs: Cell<usize>,
    }

    impl CommandRunner for Countdown {
        fn run(&self, _spec: &CommandSpec) -> Result<CommandOutput> {
            match self.ok_runs.get() {
                0 => Ok(CommandOutput::failed(1, "sudo: a password is required")),
                n => {
                    self.ok_runs.set(n - 1);
                    Ok(CommandOutput::ok(""))
                }
            }
        }
    }

    #[test]
    fn test_refresh_runs_as_invoking_user() {
        let spec = refresh_command(&alice());
        assert_eq!(spec.to_string(), "sudo -n -v");
        assert_eq!(spec.run_as, Some((1000, 1001)));
        assert!(spec.env.contains(&("HOME".to_string(), "/home/alice".to_string())));
        assert!(!spec.mutating);
    }

    #[test]
    fn test_keepalive_stops_after_first_failure() {
        let runner = Countdown { ok_runs: Cell::new(3) };
        let refreshed = keepalive(&runner, &refresh_command(&alice()), Duration::ZERO);
        assert_eq!(refreshed, 3);
    }

    #[test]
    fn test_no_heartbeat_without_elevation() {
        let ctx = ProvisionContext::new(alice(), false, false);
        assert!(!spawn(&ctx, Duration::from_secs(3600)));
    }

    #[test]
    fn test_no_heartbeat_for_root_target() {
        let root = TargetUser {
            name: "root".to_string(),
            uid: 0,
            gid: 0,
            home: PathBuf::from("/root"),
        };
        let ctx = ProvisionContext::new(root, true, false);
        assert!(!spawn(&ctx, Duration::from_secs(3600)));
    }
}
