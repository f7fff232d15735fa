//! External command execution
//!
//! Every package-manager, service-manager and settings-store invocation goes
//! through a [`CommandRunner`]. Production code uses [`SystemRunner`], which
//! spawns the tool in its own process group and registers it with the
//! global [`ChildRegistry`]; tests substitute a fake.
//!
//! [`execute`] is the gatekeeper that honours dry-run mode: mutating commands
//! are logged and skipped, read-only queries still run so previews stay
//! realistic.

use crate::context::ProvisionContext;
use crate::error::{ProvisionError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Run with this `(uid, gid)` instead of our own credentials.
    pub run_as: Option<(u32, u32)>,
    /// Whether the command changes host state.
    pub mutating: bool,
}

impl CommandSpec {
    /// A read-only query.
    pub fn query<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            run_as: None,
            mutating: false,
        }
    }

    /// A command that changes host state.
    pub fn mutation<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mutating: true,
            ..Self::query(program, args)
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn run_as(mut self, uid: u32, gid: u32) -> Self {
        self.run_as = Some((uid, gid));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Output from an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    pub success: bool,
    /// True if the command was skipped because of dry-run mode.
    pub dry_run: bool,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
            dry_run: false,
        }
    }

    /// A failed run with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
            dry_run: false,
        }
    }

    fn skipped(spec: &CommandSpec) -> Self {
        Self {
            stdout: format!("[DRY RUN] Skipped: {spec}\n"),
            dry_run: true,
            ..Self::ok("")
        }
    }

    /// Turn a non-zero exit into an error carrying stderr.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(ProvisionError::command(format!(
                "{context} failed (exit code {}): {}",
                self.exit_code.unwrap_or(-1),
                self.failure_reason()
            )))
        }
    }

    /// Last meaningful line of stderr, or stdout if stderr is empty.
    pub fn failure_reason(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| "no output".to_string())
    }
}

/// Seam between the engine and the processes it drives.
pub trait CommandRunner {
    /// Run the command to completion. A non-zero exit is `Ok` with
    /// `success == false`; only spawn failures are errors.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands on the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        use std::os::unix::process::CommandExt;

        tracing::info!(command = %spec, env = ?spec.env, run_as = ?spec.run_as, "exec");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some((uid, gid)) = spec.run_as {
            cmd.gid(gid).uid(uid);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ProvisionError::command(format!("failed to spawn {}: {e}", spec.program)))?;
        let pid = child.id();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        let waited = child.wait_with_output();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let output = waited
            .map_err(|e| ProvisionError::command(format!("failed waiting for {}: {e}", spec.program)))?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
            dry_run: false,
        };

        if !result.success {
            tracing::debug!(
                program = %spec.program,
                code = ?result.exit_code,
                stderr = %result.stderr.trim(),
                "command exited unsuccessfully"
            );
        }

        Ok(result)
    }
}

/// Run `spec` through `runner`, skipping mutating commands in dry-run mode.
pub fn execute(
    runner: &dyn CommandRunner,
    ctx: &ProvisionContext,
    spec: &CommandSpec,
) -> Result<CommandOutput> {
    if ctx.is_dry_run() && spec.mutating {
        tracing::info!(command = %spec, "[DRY RUN] skipped");
        return Ok(CommandOutput::skipped(spec));
    }
    runner.run(spec)
}

/// Locate an executable on `PATH`.
pub fn find_program(name: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}
