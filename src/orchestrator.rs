//! Run orchestration
//!
//! Executes a plan's steps strictly in declared order, one at a time, and
//! turns each outcome into a [`StepResult`] under the step's failure policy.
//!
//! # Run Flow
//!
//! ```text
//! NotStarted ──run()──> Running ──queue exhausted──> Completed
//!                          │
//!                          └──Fatal result──> Aborted
//! ```
//!
//! Hardware facts are consulted once, before the run. A hardware-dependent
//! package group whose fact does not match is relabeled non-critical; it is
//! still attempted. There is no retry and no rollback.

use crate::command::CommandRunner;
use crate::context::ProvisionContext;
use crate::deploy::ConfigDeployer;
use crate::error::{ProvisionError, Result};
use crate::hardware::{FactKind, HardwareFact, HardwareProbe, HardwareProfile};
use crate::packages::{PackageInstaller, PackageManagerKind};
use crate::services::ServiceToggler;
use crate::settings::{SettingsStore, StateSetMerger, StoreKey};
use crate::step::{FailurePolicy, PlannedStep, ProvisioningStep, StepRef, StepResult, StepStatus};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Aborted,
}

impl RunState {
    /// Whether `self -> to` is a legal transition.
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::NotStarted, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Aborted)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    #[error("Cannot move run from {from} to {to}")]
    Invalid { from: RunState, to: RunState },
}

/// Sequences provisioning steps and collects their results.
pub struct Orchestrator<'a> {
    ctx: &'a ProvisionContext,
    runner: &'a dyn CommandRunner,
    store: &'a dyn SettingsStore,
    package_manager: PackageManagerKind,
    facts: Vec<HardwareFact>,
    state: RunState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        ctx: &'a ProvisionContext,
        runner: &'a dyn CommandRunner,
        store: &'a dyn SettingsStore,
        package_manager: PackageManagerKind,
    ) -> Self {
        Self {
            ctx,
            runner,
            store,
            package_manager,
            facts: Vec::new(),
            state: RunState::NotStarted,
        }
    }

    /// Probe hardware once and keep the facts for relabeling.
    pub fn consult_hardware(&mut self, probe: &HardwareProbe, profile: &HardwareProfile) {
        self.facts = probe.probe(profile);
    }

    /// Use facts gathered elsewhere.
    pub fn with_facts(mut self, facts: Vec<HardwareFact>) -> Self {
        self.facts = facts;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, to: RunState) -> std::result::Result<(), RunTransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(RunTransitionError::Invalid {
                from: self.state,
                to,
            });
        }
        tracing::debug!(from = %self.state, to = %to, "run state transition");
        self.state = to;
        Ok(())
    }

    /// Execute `steps` in order. Stops at the first fatal result.
    ///
    /// Errors only if the orchestrator has already run.
    pub fn run(&mut self, steps: &[PlannedStep]) -> Result<RunSummary> {
        self.transition(RunState::Running)?;
        tracing::info!(steps = steps.len(), "provisioning run started");

        let mut results = Vec::with_capacity(steps.len());
        for (index, planned) in steps.iter().enumerate() {
            let step_ref = StepRef {
                index,
                label: planned.step.label(),
            };
            let result = self.run_step(step_ref, planned);
            log_result(&result);
            let fatal = result.is_fatal();
            results.push(result);
            if fatal {
                break;
            }
        }

        let aborted = results.last().is_some_and(StepResult::is_fatal);
        self.transition(if aborted {
            RunState::Aborted
        } else {
            RunState::Completed
        })?;

        let summary = RunSummary {
            state: self.state,
            not_run: steps.len() - results.len(),
            results,
            facts: self.facts.clone(),
        };
        tracing::info!(
            state = %summary.state,
            ok = summary.count(StepStatus::Success),
            degraded = summary.count(StepStatus::Degraded),
            "provisioning run finished"
        );
        Ok(summary)
    }

    fn run_step(&self, step_ref: StepRef, planned: &PlannedStep) -> StepResult {
        let (policy, relabel) = self.effective_policy(planned);
        tracing::info!(step = %step_ref, policy = %policy, "step started");

        let outcome = self.execute(&planned.step);
        let mut result = StepResult::from_outcome(step_ref, outcome, policy);
        if let Some(note) = relabel {
            result.detail.push_str(&format!(" [{note}]"));
        }
        result
    }

    /// Plan policy, downgraded from Fatal when a required hardware fact
    /// does not match.
    fn effective_policy(&self, planned: &PlannedStep) -> (FailurePolicy, Option<String>) {
        let policy = planned.policy();
        let ProvisioningStep::PackageInstall {
            requires_hardware: Some(kind),
            ..
        } = &planned.step
        else {
            return (policy, None);
        };

        match self.fact(*kind) {
            Some(fact) if !fact.matches && policy == FailurePolicy::Fatal => {
                let note = format!(
                    "relabeled non-critical: {} is {}, expected {}",
                    fact.name,
                    fact.detected_value,
                    fact.expected_value.as_deref().unwrap_or("any")
                );
                tracing::warn!(step = %planned.step.label(), "{note}");
                (FailurePolicy::Degraded, Some(note))
            }
            _ => (policy, None),
        }
    }

    fn fact(&self, kind: FactKind) -> Option<&HardwareFact> {
        self.facts.iter().find(|f| f.name == kind)
    }

    /// Route a step to its executor.
    fn execute(&self, step: &ProvisioningStep) -> std::result::Result<String, ProvisionError> {
        match step {
            ProvisioningStep::FileDeploy {
                target_path,
                content,
            } => ConfigDeployer::new(self.ctx)
                .deploy(target_path, content)
                .map(|report| report.detail()),
            ProvisioningStep::PackageInstall {
                description,
                package_ids,
                ..
            } => PackageInstaller::new(self.ctx, self.runner, self.package_manager)
                .install(description, package_ids),
            ProvisioningStep::ServiceToggle { name, enabled } => {
                ServiceToggler::new(self.ctx, self.runner).toggle(name, *enabled)
            }
            ProvisioningStep::StateMerge {
                store_key,
                candidate_ids,
            } => {
                let key: StoreKey = store_key.parse()?;
                let report = StateSetMerger::new(self.store).merge(&key, candidate_ids)?;
                Ok(if self.ctx.is_dry_run() && !report.added.is_empty() {
                    format!("[DRY RUN] {}", report.detail())
                } else {
                    report.detail()
                })
            }
        }
    }
}

fn log_result(result: &StepResult) {
    match result.status {
        StepStatus::Success => {
            tracing::info!(step = %result.step_ref, detail = %result.detail, "step succeeded")
        }
        StepStatus::Degraded => {
            tracing::warn!(step = %result.step_ref, detail = %result.detail, "step degraded")
        }
        StepStatus::Fatal => {
            tracing::error!(step = %result.step_ref, detail = %result.detail, "step failed, aborting run")
        }
    }
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub results: Vec<StepResult>,
    /// Steps never attempted because the run aborted.
    pub not_run: usize,
    pub facts: Vec<HardwareFact>,
}

impl RunSummary {
    pub fn count(&self, status: StepStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Process exit code: 0 when the run completed (warnings included),
    /// 2 when a fatal step aborted it.
    pub fn exit_code(&self) -> i32 {
        if self.is_completed() { 0 } else { 2 }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Provisioning summary")?;
        writeln!(f, "====================")?;

        let mismatches: Vec<&HardwareFact> = self.facts.iter().filter(|f| !f.matches).collect();
        if !mismatches.is_empty() {
            writeln!(f, "Hardware notes:")?;
            for fact in mismatches {
                writeln!(f, "  {fact}")?;
            }
        }

        for result in &self.results {
            writeln!(f, "{result}")?;
        }

        writeln!(f)?;
        write!(
            f,
            "Run {}: {} ok, {} with warnings, {} failed",
            self.state,
            self.count(StepStatus::Success),
            self.count(StepStatus::Degraded),
            self.count(StepStatus::Fatal),
        )?;
        if self.not_run > 0 {
            write!(f, ", {} not run", self.not_run)?;
        }
        Ok(())
    }
}
