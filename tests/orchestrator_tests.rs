//! End-to-end runs through the orchestrator with fake processes and a
//! fake settings store.
//!
//! Covers:
//! - A failing non-critical group degrades and the run continues
//! - Groups are isolated: one failure does not block the next group
//! - A failing critical group aborts and later steps never run
//! - Hardware mismatch relabels a critical group non-critical
//! - A CPU mismatch read from the host still lets later steps run
//! - Unreachable settings store is a deferred warning, not an abort

mod common;

use common::{context, strings, FakeRunner, MemoryStore};
use deskprov::hardware::{FactKind, HardwareFact, HardwareProbe, HardwareProfile};
use deskprov::orchestrator::{Orchestrator, RunState};
use deskprov::packages::PackageManagerKind;
use deskprov::step::{FailurePolicy, PlannedStep, ProvisioningStep, StepStatus};
use std::fs;
use std::path::Path;

fn group(description: &str, ids: &[&str], critical: bool) -> PlannedStep {
    ProvisioningStep::PackageInstall {
        description: description.to_string(),
        package_ids: strings(ids),
        critical,
        requires_hardware: None,
    }
    .into()
}

fn gpu_group(critical: bool) -> PlannedStep {
    ProvisioningStep::PackageInstall {
        description: "GPU drivers".to_string(),
        package_ids: strings(&["nvidia", "nvidia-utils"]),
        critical,
        requires_hardware: Some(FactKind::Gpu),
    }
    .into()
}

fn deploy(target: &Path, content: &str) -> PlannedStep {
    ProvisioningStep::FileDeploy {
        target_path: target.to_path_buf(),
        content: content.to_string(),
    }
    .into()
}

fn merge(ids: &[&str]) -> PlannedStep {
    ProvisioningStep::StateMerge {
        store_key: "org.gnome.shell enabled-extensions".to_string(),
        candidate_ids: strings(ids),
    }
    .into()
}

fn gpu_fact(detected: &str, matches: bool) -> HardwareFact {
    HardwareFact {
        name: FactKind::Gpu,
        detected_value: detected.to_string(),
        expected_value: Some("nvidia".to_string()),
        matches,
    }
}

#[test]
fn test_non_critical_failure_degrades_and_continues() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let runner = FakeRunner::failing_on(&["ghost-pkg"]);
    let store = MemoryStore::new();
    let target = dir.path().join("after.conf");

    let steps = vec![
        group("extras", &["htop", "ghost-pkg"], false),
        group("editors", &["vim"], false),
        deploy(&target, "ran\n"),
    ];
    let summary = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman)
        .run(&steps)
        .expect("run");

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.results.len(), 3);
    assert_eq!(summary.results[0].status, StepStatus::Degraded);
    assert!(summary.results[0].detail.contains("ghost-pkg"));
    assert_eq!(summary.results[1].status, StepStatus::Success);
    assert_eq!(summary.results[2].status, StepStatus::Success);
    assert_eq!(fs::read_to_string(&target).expect("deployed"), "ran\n");

    // The healthy group got its own install invocation.
    assert!(runner
        .commands()
        .contains(&"pacman -S --needed --noconfirm -- vim".to_string()));
}

#[test]
fn test_critical_failure_aborts_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let runner = FakeRunner::failing_on(&["linux-firmware"]);
    let store = MemoryStore::new();
    let target = dir.path().join("never.conf");

    let steps = vec![
        group("base", &["linux-firmware"], true),
        deploy(&target, "x"),
        merge(&["a"]),
    ];
    let summary = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman)
        .run(&steps)
        .expect("run");

    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(summary.results.len(), 1);
    assert!(summary.results[0].is_fatal());
    assert_eq!(summary.not_run, 2);
    assert!(!target.exists());
    assert_eq!(store.write_count(), 0);
}

#[test]
fn test_hardware_mismatch_relabels_critical_group() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let runner = FakeRunner::failing_on(&["nvidia"]);
    let store = MemoryStore::new();

    let steps = vec![gpu_group(true), group("editors", &["vim"], false)];
    let summary = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman)
        .with_facts(vec![gpu_fact("amd", false)])
        .run(&steps)
        .expect("run");

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.results[0].status, StepStatus::Degraded);
    assert!(summary.results[0].detail.contains("relabeled non-critical"));
    assert_eq!(summary.results[1].status, StepStatus::Success);
    assert!(summary.to_string().contains("MISMATCH"));
}

#[test]
fn test_cpu_mismatch_on_host_keeps_later_steps_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = dir.path().join("host");
    fs::create_dir_all(host.join("proc")).expect("mkdir proc");
    fs::create_dir_all(host.join("sys")).expect("mkdir sys");
    fs::write(
        host.join("proc/cpuinfo"),
        "processor\t: 0\nmodel name\t: Intel(R) Core(TM) i5-8250U\n",
    )
    .expect("cpuinfo");

    let ctx = context(dir.path(), false);
    let runner = FakeRunner::failing_on(&["amd-ucode"]);
    let store = MemoryStore::new();
    let target = dir.path().join("after-microcode.conf");

    let steps = vec![
        ProvisioningStep::PackageInstall {
            description: "CPU microcode".to_string(),
            package_ids: strings(&["amd-ucode"]),
            critical: true,
            requires_hardware: Some(FactKind::Cpu),
        }
        .into(),
        deploy(&target, "still here\n"),
    ];
    let profile = HardwareProfile {
        cpu: Some("AMD".to_string()),
        ..Default::default()
    };

    let mut orchestrator = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman);
    orchestrator.consult_hardware(
        &HardwareProbe::with_roots(host.join("proc"), host.join("sys")),
        &profile,
    );
    let summary = orchestrator.run(&steps).expect("run");

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.results[0].status, StepStatus::Degraded);
    assert!(summary.results[0].detail.contains("relabeled non-critical"));
    assert!(summary.results[0].detail.contains("Intel"));
    assert_eq!(summary.results[1].status, StepStatus::Success);
    assert_eq!(fs::read_to_string(&target).expect("deployed"), "still here\n");
    assert_eq!(summary.not_run, 0);
}

#[test]
fn test_matching_hardware_keeps_group_critical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let runner = FakeRunner::failing_on(&["nvidia"]);
    let store = MemoryStore::new();

    let summary = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman)
        .with_facts(vec![gpu_fact("nvidia", true)])
        .run(&[gpu_group(true)])
        .expect("run");

    assert_eq!(summary.state, RunState::Aborted);
    assert!(summary.results[0].is_fatal());
}

#[test]
fn test_ignore_policy_reports_success() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let runner = FakeRunner::failing_on(&["cups"]);
    let store = MemoryStore::new();

    let steps = vec![PlannedStep {
        step: ProvisioningStep::ServiceToggle {
            name: "cups".to_string(),
            enabled: true,
        },
        policy: Some(FailurePolicy::Ignore),
    }];
    let summary = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman)
        .run(&steps)
        .expect("run");

    assert_eq!(summary.results[0].status, StepStatus::Success);
    assert!(summary.results[0].detail.starts_with("ignored failure"));
}

#[test]
fn test_unavailable_store_is_deferred() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let runner = FakeRunner::new();
    let store = MemoryStore::unavailable();

    let summary = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman)
        .run(&[merge(&["appindicator@x.org"]), group("editors", &["vim"], false)])
        .expect("run");

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.results[0].status, StepStatus::Degraded);
    assert!(summary.results[0].detail.contains("deferred"));
    assert_eq!(summary.results[1].status, StepStatus::Success);
}

#[test]
fn test_merge_step_updates_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let runner = FakeRunner::new();
    let store =
        MemoryStore::new().with_value("org.gnome.shell enabled-extensions", "@as []");

    let summary = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman)
        .run(&[merge(&["a@x", "b@x"])])
        .expect("run");

    assert!(summary.is_completed());
    assert_eq!(
        store.value("org.gnome.shell enabled-extensions").as_deref(),
        Some("['a@x', 'b@x']")
    );
}

#[test]
fn test_dry_run_skips_mutations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), true);
    let runner = FakeRunner::new();
    let store = MemoryStore::new();

    let summary = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Apt)
        .run(&[group("editors", &["vim"], true)])
        .expect("run");

    assert!(summary.is_completed());
    assert!(summary.results[0].detail.starts_with("[DRY RUN]"));
    // Only the preflight query reached the runner.
    assert_eq!(
        runner.commands(),
        vec!["apt-get install -y --simulate -- vim".to_string()]
    );
}

#[test]
fn test_orchestrator_runs_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let runner = FakeRunner::new();
    let store = MemoryStore::new();

    let mut orchestrator = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman);
    let steps = vec![group("editors", &["vim"], false)];
    orchestrator.run(&steps).expect("first run");
    assert_eq!(orchestrator.state(), RunState::Completed);
    assert!(orchestrator.run(&steps).is_err());
}

#[test]
fn test_summary_json_shape() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let runner = FakeRunner::failing_on(&["bad"]);
    let store = MemoryStore::new();

    let summary = Orchestrator::new(&ctx, &runner, &store, PackageManagerKind::Pacman)
        .with_facts(vec![gpu_fact("nvidia", true)])
        .run(&[group("x", &["bad"], false)])
        .expect("run");

    let json: serde_json::Value =
        serde_json::from_str(&summary.to_json().expect("json")).expect("valid json");
    assert_eq!(json["state"], "completed");
    assert_eq!(json["results"][0]["status"], "degraded");
    assert_eq!(json["results"][0]["step_ref"]["index"], 0);
    assert_eq!(json["facts"][0]["name"], "gpu");
    assert_eq!(json["facts"][0]["match"], true);
    assert_eq!(json["not_run"], 0);
}
