//! Config deployment against a real (temporary) filesystem.
//!
//! Covers:
//! - Overwriting existing content keeps exactly one backup of it
//! - Successive deploys leave the latest content and the whole backup chain
//! - Dry-run leaves the filesystem untouched

mod common;

use common::context;
use deskprov::deploy::{list_backups, ConfigDeployer};
use std::fs;

#[test]
fn test_overwrite_backs_up_previous_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let target = dir.path().join(".config/app/settings.ini");
    fs::create_dir_all(target.parent().expect("parent")).expect("mkdir");
    fs::write(&target, "theme=light\n").expect("seed");

    let report = ConfigDeployer::new(&ctx)
        .deploy(&target, "theme=dark\n")
        .expect("deploy");

    assert!(report.changed);
    let backup = report.backup.clone().expect("backup recorded");
    assert_eq!(backup.original_path, target);
    assert_eq!(fs::read_to_string(&backup.backup_path).expect("backup"), "theme=light\n");
    assert_eq!(fs::read_to_string(&target).expect("target"), "theme=dark\n");
    assert!(report.detail().contains("previous content saved to"));

    let backups = list_backups(&target).expect("list");
    assert_eq!(backups, vec![backup.backup_path]);
}

#[test]
fn test_successive_deploys_keep_every_backup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let deployer = ConfigDeployer::new(&ctx);
    let target = dir.path().join("rc.conf");

    deployer.deploy(&target, "one").expect("first");
    deployer.deploy(&target, "two").expect("second");
    deployer.deploy(&target, "three").expect("third");

    assert_eq!(fs::read_to_string(&target).expect("target"), "three");

    // Oldest first; the first deploy had nothing to back up.
    let contents: Vec<String> = list_backups(&target)
        .expect("list")
        .iter()
        .map(|p| fs::read_to_string(p).expect("backup"))
        .collect();
    assert_eq!(contents, vec!["one".to_string(), "two".to_string()]);
}

#[test]
fn test_redeploying_same_content_changes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let deployer = ConfigDeployer::new(&ctx);
    let target = dir.path().join("same.conf");

    deployer.deploy(&target, "x=1\n").expect("first");
    let report = deployer.deploy(&target, "x=1\n").expect("second");

    assert!(!report.changed);
    assert!(report.backup.is_none());
    assert!(list_backups(&target).expect("list").is_empty());
}

#[test]
fn test_dry_run_touches_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), true);
    let target = dir.path().join("existing.conf");
    fs::write(&target, "old").expect("seed");
    let fresh = dir.path().join("new/dir/fresh.conf");

    let report = ConfigDeployer::new(&ctx).deploy(&target, "new").expect("deploy");
    assert!(report.dry_run);
    assert!(report.backup.is_some());
    assert!(report.detail().starts_with("[DRY RUN]"));
    assert_eq!(fs::read_to_string(&target).expect("target"), "old");
    assert!(list_backups(&target).expect("list").is_empty());

    ConfigDeployer::new(&ctx).deploy(&fresh, "x").expect("deploy fresh");
    assert!(!fresh.parent().expect("parent").exists());
}

#[test]
fn test_relative_target_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context(dir.path(), false);
    let err = ConfigDeployer::new(&ctx)
        .deploy(std::path::Path::new("relative.conf"), "x")
        .expect_err("must fail");
    assert!(err.to_string().contains("absolute"));
}
