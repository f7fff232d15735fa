//! Configuration file deployment
//!
//! Writes a file atomically and never discards what was there before:
//!
//! 1. Create missing parent directories (handing them to the target user
//!    when they live in that user's home)
//! 2. If the target already holds different, non-empty content, copy it to
//!    `<target>.bak.<YYYYmmddHHMMSS>` first
//! 3. Write the new content to a temp file in the same directory and rename
//!    it over the target
//! 4. Fix ownership for files deployed into the target user's home
//!
//! Backups are kept forever; the engine never deletes one. Identical content
//! is a no-op and produces no backup.

use crate::context::ProvisionContext;
use crate::error::{ProvisionError, Result};
use nix::unistd::{Gid, Uid};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Infix between the original file name and the timestamp.
pub const BACKUP_INFIX: &str = ".bak.";

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const DEFAULT_MODE: u32 = 0o644;

/// A copy of pre-existing content taken before an overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    /// Second-resolution local time, `YYYYmmddHHMMSS`.
    pub timestamp: String,
}

/// What a deploy did (or, in dry-run mode, would have done).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub target: PathBuf,
    pub backup: Option<BackupRecord>,
    /// False when the target already held exactly this content.
    pub changed: bool,
    pub dry_run: bool,
}

impl DeployReport {
    /// One-line description for the run summary.
    pub fn detail(&self) -> String {
        let prefix = if self.dry_run { "[DRY RUN] would write" } else { "wrote" };
        match (&self.backup, self.changed) {
            (_, false) => format!("{} already up to date", self.target.display()),
            (Some(b), true) => format!(
                "{prefix} {} (previous content saved to {})",
                self.target.display(),
                b.backup_path.display()
            ),
            (None, true) => format!("{prefix} {}", self.target.display()),
        }
    }
}

/// Deploys configuration files on behalf of the context's target user.
pub struct ConfigDeployer<'a> {
    ctx: &'a ProvisionContext,
}

impl<'a> ConfigDeployer<'a> {
    pub fn new(ctx: &'a ProvisionContext) -> Self {
        Self { ctx }
    }

    /// Deploy `content` to `target`. Any I/O failure is returned as an error.
    pub fn deploy(&self, target: &Path, content: &str) -> Result<DeployReport> {
        if !target.is_absolute() {
            return Err(ProvisionError::validation(format!(
                "deploy target must be an absolute path: {}",
                target.display()
            )));
        }
        let parent = target.parent().ok_or_else(|| {
            ProvisionError::validation(format!("deploy target has no parent: {}", target.display()))
        })?;

        let existing = match fs::read(target) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ProvisionError::path_io(target, e)),
        };

        if existing.as_deref() == Some(content.as_bytes()) {
            tracing::info!(path = %target.display(), "content unchanged, nothing to deploy");
            return Ok(DeployReport {
                target: target.to_path_buf(),
                backup: None,
                changed: false,
                dry_run: self.ctx.is_dry_run(),
            });
        }

        let needs_backup = existing.as_ref().is_some_and(|bytes| !bytes.is_empty());

        if self.ctx.is_dry_run() {
            let backup = needs_backup.then(|| plan_backup(target));
            tracing::info!(
                path = %target.display(),
                backup = ?backup.as_ref().map(|b| &b.backup_path),
                "[DRY RUN] deploy skipped"
            );
            return Ok(DeployReport {
                target: target.to_path_buf(),
                backup,
                changed: true,
                dry_run: true,
            });
        }

        self.create_parents(parent)?;

        let previous_meta = if existing.is_some() {
            Some(fs::metadata(target).map_err(|e| ProvisionError::path_io(target, e))?)
        } else {
            None
        };

        let backup = match (&existing, &previous_meta) {
            (Some(bytes), Some(meta)) if needs_backup => {
                let record = create_backup(target, bytes, meta.permissions().mode() & 0o7777)?;
                self.chown(&record.backup_path, meta.uid(), meta.gid())?;
                tracing::info!(
                    original = %target.display(),
                    backup = %record.backup_path.display(),
                    "backed up existing content"
                );
                Some(record)
            }
            _ => None,
        };

        let mode = previous_meta
            .as_ref()
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(DEFAULT_MODE);
        write_atomically(parent, target, content.as_bytes(), mode)?;

        if let Some((uid, gid)) = self.ctx.owner_for(target) {
            self.chown(target, uid.as_raw(), gid.as_raw())?;
        } else if let Some(meta) = &previous_meta {
            self.chown(target, meta.uid(), meta.gid())?;
        }

        tracing::info!(path = %target.display(), bytes = content.len(), "deployed");

        Ok(DeployReport {
            target: target.to_path_buf(),
            backup,
            changed: true,
            dry_run: false,
        })
    }

    /// Create missing ancestors of `dir`, handing new ones in the user's home
    /// to the user.
    fn create_parents(&self, dir: &Path) -> Result<()> {
        let missing: Vec<&Path> = dir.ancestors().take_while(|p| !p.exists()).collect();
        if missing.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|e| ProvisionError::path_io(dir, e))?;
        for created in missing.iter().rev() {
            if let Some((uid, gid)) = self.ctx.owner_for(created) {
                self.chown(created, uid.as_raw(), gid.as_raw())?;
            }
        }
        Ok(())
    }

    /// Change ownership when running elevated; a no-op otherwise or when the
    /// file already has that owner.
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        if !self.ctx.is_elevated() {
            return Ok(());
        }
        let meta = fs::metadata(path).map_err(|e| ProvisionError::path_io(path, e))?;
        if meta.uid() == uid && meta.gid() == gid {
            return Ok(());
        }
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|e| ProvisionError::path_io(path, e.into()))?;
        tracing::debug!(path = %path.display(), uid, gid, "ownership updated");
        Ok(())
    }
}

/// `<target>.bak.<timestamp>` followed by `.1`, `.2`, ... variants for
/// backups taken within the same second.
fn backup_candidates(target: &Path) -> (String, impl Iterator<Item = PathBuf>) {
    let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
    let base = format!("{}{BACKUP_INFIX}{timestamp}", target.display());
    let candidates = std::iter::once(PathBuf::from(&base))
        .chain((1u32..).map(move |n| PathBuf::from(format!("{base}.{n}"))));
    (timestamp, candidates)
}

/// Backup path a deploy would use right now. Only a prediction, used for
/// dry-run reports.
fn plan_backup(target: &Path) -> BackupRecord {
    let (timestamp, mut candidates) = backup_candidates(target);
    let backup_path = candidates
        .find(|p| !p.exists())
        .unwrap_or_else(|| target.with_extension("bak"));
    BackupRecord {
        original_path: target.to_path_buf(),
        backup_path,
        timestamp,
    }
}

/// Write `bytes` to a fresh backup file. The file is created exclusively, so
/// a path that appears between choosing and writing is skipped, never
/// overwritten.
fn create_backup(target: &Path, bytes: &[u8], mode: u32) -> Result<BackupRecord> {
    let (timestamp, candidates) = backup_candidates(target);
    for backup_path in candidates {
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&backup_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(ProvisionError::path_io(&backup_path, e)),
        };
        file.write_all(bytes)
            .and_then(|()| file.set_permissions(fs::Permissions::from_mode(mode)))
            .and_then(|()| file.sync_all())
            .map_err(|e| ProvisionError::path_io(&backup_path, e))?;
        return Ok(BackupRecord {
            original_path: target.to_path_buf(),
            backup_path,
            timestamp,
        });
    }
    Err(ProvisionError::validation(format!(
        "no free backup name for {}",
        target.display()
    )))
}

fn write_atomically(dir: &Path, target: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ProvisionError::path_io(dir, e))?;
    tmp.write_all(bytes)
        .map_err(|e| ProvisionError::path_io(tmp.path(), e))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|e| ProvisionError::path_io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| ProvisionError::path_io(tmp.path(), e))?;
    tmp.persist(target)
        .map_err(|e| ProvisionError::path_io(target, e.error))?;
    Ok(())
}

/// Every backup of `target`, oldest first.
pub fn list_backups(target: &Path) -> Result<Vec<PathBuf>> {
    let (Some(dir), Some(name)) = (target.parent(), target.file_name()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}{BACKUP_INFIX}", name.to_string_lossy());
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ProvisionError::path_io(dir, e)),
    };
    let mut backups: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .map(|e| e.path())
        .collect();
    backups.sort_by_key(|p| backup_sort_key(p, &prefix));
    Ok(backups)
}

/// `(timestamp, collision suffix)` so `.bak.T.10` sorts after `.bak.T.9`.
fn backup_sort_key(path: &Path, prefix: &str) -> (String, u32) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let rest = name.strip_prefix(prefix).unwrap_or(&name);
    match rest.split_once('.') {
        Some((stamp, n)) => (stamp.to_string(), n.parse().unwrap_or(0)),
        None => (rest.to_string(), 0),
    }
}
