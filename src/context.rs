//! Immutable run context
//!
//! Captures the identity of the unprivileged target user once, at startup,
//! and hands it to every step executor. Nothing below the orchestrator reads
//! `SUDO_USER` or the process credentials on its own.

use crate::error::{ProvisionError, Result};
use nix::unistd::{Gid, Uid, User};
use std::path::{Path, PathBuf};

/// Environment variable set by sudo to the invoking user's name.
pub const INVOKING_USER_VAR: &str = "SUDO_USER";

/// The unprivileged user on whose behalf files and settings are provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl TargetUser {
    /// Look a user up in the passwd database.
    pub fn lookup(name: &str) -> Result<Self> {
        let user = User::from_name(name)
            .map_err(|e| ProvisionError::precondition(format!("passwd lookup for {name}: {e}")))?
            .ok_or_else(|| ProvisionError::precondition(format!("unknown user: {name}")))?;
        Ok(Self::from(user))
    }

    /// Resolve the target user from the invoking-user variable, falling back
    /// to the real uid of this process.
    pub fn resolve() -> Result<Self> {
        match std::env::var(INVOKING_USER_VAR) {
            Ok(name) if !name.trim().is_empty() && name != "root" => Self::lookup(name.trim()),
            _ => {
                let uid = nix::unistd::getuid();
                let user = User::from_uid(uid)
                    .map_err(|e| {
                        ProvisionError::precondition(format!("passwd lookup for uid {uid}: {e}"))
                    })?
                    .ok_or_else(|| {
                        ProvisionError::precondition(format!("no passwd entry for uid {uid}"))
                    })?;
                Ok(Self::from(user))
            }
        }
    }

    /// Path of the user's D-Bus session socket.
    pub fn session_bus_path(&self) -> PathBuf {
        PathBuf::from(format!("/run/user/{}/bus", self.uid))
    }
}

impl From<User> for TargetUser {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        }
    }
}

/// Everything a step needs to know about who it runs for and how.
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    user: TargetUser,
    elevated: bool,
    dry_run: bool,
}

impl ProvisionContext {
    pub fn new(user: TargetUser, elevated: bool, dry_run: bool) -> Self {
        Self {
            user,
            elevated,
            dry_run,
        }
    }

    /// Build the context from the running process.
    pub fn detect(dry_run: bool) -> Result<Self> {
        let user = TargetUser::resolve()?;
        let elevated = nix::unistd::geteuid().is_root();
        tracing::info!(
            user = %user.name,
            uid = user.uid,
            home = %user.home.display(),
            elevated,
            dry_run,
            "Provisioning context resolved"
        );
        Ok(Self::new(user, elevated, dry_run))
    }

    pub fn user(&self) -> &TargetUser {
        &self.user
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// True when acting as root on behalf of some other user.
    pub fn acts_for_other_user(&self) -> bool {
        self.elevated && self.user.uid != 0
    }

    /// Returns true if `path` lies inside the target user's home directory.
    pub fn is_in_user_home(&self, path: &Path) -> bool {
        path.starts_with(&self.user.home)
    }

    /// Owner that a freshly written file at `path` should be handed to.
    ///
    /// `None` means leave ownership alone.
    pub fn owner_for(&self, path: &Path) -> Option<(Uid, Gid)> {
        if self.acts_for_other_user() && self.is_in_user_home(path) {
            Some((Uid::from_raw(self.user.uid), Gid::from_raw(self.user.gid)))
        } else {
            None
        }
    }
}
