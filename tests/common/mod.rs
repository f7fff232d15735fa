// Shared fakes for the integration tests.
#![allow(dead_code)]

use deskprov::command::{CommandOutput, CommandRunner, CommandSpec};
use deskprov::context::{ProvisionContext, TargetUser};
use deskprov::error::{ProvisionError, Result};
use deskprov::settings::{SettingsStore, StoreKey};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

/// Context for an unprivileged user whose home is `home`.
pub fn context(home: &Path, dry_run: bool) -> ProvisionContext {
    let user = TargetUser {
        name: "tester".to_string(),
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        home: home.to_path_buf(),
    };
    ProvisionContext::new(user, false, dry_run)
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Records every command. Any command whose arguments contain one of the
/// `broken` identifiers exits non-zero.
#[derive(Default)]
pub struct FakeRunner {
    broken: Vec<String>,
    pub calls: RefCell<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(ids: &[&str]) -> Self {
        Self {
            broken: strings(ids),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(ToString::to_string).collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(spec.clone());
        match spec.args.iter().find(|a| self.broken.contains(a)) {
            Some(bad) => Ok(CommandOutput::failed(
                1,
                format!("error: target not found: {bad}\n"),
            )),
            None => Ok(CommandOutput::ok("")),
        }
    }
}

/// In-memory settings store keyed by `"<schema> <key>"`.
#[derive(Default)]
pub struct MemoryStore {
    values: RefCell<HashMap<String, String>>,
    unavailable: bool,
    pub writes: RefCell<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose session cannot be reached.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn with_value(self, key: &str, value: &str) -> Self {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    pub fn write_count(&self) -> usize {
        *self.writes.borrow()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &StoreKey) -> Result<Option<String>> {
        if self.unavailable {
            return Err(ProvisionError::store_unavailable("no session bus for tester"));
        }
        Ok(self.values.borrow().get(&key.to_string()).cloned())
    }

    fn set(&self, key: &StoreKey, value: &str) -> Result<()> {
        if self.unavailable {
            return Err(ProvisionError::store_unavailable("no session bus for tester"));
        }
        *self.writes.borrow_mut() += 1;
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
