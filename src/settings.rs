//! Set merge against the desktop settings store
//!
//! The store (gsettings/dconf) holds string-array values encoded as GVariant
//! text, e.g. `[]`, `@as []` or `['a', 'b']`. A merge is a read, a structured
//! parse into an ordered set, an append of missing candidates, and a write
//! back. Existing elements are never removed or reordered.
//!
//! # Guarantees
//!
//! - **Idempotent**: merging the same candidates twice writes nothing the
//!   second time
//! - **Monotonic**: the result always contains everything that was there
//! - **Non-destructive on garbage**: a value that does not parse is an error,
//!   never silently replaced by the empty set

use crate::command::{CommandRunner, CommandSpec, execute};
use crate::context::ProvisionContext;
use crate::error::{ProvisionError, Result};
use std::fmt::{self, Write as _};
use std::iter::Peekable;
use std::str::{Chars, FromStr};

pub const GSETTINGS: &str = "gsettings";

/// A `"<schema> <key>"` address in the settings store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub schema: String,
    pub key: String,
}

impl FromStr for StoreKey {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(schema), Some(key), None) if !schema.starts_with('-') => Ok(Self {
                schema: schema.to_string(),
                key: key.to_string(),
            }),
            _ => Err(ProvisionError::validation(format!(
                "store key must be \"<schema> <key>\", got {s:?}"
            ))),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.schema, self.key)
    }
}

/// Read/write access to serialized values in the store.
pub trait SettingsStore {
    /// Current serialized value, `Ok(None)` if the key is unreadable or
    /// absent. `Err(StoreUnavailable)` if there is no session to talk to.
    fn get(&self, key: &StoreKey) -> Result<Option<String>>;

    fn set(&self, key: &StoreKey, value: &str) -> Result<()>;
}

/// `gsettings` run inside the target user's session.
pub struct GsettingsStore<'a> {
    ctx: &'a ProvisionContext,
    runner: &'a dyn CommandRunner,
}

impl<'a> GsettingsStore<'a> {
    pub fn new(ctx: &'a ProvisionContext, runner: &'a dyn CommandRunner) -> Self {
        Self { ctx, runner }
    }

    /// Session bus address for the target user, if one is reachable.
    fn bus_address(&self) -> Result<String> {
        if !self.ctx.acts_for_other_user() {
            if let Ok(addr) = std::env::var("DBUS_SESSION_BUS_ADDRESS") {
                if !addr.is_empty() {
                    return Ok(addr);
                }
            }
        }
        let socket = self.ctx.user().session_bus_path();
        if socket.exists() {
            Ok(format!("unix:path={}", socket.display()))
        } else {
            Err(ProvisionError::store_unavailable(format!(
                "no session bus for {} at {}",
                self.ctx.user().name,
                socket.display()
            )))
        }
    }

    fn command(&self, spec: CommandSpec) -> Result<CommandSpec> {
        let user = self.ctx.user();
        let mut spec = spec
            .env("DBUS_SESSION_BUS_ADDRESS", self.bus_address()?)
            .env("HOME", user.home.display().to_string());
        if self.ctx.acts_for_other_user() {
            spec = spec.run_as(user.uid, user.gid);
        }
        Ok(spec)
    }
}

/// gsettings reports a dead session on stderr rather than with a special code.
fn is_session_failure(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    ["cannot autolaunch d-bus", "could not connect", "failed to connect"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

impl SettingsStore for GsettingsStore<'_> {
    fn get(&self, key: &StoreKey) -> Result<Option<String>> {
        let spec = self.command(CommandSpec::query(
            GSETTINGS,
            ["get", key.schema.as_str(), key.key.as_str()],
        ))?;
        let out = execute(self.runner, self.ctx, &spec)?;
        if out.success {
            Ok(Some(out.stdout.trim().to_string()))
        } else if is_session_failure(&out.stderr) {
            Err(ProvisionError::store_unavailable(out.failure_reason()))
        } else {
            tracing::debug!(key = %key, reason = %out.failure_reason(), "value unreadable");
            Ok(None)
        }
    }

    fn set(&self, key: &StoreKey, value: &str) -> Result<()> {
        let spec = self.command(CommandSpec::mutation(
            GSETTINGS,
            ["set", key.schema.as_str(), key.key.as_str(), value],
        ))?;
        let out = execute(self.runner, self.ctx, &spec)?;
        if !out.success && is_session_failure(&out.stderr) {
            return Err(ProvisionError::store_unavailable(out.failure_reason()));
        }
        out.ensure_success(&format!("gsettings set {key}"))
    }
}

/// Parse a GVariant string array (`[]`, `@as []`, `['a', "b"]`).
pub fn parse_string_array(text: &str) -> Result<Vec<String>> {
    let malformed = |why: &str| ProvisionError::validation(format!("malformed string array ({why}): {text}"));

    let body = text.trim();
    let body = body.strip_prefix("@as").map(str::trim_start).unwrap_or(body);
    let inner = body
        .strip_prefix('[')
        .and_then(|b| b.strip_suffix(']'))
        .ok_or_else(|| malformed("expected [...]"))?;

    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(quote) = chars.next() else { break };
        if quote != '\'' && quote != '"' {
            return Err(malformed("expected a quoted string"));
        }

        let mut item = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => item.push(decode_escape(&mut chars).map_err(|why| malformed(why.as_str()))?),
                c if c == quote => {
                    closed = true;
                    break;
                }
                c => item.push(c),
            }
        }
        if !closed {
            return Err(malformed("unterminated string"));
        }
        items.push(item);

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.next() {
            None => break,
            Some(',') => {
                while chars.next_if(|c| c.is_whitespace()).is_some() {}
                if chars.peek().is_none() {
                    return Err(malformed("trailing comma"));
                }
            }
            Some(_) => return Err(malformed("expected ','")),
        }
    }
    Ok(items)
}

/// Decode the escape following a backslash. Unknown escapes are rejected
/// rather than guessed, so a value we cannot read is never rewritten.
fn decode_escape(chars: &mut Peekable<Chars<'_>>) -> std::result::Result<char, String> {
    let c = chars.next().ok_or_else(|| "dangling escape".to_string())?;
    let decoded = match c {
        'a' => '\u{07}',
        'b' => '\u{08}',
        'f' => '\u{0c}',
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        'v' => '\u{0b}',
        '\\' | '\'' | '"' => c,
        'u' => decode_code_point(chars, 4)?,
        'U' => decode_code_point(chars, 8)?,
        other => return Err(format!("unknown escape \\{other}")),
    };
    Ok(decoded)
}

fn decode_code_point(chars: &mut Peekable<Chars<'_>>, digits: usize) -> std::result::Result<char, String> {
    let hex: String = chars.by_ref().take(digits).collect();
    if hex.len() != digits || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("expected {digits} hex digits in unicode escape"));
    }
    u32::from_str_radix(&hex, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| format!("invalid code point {hex}"))
}

/// Serialize to GVariant text: `[]` or `['a', 'b']`.
pub fn format_string_array(items: &[String]) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|item| {
            let mut out = String::with_capacity(item.len() + 2);
            out.push('\'');
            for c in item.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '\'' => out.push_str("\\'"),
                    '\u{07}' => out.push_str("\\a"),
                    '\u{08}' => out.push_str("\\b"),
                    '\u{0c}' => out.push_str("\\f"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    '\u{0b}' => out.push_str("\\v"),
                    c if c.is_control() => {
                        let _ = write!(out, "\\u{:04x}", u32::from(c));
                    }
                    c => out.push(c),
                }
            }
            out.push('\'');
            out
        })
        .collect();
    format!("[{}]", quoted.join(", "))
}

/// Append candidates missing from `existing`, in candidate order, once each.
///
/// Returns the candidates that were actually added.
pub fn merge_into(existing: &mut Vec<String>, candidates: &[String]) -> Vec<String> {
    let mut added = Vec::new();
    for candidate in candidates {
        if !existing.contains(candidate) {
            existing.push(candidate.clone());
            added.push(candidate.clone());
        }
    }
    added
}

/// Serialized result of a merge and the candidates it added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedSet {
    pub value: String,
    pub added: Vec<String>,
}

/// Pure merge on serialized values. `None` is the empty set.
pub fn merge_serialized(current: Option<&str>, candidates: &[String]) -> Result<MergedSet> {
    let mut items = match current {
        Some(text) => parse_string_array(text)?,
        None => Vec::new(),
    };
    let added = merge_into(&mut items, candidates);
    Ok(MergedSet {
        value: format_string_array(&items),
        added,
    })
}

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub key: StoreKey,
    pub added: Vec<String>,
    /// Serialized value after the merge.
    pub value: String,
}

impl MergeReport {
    pub fn detail(&self) -> String {
        if self.added.is_empty() {
            format!("{} already contains every candidate", self.key)
        } else {
            format!("added {} to {}", self.added.join(", "), self.key)
        }
    }
}

/// Merges identifiers into a collection held by a [`SettingsStore`].
pub struct StateSetMerger<'a> {
    store: &'a dyn SettingsStore,
}

impl<'a> StateSetMerger<'a> {
    pub fn new(store: &'a dyn SettingsStore) -> Self {
        Self { store }
    }

    pub fn merge(&self, key: &StoreKey, candidates: &[String]) -> Result<MergeReport> {
        let current = self.store.get(key)?;
        if current.is_none() {
            tracing::debug!(key = %key, "no readable value, starting from the empty set");
        }
        let MergedSet { value, added } = merge_serialized(current.as_deref(), candidates)?;

        if added.is_empty() {
            tracing::info!(key = %key, "nothing to merge");
        } else {
            self.store.set(key, &value)?;
            tracing::info!(key = %key, added = ?added, "merged into settings store");
        }

        Ok(MergeReport {
            key: key.clone(),
            added,
            value,
        })
    }
}
