//! Error handling module for deskprov
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Step executors convert these into `StepResult`s at the step boundary; only
//! precondition and plan errors ever reach `main`.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for deskprov
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// IO errors tied to a specific path (deploys, backups, temp files)
    #[error("IO error at {path}: {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Validation errors (package identifiers, paths, store keys)
    #[error("Validation error: {0}")]
    Validation(String),

    /// External command could not be spawned or exited abnormally
    #[error("Command error: {0}")]
    Command(String),

    /// Settings store has no reachable session
    #[error("Settings store unavailable: {0}")]
    StoreUnavailable(String),

    /// Run state machine transition errors
    #[error("Run transition error: {0}")]
    RunTransition(#[from] crate::orchestrator::RunTransitionError),

    /// Precondition failures (privilege level, unsupported host)
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for deskprov operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

// Convenient error constructors
impl ProvisionError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a command error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a store-unavailable error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Attach a path to an I/O error
    pub fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PathIo {
            path: path.into(),
            source,
        }
    }
}
