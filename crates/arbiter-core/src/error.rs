//! Error types for Arbiter
//!
//! Ordinary contention is never an error: `start` and `timed_start` report it
//! as `Ok(false)`. The variants here cover caller misuse and registry failure.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug)]
pub enum LockError {
    // Protocol misuse (E300-E309)
    /// `start`/`timed_start` called while the session already holds its lock
    #[error("Session '{session}' already holds resource '{resource}'")]
    AlreadyStarted { session: String, resource: String },

    /// `stop` called while the session holds nothing
    #[error("Session '{session}' does not hold resource '{resource}'")]
    NotStarted { session: String, resource: String },

    /// The registry slot holds someone else's claim
    #[error("Session '{session}' lost ownership of resource '{resource}'{}", holder_suffix(.holder))]
    OwnershipLost {
        session: String,
        resource: String,
        holder: Option<String>,
    },

    /// Invalid session parameters
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration could not be loaded or failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Registry failures (E310-E319)
    /// The lock directory cannot be read or written
    #[error("Registry unavailable at {}: {reason}", .path.display())]
    RegistryUnavailable { path: PathBuf, reason: String },

    /// A record exists but cannot be trusted
    #[error("Corrupt lock record at {}: {reason}", .path.display())]
    CorruptRecord { path: PathBuf, reason: String },
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder
        .as_ref()
        .map(|h| format!(" (now held by {h})"))
        .unwrap_or_default()
}

impl LockError {
    pub(crate) fn unavailable(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::RegistryUnavailable {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn config(err: anyhow::Error) -> Self {
        Self::InvalidConfig(format!("{err:#}"))
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::CorruptRecord {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyStarted { .. } => "E300",
            Self::NotStarted { .. } => "E301",
            Self::OwnershipLost { .. } => "E302",
            Self::InvalidParameter(_) => "E303",
            Self::InvalidConfig(_) => "E304",
            Self::RegistryUnavailable { .. } => "E310",
            Self::CorruptRecord { .. } => "E311",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::OwnershipLost { resource, .. } => Some(format!("arbiter status {resource}")),
            Self::RegistryUnavailable { path, .. } => Some(format!(
                "Check that {} exists and is writable, or set ARBITER_LOCK_DIR",
                path.display()
            )),
            Self::CorruptRecord { .. } => Some("arbiter reap --purge-corrupt".to_string()),
            Self::InvalidConfig(_) => Some("arbiter config show".to_string()),
            _ => None,
        }
    }

    /// Whether this error is a caller bug rather than an infrastructure failure
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::AlreadyStarted { .. }
                | Self::NotStarted { .. }
                | Self::OwnershipLost { .. }
                | Self::InvalidParameter(_)
        )
    }

    /// Whether the shared registry itself failed
    pub fn is_registry_failure(&self) -> bool {
        matches!(
            self,
            Self::RegistryUnavailable { .. } | Self::CorruptRecord { .. }
        )
    }
}
