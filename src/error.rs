use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LegerError {
    #[error("invalid input: {0}")]
    UserInput(String),

    #[error("not authenticated with {target}; run `leger auth login` first")]
    Unauthenticated { target: String },

    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("source is corrupt: {0}")]
    SourceCorrupt(String),

    #[error("malformed source location '{location}': {reason}")]
    MalformedSource { location: String, reason: String },

    #[error("validation failed:\n{0}")]
    ValidationFailed(crate::validate::ValidationResult),

    #[error("secret '{name}' unavailable: {reason}")]
    SecretUnavailable { name: String, reason: String },

    #[error("secrets daemon unreachable at {url}: {reason}")]
    DaemonUnavailable { url: String, reason: String },

    #[error("{tool} {step} failed (exit {status:?}): {stderr}")]
    EngineFailure {
        tool: String,
        step: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("service manager {step} failed for '{unit}' (exit {status:?}): {stderr}")]
    ServiceManagerFailure {
        step: String,
        unit: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("binary '{binary}' missing on PATH; install it or set it in leger.toml")]
    ToolMissing { binary: String },

    #[error("state inconsistent: {0}")]
    StateInconsistent(String),

    #[error("backup '{id}' is corrupt: {reason}")]
    BackupCorrupt { id: String, reason: String },

    #[error("deployment '{0}' is locked by another leger process")]
    Locked(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("{primary}; additionally: {secondary}")]
    Composed {
        primary: Box<LegerError>,
        secondary: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected error: {0}")]
    Other(String),
}

impl LegerError {
    /// Process exit code for this error: 1 generic, 2 invalid arguments,
    /// 3 authentication, 4 validation, 5 user cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            LegerError::UserInput(_) | LegerError::MalformedSource { .. } => 2,
            LegerError::Unauthenticated { .. } => 3,
            LegerError::ValidationFailed(_) => 4,
            LegerError::Cancelled(_) => 5,
            LegerError::Composed { primary, .. } => primary.exit_code(),
            _ => 1,
        }
    }

    /// Wrap a follow-up outcome (e.g. a rollback result) around the original
    /// failure so neither is lost.
    pub fn compose(self, secondary: impl Into<String>) -> Self {
        LegerError::Composed {
            primary: Box::new(self),
            secondary: secondary.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LegerError>;
