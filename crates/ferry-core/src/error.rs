use thiserror::Error;

pub type FerryResult<T> = Result<T, FerryError>;

#[derive(Debug, Error)]
pub enum FerryError {
    /// Path escape attempt. Messages never carry a resolved absolute path.
    #[error("security violation: {0}")]
    Security(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A task observed its job's cancellation signal at a chunk boundary.
    #[error("transfer cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FerryError {
    /// Stable label for progress events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FerryError::Security(_) => "security",
            FerryError::NotFound(_) => "not_found",
            FerryError::Permission(_) => "permission",
            FerryError::Storage(_) | FerryError::Io(_) | FerryError::Other(_) => "storage",
            FerryError::Conflict(_) => "conflict",
            FerryError::InvalidRequest(_) => "invalid_request",
            FerryError::InvalidState(_) => "invalid_state",
            FerryError::Cancelled => "cancelled",
            FerryError::Config(_) => "config",
        }
    }

    /// Classify a filesystem error, attaching `context` (never an absolute path).
    pub fn from_io(err: &std::io::Error, context: impl std::fmt::Display) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => FerryError::NotFound(context.to_string()),
            ErrorKind::PermissionDenied => FerryError::Permission(context.to_string()),
            _ => FerryError::Storage(format!("{context}: {err}")),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FerryError::Cancelled)
    }
}
