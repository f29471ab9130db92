//! Error taxonomy shared by every subsystem. Kinds, not identities: callers
//! match on variant, not on a specific failing call.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VertexError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("resource limit reached: {0}")]
    LimitReached(String),

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O failed: {0}")]
    IoFailed(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("plugin function not implemented: {0}")]
    NotImplemented(String),
}

pub type VertexResult<T> = Result<T, VertexError>;

impl VertexError {
    /// Wraps a plugin call behind a null-pointer guard: `None` becomes
    /// `NotImplemented` instead of propagating the missing function.
    pub fn from_missing_fn(name: &str) -> Self {
        VertexError::NotImplemented(name.to_string())
    }
}
