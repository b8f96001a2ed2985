//! Supervisor error types.

use hostagent_protocol::{ErrorCode, ExposeParseError};
use thiserror::Error;

use crate::checksum::ChecksumError;
use crate::shell::ShellError;

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors surfaced by the supervisor and the request service.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Binary or managed process does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Binary content does not hash to the requested checksum.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// A managed process with this name is alive.
    #[error("process {0} is already running")]
    AlreadyRunning(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Host-side failure.
    #[error("{0}")]
    Internal(String),

    /// A handler panicked.
    #[error("panic: {0}")]
    Unknown(String),
}

impl SupervisorError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::NotFound(_) => ErrorCode::NotFound,
            SupervisorError::IntegrityMismatch { .. } => ErrorCode::IntegrityMismatch,
            SupervisorError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            SupervisorError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            SupervisorError::Internal(_) => ErrorCode::Internal,
            SupervisorError::Unknown(_) => ErrorCode::Unknown,
        }
    }
}

impl From<ChecksumError> for SupervisorError {
    fn from(err: ChecksumError) -> Self {
        match err {
            ChecksumError::NotFound(path) => {
                SupervisorError::NotFound(format!("could not find binary {path}"))
            }
            ChecksumError::Mismatch {
                path,
                expected,
                actual,
            } => SupervisorError::IntegrityMismatch {
                path,
                expected,
                actual,
            },
            other => SupervisorError::Internal(other.to_string()),
        }
    }
}

impl From<ShellError> for SupervisorError {
    fn from(err: ShellError) -> Self {
        SupervisorError::Internal(err.to_string())
    }
}

impl From<ExposeParseError> for SupervisorError {
    fn from(err: ExposeParseError) -> Self {
        SupervisorError::InvalidArgument(err.to_string())
    }
}
