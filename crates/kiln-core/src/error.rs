//! Error types for kiln.

use thiserror::Error;

use crate::JobId;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad input from the caller: malformed job id, unknown command, conflicting definition.
    #[error("user error: {0}")]
    User(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// An operator interrupt stopped the run.
    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),

    /// Internal consistency violation. Always fatal.
    #[error("internal consistency violation: {0}")]
    Bug(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn user(message: impl Into<String>) -> Self {
        Error::User(message.into())
    }

    pub fn bug(message: impl Into<String>) -> Self {
        Error::Bug(message.into())
    }

    /// Whether this error indicates a defect in kiln or a corrupted store.
    pub fn is_bug(&self) -> bool {
        matches!(self, Error::Bug(_) | Error::CycleDetected(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
