//! Error taxonomy shared by every engine stage.

use crate::selector::SelectorError;

/// Engine errors. The variant decides how the work queue treats a failed key.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Watch disconnects, timeouts, unreachable API servers.
    #[error("transient: {0}")]
    Transient(String),
    /// Optimistic concurrency failure on a write.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Input that cannot be resolved until its author changes it.
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Whether the failed key should be requeued with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Transient(_) | RelayError::Conflict(_) | RelayError::Internal(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Transient(_) => "transient",
            RelayError::Conflict(_) => "conflict",
            RelayError::Malformed(_) => "malformed",
            RelayError::NotFound(_) => "not_found",
            RelayError::Internal(_) => "internal",
        }
    }
}

impl From<SelectorError> for RelayError {
    fn from(e: SelectorError) -> Self { RelayError::Malformed(e.to_string()) }
}

// Adapter failures surface through anyhow; they are infrastructure trouble unless proven otherwise.
impl From<anyhow::Error> for RelayError {
    fn from(e: anyhow::Error) -> Self { RelayError::Transient(format!("{:#}", e)) }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self { RelayError::Malformed(e.to_string()) }
}
