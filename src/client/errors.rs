use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("Failed to decode response: {0}")]
    Decode(String),
    #[error("No active budget")]
    NoActiveBudget,
    #[error("Sync session ended")]
    SessionEnded,
}

impl SyncError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Classifies an HTTP error status and its `error` message.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => SyncError::Unauthorized(message),
            403 => SyncError::Forbidden(message),
            404 => SyncError::NotFound(message),
            409 => SyncError::Conflict(message),
            408 | 429 => SyncError::Transient(message),
            400..=499 => SyncError::Malformed(message),
            _ => SyncError::Transient(message),
        }
    }
}
