use thiserror::Error;

/// Error taxonomy shared by every store and engine.
///
/// Engines recover `Conflict` locally; `Validation` is raised to the caller
/// synchronously; `Transient` is converted into a retry with backoff by the
/// processors; `Fatal` always surfaces with enough context to diagnose.
#[derive(Error, Debug)]
pub enum HeraldError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Invariant violation in {operation} on {entity}: {reason}")]
    Fatal {
        operation: String,
        entity: String,
        reason: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Queue is full: {0}")]
    QueueFull(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HeraldError {
    pub fn fatal(
        operation: impl Into<String>,
        entity: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        HeraldError::Fatal {
            operation: operation.into(),
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Whether a processor may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HeraldError::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, HeraldError::Conflict(_) | HeraldError::QueueFull(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, HeraldError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, HeraldError>;
