use thiserror::Error;

/// Errors surfaced by canonical store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not reach the backend.
    #[error("store connection error: {0}")]
    Connection(String),

    /// The backend rejected an operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A value could not be serialized or deserialized.
    #[error("store serialization error: {0}")]
    Serialization(String),

    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or state-machine violation.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Whether this is the kind of error a consumer should retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Backend(_))
    }
}
