use thiserror::Error;

/// Error taxonomy shared by every pipeline stage.
///
/// The variant determines the propagation policy: decode and transient
/// errors are nacked for redelivery (bounded by the consumer's max-deliver),
/// validation errors are recorded on the domain object and never retried,
/// conflicts surface to the caller or are treated as replays, and fatal
/// errors abort startup.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A bus message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A policy denial or constraint violation.
    #[error("validation error: {0}")]
    Validation(String),

    /// A bus, store, or policy call failed in a retryable way.
    #[error("transient error: {0}")]
    Transient(String),

    /// A uniqueness violation, expired proposal, or already-decided state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unrecoverable startup failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    /// Short class label used for error counters and log fields.
    #[must_use]
    pub fn class(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
            Self::Conflict(_) => "conflict",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Whether a consumer should nack the message for redelivery.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_and_retryability() {
        assert_eq!(PipelineError::Decode("x".into()).class(), "decode");
        assert!(PipelineError::Decode("x".into()).is_retryable());
        assert!(PipelineError::Transient("x".into()).is_retryable());
        assert!(!PipelineError::Validation("x".into()).is_retryable());
        assert!(!PipelineError::Conflict("x".into()).is_retryable());
        assert!(!PipelineError::Fatal("x".into()).is_retryable());
    }
}
