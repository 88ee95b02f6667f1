use thiserror::Error;

/// Errors surfaced by the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The named stream does not exist.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The named consumer does not exist on the stream.
    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    /// A stream or consumer configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A publish was rejected (e.g. no stream accepts the subject).
    #[error("publish failed: {0}")]
    Publish(String),

    /// An acknowledgement referenced a delivery the bus no longer tracks.
    #[error("unknown delivery: stream={stream} consumer={consumer} seq={seq}")]
    UnknownDelivery {
        /// Stream the delivery came from.
        stream: String,
        /// Consumer the delivery was made to.
        consumer: String,
        /// Stream sequence of the delivery.
        seq: u64,
    },

    /// The bus connection is gone.
    #[error("bus connection closed")]
    Closed,
}
