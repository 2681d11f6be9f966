//! Error types for twincdc

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TwinCdcError {
    /// A change record violates the shape the factory relies on.
    #[error("Invalid change record: {0}")]
    InvalidChange(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Replication error: {0}")]
    ReplicationError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Sink error: {0}")]
    SinkError(String),

    #[error("Kafka error: {0}")]
    KafkaError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Event queue closed")]
    QueueClosed,

    /// A sink delivered the first `delivered` events of a batch and then
    /// failed on the next one.
    #[error("Delivered {delivered} event(s) before failing: {source}")]
    PartialDelivery {
        delivered: usize,
        source: Box<TwinCdcError>,
    },

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, TwinCdcError>;

impl TwinCdcError {
    pub fn invalid_change(msg: impl Into<String>) -> Self {
        TwinCdcError::InvalidChange(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        TwinCdcError::SinkError(msg.into())
    }

    /// Wrap a failure that happened after `delivered` events of a batch
    /// were already accepted. Nothing delivered leaves the error as is.
    pub fn after_delivered(delivered: usize, error: TwinCdcError) -> Self {
        if delivered == 0 {
            return error;
        }
        TwinCdcError::PartialDelivery {
            delivered,
            source: Box::new(error),
        }
    }
}

impl From<anyhow::Error> for TwinCdcError {
    fn from(err: anyhow::Error) -> Self {
        TwinCdcError::InternalError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_delivered() {
        let untouched = TwinCdcError::after_delivered(0, TwinCdcError::sink("down"));
        assert!(matches!(untouched, TwinCdcError::SinkError(_)));

        let partial = TwinCdcError::after_delivered(3, TwinCdcError::sink("down"));
        assert!(matches!(partial, TwinCdcError::PartialDelivery { delivered: 3, .. }));
        assert_eq!(partial.to_string(), "Delivered 3 event(s) before failing: Sink error: down");
    }
}
