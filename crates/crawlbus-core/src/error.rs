use std::time::Duration;

use thiserror::Error;

/// Error types shared by every stream, producer and consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The topic's live partition count differs from the configured one.
    #[error("partition count mismatch for topic '{topic}': configured {expected}, actual {actual}")]
    ConfigurationMismatch {
        topic: String,
        expected: u32,
        actual: u32,
    },

    /// Missing or invalid settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The topic does not exist on the broker.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// The partition is not part of this consumer's current assignment.
    #[error("Partition {partition} of topic '{topic}' is not assigned to this consumer")]
    PartitionNotAssigned { topic: String, partition: u32 },

    /// Another live member of the group statically owns the partition.
    #[error("Partition {partition} of topic '{topic}' is already owned in group '{group}'")]
    PartitionOwned {
        topic: String,
        group: String,
        partition: u32,
    },

    /// Buffered sends were not acknowledged before the buffering deadline.
    #[error("Produce timed out after {}ms", .0.as_millis())]
    ProduceTimeout(Duration),

    /// A single message exceeds the maximum request size.
    #[error("Message of {size} bytes exceeds the maximum request size of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// The broker endpoints could not be reached.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Offsets for lag computation could not be fetched.
    #[error("Lag fetch failed: {0}")]
    LagFetchFailure(String),

    /// The stream handle was already closed.
    #[error("Stream is closed")]
    Closed,

    /// Any other broker-reported failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BusError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::TransportUnavailable(_)
                | BusError::ProduceTimeout(_)
                | BusError::LagFetchFailure(_)
        )
    }

    /// Returns true if this error points at a deployment problem that must
    /// surface immediately instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BusError::ConfigurationMismatch { .. } | BusError::Config(_) | BusError::UnknownTopic(_)
        )
    }
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(BusError::TransportUnavailable("refused".into()).is_retryable());
        assert!(BusError::ProduceTimeout(Duration::from_secs(1)).is_retryable());
        assert!(BusError::LagFetchFailure("reset".into()).is_retryable());
        assert!(!BusError::Closed.is_retryable());
        assert!(
            !BusError::PartitionNotAssigned {
                topic: "t".into(),
                partition: 1,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_fatal_errors_are_never_retryable() {
        let mismatch = BusError::ConfigurationMismatch {
            topic: "frontier-todo".into(),
            expected: 4,
            actual: 2,
        };
        assert!(mismatch.is_fatal());
        assert!(!mismatch.is_retryable());
        assert!(BusError::Config("bad".into()).is_fatal());
        assert!(!BusError::TransportUnavailable("down".into()).is_fatal());
    }

    #[test]
    fn test_mismatch_message_is_explicit() {
        let err = BusError::ConfigurationMismatch {
            topic: "frontier-todo".into(),
            expected: 4,
            actual: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("partition count mismatch"));
        assert!(msg.contains("configured 4, actual 2"));
    }

    #[test]
    fn test_produce_timeout_message() {
        let err = BusError::ProduceTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Produce timed out after 1500ms");
    }
}
