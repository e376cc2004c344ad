use crawlbus_core::BusError;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::task::JoinError;

/// Classify a librdkafka error. Connectivity and timeout codes become
/// retryable `TransportUnavailable`; everything else is `Transport`.
pub(crate) fn map_kafka_error(error: KafkaError) -> BusError {
    match error.rdkafka_error_code() {
        Some(code) if is_transient(code) => BusError::TransportUnavailable(error.to_string()),
        _ => BusError::Transport(error.to_string()),
    }
}

fn is_transient(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Resolve
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::BrokerNotAvailable
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::QueueFull
    )
}

pub(crate) fn map_join_error(error: JoinError) -> BusError {
    BusError::Transport(format!("Blocking Kafka call failed: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_retryable() {
        let err = map_kafka_error(KafkaError::MetadataFetch(RDKafkaErrorCode::AllBrokersDown));
        assert!(matches!(err, BusError::TransportUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn other_codes_are_not() {
        let err = map_kafka_error(KafkaError::MetadataFetch(
            RDKafkaErrorCode::TopicAuthorizationFailed,
        ));
        assert!(matches!(err, BusError::Transport(_)));
        assert!(!err.is_retryable());
    }
}
