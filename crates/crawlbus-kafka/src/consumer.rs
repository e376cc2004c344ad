use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crawlbus_core::{BusError, ConsumerSession, Message};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::Instant;

use crate::error::{map_join_error, map_kafka_error};

/// Kafka group member, either assigned one partition or subscribed.
pub struct KafkaConsumer {
    /// Dropped on release, which closes the broker connections.
    consumer: Option<Arc<StreamConsumer>>,
    topic: String,
    /// Next offset to read, per partition, for the partitions read so far.
    positions: HashMap<u32, u64>,
    timeout: Duration,
}

impl fmt::Debug for KafkaConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaConsumer")
            .field("topic", &self.topic)
            .field("positions", &self.positions)
            .field("released", &self.consumer.is_none())
            .finish_non_exhaustive()
    }
}

impl KafkaConsumer {
    pub(crate) fn new(consumer: StreamConsumer, topic: String, timeout: Duration) -> Self {
        Self {
            consumer: Some(Arc::new(consumer)),
            topic,
            positions: HashMap::new(),
            timeout,
        }
    }

    fn client(&self) -> Result<Arc<StreamConsumer>, BusError> {
        self.consumer.clone().ok_or(BusError::Closed)
    }

    fn record(&mut self, message: &rdkafka::message::BorrowedMessage<'_>) -> Option<Message> {
        let partition = u32::try_from(message.partition()).ok()?;
        let offset = u64::try_from(message.offset()).ok()?;
        self.positions.insert(partition, offset + 1);
        Some(Message {
            partition,
            offset,
            key: message.key().map(Bytes::copy_from_slice),
            payload: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
        })
    }
}

impl ConsumerSession for KafkaConsumer {
    fn assignment(&self) -> Vec<u32> {
        let Some(consumer) = &self.consumer else {
            return Vec::new();
        };
        match consumer.assignment() {
            Ok(list) => list
                .elements_for_topic(&self.topic)
                .iter()
                .filter_map(|e| u32::try_from(e.partition()).ok())
                .collect(),
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "Failed to read assignment");
                Vec::new()
            }
        }
    }

    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<Message>, BusError> {
        let consumer = self.client()?;
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < max {
            // Wait for the first message; after that take only what is
            // already queued.
            let received = if batch.is_empty() {
                tokio::time::timeout_at(deadline, consumer.recv()).await
            } else {
                tokio::time::timeout(Duration::ZERO, consumer.recv()).await
            };
            match received {
                Err(_) => break,
                Ok(Ok(message)) => {
                    if let Some(message) = self.record(&message) {
                        batch.push(message);
                    }
                }
                Ok(Err(e)) if batch.is_empty() => return Err(map_kafka_error(e)),
                Ok(Err(e)) => {
                    tracing::warn!(topic = %self.topic, error = %e, "Receive failed, returning partial batch");
                    break;
                }
            }
        }
        Ok(batch)
    }

    async fn position(&self, partition: u32) -> Result<u64, BusError> {
        if let Some(position) = self.positions.get(&partition) {
            return Ok(*position);
        }
        let consumer = self.client()?;
        let topic = self.topic.clone();
        let timeout = self.timeout;
        let partition = i32::try_from(partition)
            .map_err(|_| BusError::Config(format!("partition {partition} out of range")))?;

        // librdkafka has no position until the first fetch; resume where the
        // group does: its committed offset, else the earliest offset.
        tokio::task::spawn_blocking(move || -> Result<u64, BusError> {
            let fetched = consumer.position().map_err(map_kafka_error)?;
            if let Some(Offset::Offset(n)) = fetched
                .find_partition(&topic, partition)
                .map(|e| e.offset())
                && let Ok(n) = u64::try_from(n)
            {
                return Ok(n);
            }

            let mut list = TopicPartitionList::new();
            list.add_partition(&topic, partition);
            let committed = consumer
                .committed_offsets(list, timeout)
                .map_err(map_kafka_error)?;
            if let Some(Offset::Offset(n)) = committed
                .find_partition(&topic, partition)
                .map(|e| e.offset())
                && let Ok(n) = u64::try_from(n)
            {
                return Ok(n);
            }

            let (low, _) = consumer
                .fetch_watermarks(&topic, partition, timeout)
                .map_err(map_kafka_error)?;
            Ok(u64::try_from(low).unwrap_or(0))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn committed(&self, partition: u32) -> Result<Option<u64>, BusError> {
        let consumer = self.client()?;
        let topic = self.topic.clone();
        let timeout = self.timeout;
        let partition = i32::try_from(partition)
            .map_err(|_| BusError::Config(format!("partition {partition} out of range")))?;

        tokio::task::spawn_blocking(move || -> Result<Option<u64>, BusError> {
            let mut list = TopicPartitionList::new();
            list.add_partition(&topic, partition);
            let committed = consumer
                .committed_offsets(list, timeout)
                .map_err(map_kafka_error)?;
            Ok(committed
                .find_partition(&topic, partition)
                .and_then(|e| e.offset().to_raw())
                .and_then(|n| u64::try_from(n).ok()))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn commit(&mut self) -> Result<(), BusError> {
        let assigned = self.assignment();
        let mut list = TopicPartitionList::new();
        for (partition, position) in &self.positions {
            if !assigned.contains(partition) {
                continue;
            }
            let (Ok(p), Ok(offset)) = (i32::try_from(*partition), i64::try_from(*position)) else {
                continue;
            };
            list.add_partition_offset(&self.topic, p, Offset::Offset(offset))
                .map_err(map_kafka_error)?;
        }
        if list.count() == 0 {
            return Ok(());
        }

        let consumer = self.client()?;
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&list, CommitMode::Sync)
                .map_err(map_kafka_error)
        })
        .await
        .map_err(map_join_error)?
    }

    fn release(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        consumer.unsubscribe();
        if let Err(e) = consumer.unassign() {
            tracing::debug!(topic = %self.topic, error = %e, "Unassign failed on release");
        }
        // The last reference closes the client once in-flight blocking calls
        // holding a clone have returned.
        drop(consumer);
        tracing::debug!(topic = %self.topic, "Kafka consumer released");
    }
}

impl Drop for KafkaConsumer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use crawlbus_core::TransportConfig;

    use super::*;
    use crate::client::consumer_config;

    fn offline_consumer() -> KafkaConsumer {
        let config = TransportConfig::new(["127.0.0.1:1"]);
        let consumer: StreamConsumer = consumer_config(&config, "g", "t-0").create().unwrap();
        KafkaConsumer::new(consumer, "t".to_string(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn release_drops_the_client() {
        let mut consumer = offline_consumer();
        consumer.release();
        assert!(consumer.consumer.is_none());
        assert!(consumer.assignment().is_empty());
        assert_eq!(
            consumer.poll(1, Duration::from_millis(10)).await,
            Err(BusError::Closed)
        );
        assert_eq!(consumer.position(0).await, Err(BusError::Closed));
        // A second release is a no-op.
        consumer.release();
    }

    #[tokio::test]
    async fn position_uses_last_read_offset() {
        let mut consumer = offline_consumer();
        consumer.positions.insert(3, 41);
        assert_eq!(consumer.position(3).await, Ok(41));
    }
}
