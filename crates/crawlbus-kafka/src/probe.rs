use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crawlbus_core::{BusError, OffsetProbe, PartitionOffsets};
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::TopicPartitionList;

/// Reads watermarks and a group's committed offsets without joining it.
#[derive(Clone)]
pub struct KafkaOffsetProbe {
    client: Arc<BaseConsumer>,
    topic: String,
    timeout: Duration,
}

impl fmt::Debug for KafkaOffsetProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaOffsetProbe")
            .field("topic", &self.topic)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KafkaOffsetProbe {
    pub(crate) fn new(client: BaseConsumer, topic: String, timeout: Duration) -> Self {
        Self {
            client: Arc::new(client),
            topic,
            timeout,
        }
    }
}

impl OffsetProbe for KafkaOffsetProbe {
    async fn offsets(&self, partitions: u32) -> Result<Vec<PartitionOffsets>, BusError> {
        let client = self.client.clone();
        let topic = self.topic.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || fetch_offsets(&client, &topic, partitions, timeout))
            .await
            .map_err(|e| BusError::LagFetchFailure(e.to_string()))?
    }
}

fn fetch_offsets(
    client: &BaseConsumer,
    topic: &str,
    partitions: u32,
    timeout: Duration,
) -> Result<Vec<PartitionOffsets>, BusError> {
    let lag_error = |e: rdkafka::error::KafkaError| BusError::LagFetchFailure(e.to_string());

    let mut list = TopicPartitionList::new();
    for partition in 0..partitions {
        list.add_partition(topic, partition as i32);
    }
    let committed = client
        .committed_offsets(list, timeout)
        .map_err(lag_error)?;

    (0..partitions)
        .map(|partition| -> Result<PartitionOffsets, BusError> {
            let (_, high) = client
                .fetch_watermarks(topic, partition as i32, timeout)
                .map_err(lag_error)?;
            let committed = committed
                .find_partition(topic, partition as i32)
                .and_then(|e| e.offset().to_raw())
                .and_then(|n| u64::try_from(n).ok());
            Ok(PartitionOffsets {
                partition,
                high_watermark: u64::try_from(high).unwrap_or(0),
                committed,
            })
        })
        .collect()
}
