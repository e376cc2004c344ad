use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crawlbus_core::{Assignment, BusError, Transport, TransportConfig};
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::FutureProducer;
use rdkafka::TopicPartitionList;

use crate::client::{base_config, consumer_config, probe_config, producer_config};
use crate::consumer::KafkaConsumer;
use crate::error::{map_join_error, map_kafka_error};
use crate::probe::KafkaOffsetProbe;
use crate::producer::KafkaProducer;

/// Timeout for metadata, offset and commit requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Transport`] backed by a Kafka cluster.
#[derive(Clone)]
pub struct KafkaTransport {
    config: TransportConfig,
    metadata: Arc<BaseConsumer>,
    request_timeout: Duration,
}

impl fmt::Debug for KafkaTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaTransport")
            .field("config", &self.config)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl KafkaTransport {
    /// Validate `config` and create the metadata client. No request is sent
    /// until the first stream is opened.
    pub fn new(config: TransportConfig) -> Result<Self, BusError> {
        config.validate()?;
        let metadata: BaseConsumer = base_config(&config)
            .create()
            .map_err(|e| BusError::Config(format!("Invalid Kafka client settings: {e}")))?;
        Ok(Self {
            config,
            metadata: Arc::new(metadata),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Transport for KafkaTransport {
    type Consumer = KafkaConsumer;
    type Producer = KafkaProducer;
    type Probe = KafkaOffsetProbe;

    async fn partition_count(&self, topic: &str) -> Result<u32, BusError> {
        let metadata = self.metadata.clone();
        let name = topic.to_string();
        let timeout = self.request_timeout;

        tokio::task::spawn_blocking(move || -> Result<u32, BusError> {
            let metadata = metadata
                .fetch_metadata(Some(&name), timeout)
                .map_err(map_kafka_error)?;
            let Some(entry) = metadata.topics().iter().find(|t| t.name() == name) else {
                return Err(BusError::UnknownTopic(name));
            };
            match entry.error() {
                Some(code)
                    if RDKafkaErrorCode::from(code) == RDKafkaErrorCode::UnknownTopicOrPartition =>
                {
                    Err(BusError::UnknownTopic(name))
                }
                Some(code) => Err(BusError::Transport(format!(
                    "Metadata for topic '{name}' failed: {}",
                    RDKafkaErrorCode::from(code)
                ))),
                None if entry.partitions().is_empty() => Err(BusError::UnknownTopic(name)),
                None => Ok(entry.partitions().len() as u32),
            }
        })
        .await
        .map_err(map_join_error)?
    }

    async fn open_consumer(
        &self,
        topic: &str,
        group: &str,
        assignment: Assignment,
    ) -> Result<KafkaConsumer, BusError> {
        let client_id = format!("{topic}-{}", assignment.label());
        let consumer: StreamConsumer = consumer_config(&self.config, group, &client_id)
            .create()
            .map_err(map_kafka_error)?;

        match assignment {
            Assignment::Static(partition) => {
                // Offset::Invalid resumes from the committed offset.
                let mut list = TopicPartitionList::new();
                list.add_partition(topic, partition as i32);
                consumer.assign(&list).map_err(map_kafka_error)?;
            }
            Assignment::Dynamic => {
                consumer.subscribe(&[topic]).map_err(map_kafka_error)?;
            }
        }
        tracing::debug!(%topic, %group, %client_id, "Kafka consumer created");
        Ok(KafkaConsumer::new(consumer, topic.to_string(), self.request_timeout))
    }

    async fn open_producer(
        &self,
        topic: &str,
        config: &TransportConfig,
    ) -> Result<KafkaProducer, BusError> {
        let producer: FutureProducer = producer_config(config)
            .create()
            .map_err(map_kafka_error)?;
        tracing::debug!(%topic, "Kafka producer created");
        Ok(KafkaProducer::new(producer, topic.to_string(), config.max_block))
    }

    async fn open_offset_probe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<KafkaOffsetProbe, BusError> {
        let client: BaseConsumer = probe_config(&self.config, group)
            .create()
            .map_err(map_kafka_error)?;
        Ok(KafkaOffsetProbe::new(
            client,
            topic.to_string(),
            self.request_timeout,
        ))
    }
}
