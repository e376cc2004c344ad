//! Logical streams of the crawl pipeline.
//!
//! Each façade binds one topic, its expected partition count and its
//! consumer group(s). The live partition count is checked before any
//! consumer or producer is handed out.

use std::fmt;
use std::time::Duration;

use crate::admission::AdmissionController;
use crate::config::TransportConfig;
use crate::consumer::StreamConsumer;
use crate::error::BusError;
use crate::message::Assignment;
use crate::partitioner::Partitioning;
use crate::producer::{KeyedProducer, SimpleProducer};
use crate::retry::RetryPolicy;
use crate::traits::Transport;

/// Topic binding shared by every façade.
#[derive(Debug, Clone)]
struct StreamBinding<T: Transport> {
    transport: T,
    topic: String,
    /// Expected partition count; `None` accepts whatever the topic has.
    partitions: Option<u32>,
    retry: RetryPolicy,
    transport_config: TransportConfig,
}

impl<T: Transport> StreamBinding<T> {
    /// Resolve the live partition count and compare it with the expected one.
    async fn checked_partition_count(&self) -> Result<u32, BusError> {
        let actual = self
            .retry
            .run("partition_count", || self.transport.partition_count(&self.topic))
            .await?;
        match self.partitions {
            Some(expected) if expected != actual => {
                tracing::error!(topic = %self.topic, expected, actual, "Partition count mismatch");
                Err(BusError::ConfigurationMismatch {
                    topic: self.topic.clone(),
                    expected,
                    actual,
                })
            }
            _ => Ok(actual),
        }
    }

    async fn open_consumer(
        &self,
        group: &str,
        partition: Option<u32>,
    ) -> Result<StreamConsumer<T::Consumer>, BusError> {
        let count = self.checked_partition_count().await?;
        if let Some(p) = partition
            && p >= count
        {
            return Err(BusError::Config(format!(
                "partition {p} out of range for topic '{}' with {count} partitions",
                self.topic
            )));
        }
        let assignment = Assignment::from_partition(partition);
        let session = self
            .retry
            .run("open_consumer", || {
                self.transport.open_consumer(&self.topic, group, assignment)
            })
            .await?;
        tracing::info!(
            topic = %self.topic,
            %group,
            partition = %assignment.label(),
            "Consumer opened"
        );
        Ok(StreamConsumer::new(session, self.topic.clone(), group))
    }

    async fn open_producer(&self) -> Result<(T::Producer, u32), BusError> {
        let count = self.checked_partition_count().await?;
        let session = self
            .retry
            .run("open_producer", || {
                self.transport.open_producer(&self.topic, &self.transport_config)
            })
            .await?;
        tracing::info!(topic = %self.topic, partitions = count, "Producer opened");
        Ok((session, count))
    }

    async fn keyed_producer(
        &self,
        partitioning: Partitioning,
    ) -> Result<KeyedProducer<T::Producer>, BusError> {
        let (session, count) = self.open_producer().await?;
        Ok(KeyedProducer::new(
            session,
            self.topic.clone(),
            self.transport_config.clone(),
            partitioning,
            count,
        ))
    }
}

// ----------------------------------------------------------------------------
// Spider log
// ----------------------------------------------------------------------------

/// Reader roles of the spider log. Each role is its own consumer group, so
/// both observe every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiderLogReader {
    DbWriter,
    StrategyWorker,
}

impl fmt::Display for SpiderLogReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpiderLogReader::DbWriter => f.write_str("db-writer"),
            SpiderLogReader::StrategyWorker => f.write_str("strategy-worker"),
        }
    }
}

/// Fetch results, fingerprint-keyed, fanned out to two reader groups.
#[derive(Debug, Clone)]
pub struct SpiderLogStream<T: Transport> {
    binding: StreamBinding<T>,
    dbw_group: String,
    sw_group: String,
}

impl<T: Transport> SpiderLogStream<T> {
    pub fn topic(&self) -> &str {
        &self.binding.topic
    }

    pub fn group(&self, reader: SpiderLogReader) -> &str {
        match reader {
            SpiderLogReader::DbWriter => &self.dbw_group,
            SpiderLogReader::StrategyWorker => &self.sw_group,
        }
    }

    /// Live partition count, checked against the configured one.
    pub async fn partition_count(&self) -> Result<u32, BusError> {
        self.binding.checked_partition_count().await
    }

    /// Producer keyed by URL fingerprint.
    pub async fn producer(&self) -> Result<KeyedProducer<T::Producer>, BusError> {
        self.binding.keyed_producer(Partitioning::Fingerprint).await
    }

    /// Consumer for `reader`, owning `partition` or balanced across the
    /// group when `None`.
    pub async fn consumer(
        &self,
        reader: SpiderLogReader,
        partition: Option<u32>,
    ) -> Result<StreamConsumer<T::Consumer>, BusError> {
        self.binding
            .open_consumer(self.group(reader), partition)
            .await
    }
}

// ----------------------------------------------------------------------------
// Spider feed
// ----------------------------------------------------------------------------

/// URLs to fetch. Each crawler worker owns one partition; producers route
/// by fingerprint or host name as configured.
#[derive(Debug, Clone)]
pub struct SpiderFeedStream<T: Transport> {
    binding: StreamBinding<T>,
    group: String,
    partitioning: Partitioning,
    max_next_requests: u64,
    lag_refresh_interval: Duration,
}

impl<T: Transport> SpiderFeedStream<T> {
    pub fn topic(&self) -> &str {
        &self.binding.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn partitioning(&self) -> Partitioning {
        self.partitioning
    }

    /// Admission threshold: outstanding work items a partition may hold.
    pub fn max_next_requests(&self) -> u64 {
        self.max_next_requests
    }

    pub async fn partition_count(&self) -> Result<u32, BusError> {
        self.binding.checked_partition_count().await
    }

    pub async fn consumer(
        &self,
        partition: Option<u32>,
    ) -> Result<StreamConsumer<T::Consumer>, BusError> {
        self.binding.open_consumer(&self.group, partition).await
    }

    pub async fn producer(&self) -> Result<KeyedProducer<T::Producer>, BusError> {
        self.binding.keyed_producer(self.partitioning).await
    }

    /// Start lag tracking of the feed group over every feed partition.
    pub async fn admission(&self) -> Result<AdmissionController, BusError> {
        let partitions = self.binding.checked_partition_count().await?;
        let probe = self
            .binding
            .retry
            .run("open_offset_probe", || {
                self.binding
                    .transport
                    .open_offset_probe(&self.binding.topic, &self.group)
            })
            .await?;
        Ok(AdmissionController::start(
            probe,
            self.binding.topic.clone(),
            self.group.clone(),
            partitions,
            self.max_next_requests,
            self.lag_refresh_interval,
        )
        .await)
    }
}

// ----------------------------------------------------------------------------
// Scoring log and stats log
// ----------------------------------------------------------------------------

/// Unkeyed stream with a single reader group that subscribes dynamically.
#[derive(Debug, Clone)]
pub struct SingleReaderStream<T: Transport> {
    binding: StreamBinding<T>,
    group: String,
}

/// Score updates from the strategy worker to the DB writer.
pub type ScoringLogStream<T> = SingleReaderStream<T>;

/// Telemetry read by the monitoring reader.
pub type StatsLogStream<T> = SingleReaderStream<T>;

impl<T: Transport> SingleReaderStream<T> {
    pub fn topic(&self) -> &str {
        &self.binding.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Live partition count; checked only when one is configured.
    pub async fn partition_count(&self) -> Result<u32, BusError> {
        self.binding.checked_partition_count().await
    }

    pub async fn consumer(&self) -> Result<StreamConsumer<T::Consumer>, BusError> {
        self.binding.open_consumer(&self.group, None).await
    }

    pub async fn producer(&self) -> Result<SimpleProducer<T::Producer>, BusError> {
        let (session, _) = self.binding.open_producer().await?;
        Ok(SimpleProducer::new(
            session,
            self.binding.topic.clone(),
            self.binding.transport_config.clone(),
        ))
    }
}

// ----------------------------------------------------------------------------
// Constructors used by the bus
// ----------------------------------------------------------------------------

/// Connection-level settings every façade shares.
#[derive(Debug, Clone)]
pub(crate) struct StreamContext<T: Transport> {
    pub transport: T,
    pub retry: RetryPolicy,
    pub transport_config: TransportConfig,
}

impl<T: Transport> StreamContext<T> {
    fn bind(&self, topic: &str, partitions: Option<u32>) -> StreamBinding<T> {
        StreamBinding {
            transport: self.transport.clone(),
            topic: topic.to_string(),
            partitions,
            retry: self.retry.clone(),
            transport_config: self.transport_config.clone(),
        }
    }
}

pub(crate) fn spider_log_stream<T: Transport>(
    ctx: &StreamContext<T>,
    topic: &str,
    partitions: u32,
    dbw_group: &str,
    sw_group: &str,
) -> SpiderLogStream<T> {
    SpiderLogStream {
        binding: ctx.bind(topic, Some(partitions)),
        dbw_group: dbw_group.to_string(),
        sw_group: sw_group.to_string(),
    }
}

pub(crate) struct FeedParams<'a> {
    pub topic: &'a str,
    pub partitions: u32,
    pub group: &'a str,
    pub partitioning: Partitioning,
    pub max_next_requests: u64,
    pub lag_refresh_interval: Duration,
}

pub(crate) fn spider_feed_stream<T: Transport>(
    ctx: &StreamContext<T>,
    params: FeedParams<'_>,
) -> SpiderFeedStream<T> {
    SpiderFeedStream {
        binding: ctx.bind(params.topic, Some(params.partitions)),
        group: params.group.to_string(),
        partitioning: params.partitioning,
        max_next_requests: params.max_next_requests,
        lag_refresh_interval: params.lag_refresh_interval,
    }
}

/// One factory for both single-reader streams; they differ only in topic,
/// group and expected partition count.
pub(crate) fn single_reader_stream<T: Transport>(
    ctx: &StreamContext<T>,
    topic: &str,
    group: &str,
    partitions: Option<u32>,
) -> SingleReaderStream<T> {
    SingleReaderStream {
        binding: ctx.bind(topic, partitions),
        group: group.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    const WAIT: Duration = Duration::from_millis(20);

    fn ctx(broker: &MemoryBroker) -> StreamContext<MemoryBroker> {
        StreamContext {
            transport: broker.clone(),
            retry: RetryPolicy::default()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(10)),
            transport_config: TransportConfig::default(),
        }
    }

    fn feed(ctx: &StreamContext<MemoryBroker>, partitions: u32) -> SpiderFeedStream<MemoryBroker> {
        spider_feed_stream(
            ctx,
            FeedParams {
                topic: "feed",
                partitions,
                group: "fetchers",
                partitioning: Partitioning::Hostname,
                max_next_requests: 5,
                lag_refresh_interval: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn mismatch_fails_before_opening_sessions() {
        let broker = MemoryBroker::new();
        broker.create_topic("feed", 4).unwrap();
        let stream = feed(&ctx(&broker), 8);

        let err = stream.consumer(Some(0)).await.unwrap_err();
        assert_eq!(
            err,
            BusError::ConfigurationMismatch {
                topic: "feed".into(),
                expected: 8,
                actual: 4,
            }
        );
        assert!(err.is_fatal());
        assert!(stream.producer().await.is_err());
        assert!(stream.admission().await.is_err());
        assert_eq!(broker.member_count("feed", "fetchers"), 0);
    }

    #[tokio::test]
    async fn static_partition_must_exist() {
        let broker = MemoryBroker::new();
        broker.create_topic("feed", 2).unwrap();
        let err = feed(&ctx(&broker), 2).consumer(Some(2)).await.unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[tokio::test]
    async fn feed_producer_uses_configured_partitioning() {
        let broker = MemoryBroker::new();
        broker.create_topic("feed", 4).unwrap();
        let stream = feed(&ctx(&broker), 4);

        let mut producer = stream.producer().await.unwrap();
        let a = producer.partition_for(b"https://Example.com/a");
        let b = producer.partition_for(b"https://example.com/b?q=1");
        assert_eq!(a, b);
        producer
            .send("https://example.com/a", ["payload"])
            .await
            .unwrap();
        producer.close().await.unwrap();

        let mut consumer = stream.consumer(Some(a)).await.unwrap();
        let batch = consumer.pull(10, WAIT).await.unwrap();
        assert_eq!(batch.len(), 1);
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn spider_log_readers_use_separate_groups() {
        let broker = MemoryBroker::new();
        broker.create_topic("log", 2).unwrap();
        let stream = spider_log_stream(&ctx(&broker), "log", 2, "dbw", "sw");
        assert_eq!(stream.group(SpiderLogReader::DbWriter), "dbw");
        assert_eq!(stream.group(SpiderLogReader::StrategyWorker), "sw");

        let dbw = stream
            .consumer(SpiderLogReader::DbWriter, Some(0))
            .await
            .unwrap();
        // Same partition, other group: no ownership conflict.
        let sw = stream
            .consumer(SpiderLogReader::StrategyWorker, Some(0))
            .await
            .unwrap();
        assert_eq!(dbw.group(), "dbw");
        assert_eq!(sw.group(), "sw");
    }

    #[tokio::test]
    async fn single_reader_without_expected_count_accepts_topic() {
        let broker = MemoryBroker::new();
        broker.create_topic("stats", 3).unwrap();
        let stream = single_reader_stream(&ctx(&broker), "stats", "readers", None);

        let mut producer = stream.producer().await.unwrap();
        producer.send(["a", "b", "c"]).await.unwrap();
        producer.close().await.unwrap();

        let mut consumer = stream.consumer().await.unwrap();
        assert_eq!(consumer.assignment(), vec![0, 1, 2]);
        assert_eq!(consumer.pull(10, WAIT).await.unwrap().len(), 3);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_outage_is_retried_on_open() {
        let broker = MemoryBroker::new();
        broker.create_topic("feed", 1).unwrap();
        let stream = feed(&ctx(&broker), 1);

        broker.fail_next_requests(2);
        let mut consumer = stream.consumer(Some(0)).await.unwrap();
        consumer.close().await.unwrap();

        broker.disconnect();
        assert!(matches!(
            stream.consumer(Some(0)).await,
            Err(BusError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn unknown_topic_is_not_retried() {
        let broker = MemoryBroker::new();
        let stream = single_reader_stream(&ctx(&broker), "missing", "g", Some(1));
        assert_eq!(
            stream.consumer().await.unwrap_err(),
            BusError::UnknownTopic("missing".into())
        );
    }
}
