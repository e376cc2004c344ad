use std::time::Duration;

use crawlbus_core::{Transport, TransportConfig};
use crawlbus_kafka::KafkaTransport;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::ClientConfig;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Host port the broker advertises; the container maps it one-to-one.
const KAFKA_PORT: u16 = 9092;

/// Spins up a single-node KRaft broker and returns a transport bound to it.
///
/// The `ContainerAsync` must be kept in scope for the test duration;
/// dropping it stops the broker.
pub async fn setup_kafka() -> (KafkaTransport, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("apache/kafka", "3.8.0")
        .with_exposed_port(ContainerPort::Tcp(KAFKA_PORT))
        .with_wait_for(WaitFor::message_on_stdout("Kafka Server started"))
        .with_mapped_port(KAFKA_PORT, ContainerPort::Tcp(KAFKA_PORT))
        .start()
        .await
        .expect("Failed to start Kafka container");

    let endpoint = format!("127.0.0.1:{KAFKA_PORT}");
    let config = TransportConfig::new([endpoint]).with_max_block(Duration::from_secs(10));
    let transport = KafkaTransport::new(config).expect("Failed to create Kafka transport");
    (transport, container)
}

/// Create `topic` with `partitions` partitions and wait until metadata
/// reports it.
pub async fn create_topic(transport: &KafkaTransport, topic: &str, partitions: i32) {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", transport.config().bootstrap_servers())
        .create()
        .expect("Failed to create admin client");
    let results = admin
        .create_topics(
            &[NewTopic::new(topic, partitions, TopicReplication::Fixed(1))],
            &AdminOptions::new().operation_timeout(Some(Duration::from_secs(10))),
        )
        .await
        .expect("Failed to create topic");
    for result in results {
        result.expect("Topic creation rejected");
    }

    // Retry until the topic is visible to metadata requests
    const MAX_RETRIES: u32 = 50;
    let mut retries = 0;
    loop {
        match transport.partition_count(topic).await {
            Ok(count) if count == partitions as u32 => break,
            other => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Topic {topic} not ready after {MAX_RETRIES} retries: {other:?}");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}
