use std::time::Duration;

use crawlbus_core::{BusError, BusSettings, MessageBus, Partitioner, SpiderLogReader};

use crate::integration::common::{create_topic, setup_kafka};

const WAIT: Duration = Duration::from_secs(10);

fn settings(feed_partitions: u32, log_partitions: u32) -> BusSettings {
    BusSettings {
        spider_feed_partitions: feed_partitions,
        spider_log_partitions: log_partitions,
        max_next_requests: 5,
        lag_refresh_interval: Duration::from_millis(500),
        ..BusSettings::default()
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn partition_count_mismatch_against_live_topic() {
    let (transport, _container) = setup_kafka().await;
    create_topic(&transport, "frontier-todo", 2).await;

    let bus = MessageBus::new(transport, settings(4, 1)).unwrap();
    let err = bus.spider_feed().consumer(Some(0)).await.unwrap_err();
    assert!(matches!(
        err,
        BusError::ConfigurationMismatch {
            expected: 4,
            actual: 2,
            ..
        }
    ));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn keyed_messages_reach_the_owning_partition_in_order() {
    let (transport, _container) = setup_kafka().await;
    create_topic(&transport, "frontier-todo", 4).await;

    let bus = MessageBus::new(transport, settings(4, 1)).unwrap();
    let feed = bus.spider_feed();
    let mut producer = feed.producer().await.unwrap();
    let key = "http://a.example/x";
    let partition = producer.partition_for(key.as_bytes());
    producer
        .send(key, ["first", "second", "third"])
        .await
        .unwrap();
    producer.close().await.unwrap();

    let mut consumer = feed.consumer(Some(partition)).await.unwrap();
    let mut payloads = Vec::new();
    while payloads.len() < 3 {
        let batch = consumer.pull(10, WAIT).await.unwrap();
        assert!(!batch.is_empty(), "timed out waiting for messages");
        payloads.extend(batch.into_iter().map(|m| m.payload));
    }
    assert_eq!(payloads, vec!["first", "second", "third"]);
    consumer.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn position_before_first_pull_resumes_from_checkpoint() {
    let (transport, _container) = setup_kafka().await;
    create_topic(&transport, "frontier-todo", 2).await;

    let bus = MessageBus::new(transport, settings(2, 1)).unwrap();
    let feed = bus.spider_feed();
    let consumer = feed.consumer(Some(1)).await.unwrap();
    assert_eq!(consumer.position(1).await.unwrap(), 0);
    drop(consumer);

    let mut producer = feed.producer().await.unwrap();
    let key = (0..100)
        .map(|i| format!("http://host-{i}.example/"))
        .find(|k| producer.partition_for(k.as_bytes()) == 1)
        .unwrap();
    producer.send(key, ["a", "b", "c"]).await.unwrap();
    producer.close().await.unwrap();

    let mut consumer = feed.consumer(Some(1)).await.unwrap();
    let mut read = 0;
    while read < 2 {
        let batch = consumer.pull(2 - read, WAIT).await.unwrap();
        assert!(!batch.is_empty(), "timed out waiting for messages");
        read += batch.len();
    }
    consumer.close().await.unwrap();

    let resumed = feed.consumer(Some(1)).await.unwrap();
    assert_eq!(resumed.position(1).await.unwrap(), 2);
    assert_eq!(resumed.committed_offset(1).await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn commit_on_close_feeds_admission_control() {
    let (transport, _container) = setup_kafka().await;
    create_topic(&transport, "frontier-todo", 1).await;

    let bus = MessageBus::new(transport, settings(1, 1)).unwrap();
    let feed = bus.spider_feed();
    let mut producer = feed.producer().await.unwrap();
    for i in 0..10 {
        producer.send("key", [format!("url-{i}")]).await.unwrap();
    }
    producer.close().await.unwrap();

    let mut admission = feed.admission().await.unwrap();
    assert_eq!(admission.lag(0), Some(10));
    assert!(admission.available_partitions().is_empty());

    let mut consumer = feed.consumer(Some(0)).await.unwrap();
    let mut read = 0;
    while read < 8 {
        read += consumer.pull(8 - read, WAIT).await.unwrap().len();
    }
    consumer.close().await.unwrap();

    let mut reopened = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if admission.available_partitions() == vec![0] {
            reopened = true;
            break;
        }
    }
    assert!(reopened, "partition did not reopen: {:?}", admission.snapshot());
    assert_eq!(admission.lag(0), Some(2));
    admission.stop().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn spider_log_groups_fan_out() {
    let (transport, _container) = setup_kafka().await;
    create_topic(&transport, "frontier-done", 2).await;

    let bus = MessageBus::new(transport, settings(1, 2)).unwrap();
    let log = bus.spider_log();
    let mut producer = log.producer().await.unwrap();
    let fingerprint = "0123456789abcdef0123456789abcdef01234567";
    let partition = crawlbus_core::Partitioning::Fingerprint.partition(fingerprint.as_bytes(), 2);
    producer.send(fingerprint, ["done"]).await.unwrap();
    producer.close().await.unwrap();

    for reader in [SpiderLogReader::DbWriter, SpiderLogReader::StrategyWorker] {
        let mut consumer = log.consumer(reader, Some(partition)).await.unwrap();
        let batch = consumer.pull(10, WAIT).await.unwrap();
        assert_eq!(batch.len(), 1, "{reader} missed the message");
        consumer.close().await.unwrap();
    }
}
