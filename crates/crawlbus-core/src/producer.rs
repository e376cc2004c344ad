//! Buffered producers.
//!
//! `send` only buffers. Records reach the transport when the buffer hits
//! `batch_size`, when the next send would overflow `buffer_memory`, or on
//! an explicit `flush`/`close`.

use bytes::Bytes;
use tokio::time::Instant;

use crate::config::TransportConfig;
use crate::error::BusError;
use crate::message::{DeliveryReport, OutgoingRecord};
use crate::partitioner::{Partitioner, Partitioning};
use crate::retry::RetryPolicy;
use crate::traits::ProducerSession;

// ----------------------------------------------------------------------------
// Shared buffer and delivery
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ProducerCore<P: ProducerSession> {
    session: P,
    topic: String,
    config: TransportConfig,
    backoff: RetryPolicy,
    buffer: Vec<OutgoingRecord>,
    buffered_bytes: usize,
    closed: bool,
}

impl<P: ProducerSession> ProducerCore<P> {
    fn new(session: P, topic: String, config: TransportConfig) -> Self {
        let backoff = RetryPolicy::default().with_max_attempts(config.retries.saturating_add(1));
        Self {
            session,
            topic,
            config,
            backoff,
            buffer: Vec::new(),
            buffered_bytes: 0,
            closed: false,
        }
    }

    async fn enqueue(&mut self, records: Vec<OutgoingRecord>) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        // Reject the whole call before buffering any of it.
        if let Some(record) = records
            .iter()
            .find(|r| r.size() > self.config.max_request_size)
        {
            return Err(BusError::MessageTooLarge {
                size: record.size(),
                max: self.config.max_request_size,
            });
        }

        let incoming: usize = records.iter().map(OutgoingRecord::size).sum();
        if !self.buffer.is_empty() && self.buffered_bytes + incoming > self.config.buffer_memory {
            tracing::debug!(
                topic = %self.topic,
                buffered_bytes = self.buffered_bytes,
                incoming,
                "Buffer budget reached, flushing before send"
            );
            self.flush().await?;
        }

        self.buffered_bytes += incoming;
        self.buffer.extend(records);

        // The records are accepted at this point. A failed automatic delivery
        // keeps them buffered and reports through the next flush or close.
        if self.buffered_bytes >= self.config.batch_size
            && let Err(e) = self.flush().await
        {
            tracing::warn!(
                topic = %self.topic,
                pending = self.buffer.len(),
                error = %e,
                "Automatic delivery failed, records stay buffered"
            );
        }
        Ok(())
    }

    /// Deliver everything buffered. Transient failures are retried until
    /// `max_block` elapses. Acknowledged records leave the buffer after every
    /// attempt, so only the failed ones are sent again.
    async fn flush(&mut self) -> Result<(), BusError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let max_block = self.config.max_block;
        let deadline = Instant::now() + max_block;
        let mut attempt = 1;

        loop {
            let report =
                match tokio::time::timeout_at(deadline, self.session.deliver(&self.buffer)).await {
                    Ok(report) => report,
                    Err(_) => {
                        tracing::warn!(topic = %self.topic, pending = self.buffer.len(), "Flush deadline exceeded");
                        return Err(BusError::ProduceTimeout(max_block));
                    }
                };
            let delivered = self.buffer.len();
            let Some(e) = self.retain_failed(report) else {
                tracing::trace!(topic = %self.topic, count = delivered, "Flushed");
                return Ok(());
            };

            if e.is_retryable() && attempt < self.backoff.max_attempts {
                let delay = self.backoff.delay_for_attempt(attempt);
                tracing::warn!(
                    topic = %self.topic,
                    attempt,
                    pending = self.buffer.len(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Delivery failed, retrying"
                );
                if Instant::now() + delay >= deadline {
                    tokio::time::sleep_until(deadline).await;
                    return Err(BusError::ProduceTimeout(max_block));
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            } else {
                tracing::warn!(topic = %self.topic, pending = self.buffer.len(), error = %e, "Delivery failed");
                return Err(e);
            }
        }
    }

    /// Drop acknowledged records from the buffer, keeping the failed ones in
    /// send order. Returns the first failure, if any.
    fn retain_failed(&mut self, report: DeliveryReport) -> Option<BusError> {
        let mut outcomes = report.into_outcomes().into_iter();
        let mut failure = None;
        self.buffer.retain(|_| match outcomes.next() {
            Some(Ok(())) => false,
            Some(Err(e)) => {
                failure.get_or_insert(e);
                true
            }
            None => true,
        });
        self.buffered_bytes = self.buffer.iter().map(OutgoingRecord::size).sum();
        if self.buffer.is_empty() {
            return None;
        }
        Some(failure.unwrap_or_else(|| {
            BusError::Transport("delivery report is missing records".into())
        }))
    }

    async fn close(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Ok(());
        }
        self.flush().await?;
        self.closed = true;
        self.session.release();
        tracing::debug!(topic = %self.topic, "Producer closed");
        Ok(())
    }
}

impl<P: ProducerSession> Drop for ProducerCore<P> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if !self.buffer.is_empty() {
            tracing::warn!(
                topic = %self.topic,
                pending = self.buffer.len(),
                "Producer dropped with undelivered messages"
            );
        }
        self.session.release();
    }
}

// ----------------------------------------------------------------------------
// Producers
// ----------------------------------------------------------------------------

/// Producer without routing keys. The transport spreads records over
/// partitions, so there is no ordering across calls.
#[derive(Debug)]
pub struct SimpleProducer<P: ProducerSession> {
    core: ProducerCore<P>,
}

impl<P: ProducerSession> SimpleProducer<P> {
    pub(crate) fn new(session: P, topic: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            core: ProducerCore::new(session, topic.into(), config),
        }
    }

    /// Buffer `messages`. `Ok` means they were accepted and will be
    /// delivered by an automatic or explicit flush; an error means none of
    /// them was buffered, so the call can be retried without duplicates.
    pub async fn send<I, B>(&mut self, messages: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let records = messages
            .into_iter()
            .map(|m| OutgoingRecord::unkeyed(m.into()))
            .collect();
        self.core.enqueue(records).await
    }

    pub async fn flush(&mut self) -> Result<(), BusError> {
        self.core.flush().await
    }

    /// Flush, then release the connection. On a failed flush the producer
    /// stays open with its buffer intact.
    pub async fn close(&mut self) -> Result<(), BusError> {
        self.core.close().await
    }

    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    /// Buffered, unacknowledged records.
    pub fn pending(&self) -> usize {
        self.core.buffer.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.core.buffered_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed
    }
}

/// Producer that routes every message of a `send` by its key, so messages
/// sharing a key keep their send order.
#[derive(Debug)]
pub struct KeyedProducer<P: ProducerSession, R: Partitioner = Partitioning> {
    core: ProducerCore<P>,
    partitioner: R,
    partitions: u32,
}

impl<P: ProducerSession, R: Partitioner> KeyedProducer<P, R> {
    pub(crate) fn new(
        session: P,
        topic: impl Into<String>,
        config: TransportConfig,
        partitioner: R,
        partitions: u32,
    ) -> Self {
        Self {
            core: ProducerCore::new(session, topic.into(), config),
            partitioner,
            partitions,
        }
    }

    /// Buffer `messages` under `key`, with the same acceptance rules as
    /// [`SimpleProducer::send`].
    pub async fn send<K, I, B>(&mut self, key: K, messages: I) -> Result<(), BusError>
    where
        K: Into<Bytes>,
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let key = key.into();
        let partition = self.partitioner.partition(&key, self.partitions);
        let records = messages
            .into_iter()
            .map(|m| OutgoingRecord::routed(partition, key.clone(), m.into()))
            .collect();
        self.core.enqueue(records).await
    }

    /// Partition `key` routes to.
    pub fn partition_for(&self, key: &[u8]) -> u32 {
        self.partitioner.partition(key, self.partitions)
    }

    pub async fn flush(&mut self) -> Result<(), BusError> {
        self.core.flush().await
    }

    /// Flush, then release the connection. On a failed flush the producer
    /// stays open with its buffer intact.
    pub async fn close(&mut self) -> Result<(), BusError> {
        self.core.close().await
    }

    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn pending(&self) -> usize {
        self.core.buffer.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.core.buffered_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::memory::{MemoryBroker, MemoryProducer};
    use crate::traits::Transport;

    async fn broker(partitions: u32) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.create_topic("t", partitions).unwrap();
        broker
    }

    async fn session(broker: &MemoryBroker) -> MemoryProducer {
        broker
            .open_producer("t", &TransportConfig::default())
            .await
            .unwrap()
    }

    fn total(broker: &MemoryBroker, partitions: u32) -> u64 {
        (0..partitions)
            .map(|p| broker.high_watermark("t", p).unwrap())
            .sum()
    }

    #[tokio::test]
    async fn send_buffers_until_flush() {
        let broker = broker(2).await;
        let mut producer = SimpleProducer::new(session(&broker).await, "t", TransportConfig::default());
        producer.send(["a", "bb", "ccc"]).await.unwrap();
        assert_eq!(producer.pending(), 3);
        assert_eq!(producer.buffered_bytes(), 6);
        assert_eq!(total(&broker, 2), 0);

        producer.flush().await.unwrap();
        assert_eq!(producer.pending(), 0);
        assert_eq!(total(&broker, 2), 3);
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn batch_size_triggers_delivery() {
        let broker = broker(1).await;
        let config = TransportConfig::default().with_buffer_limits(8, 64);
        let mut producer = SimpleProducer::new(session(&broker).await, "t", config);
        producer.send(["1234"]).await.unwrap();
        assert_eq!(total(&broker, 1), 0);
        producer.send(["5678"]).await.unwrap();
        assert_eq!(total(&broker, 1), 2);
        assert_eq!(producer.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn buffer_budget_flushes_before_overflow() {
        let broker = broker(1).await;
        let config = TransportConfig::default().with_buffer_limits(10, 10);
        let mut producer = SimpleProducer::new(session(&broker).await, "t", config);
        producer.send(["123456"]).await.unwrap();
        producer.send(["abcdef"]).await.unwrap();
        // The first record went out before the second was buffered.
        assert_eq!(total(&broker, 1), 1);
        assert_eq!(producer.buffered_bytes(), 6);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_whole() {
        let broker = broker(1).await;
        let config = TransportConfig::default().with_max_request_size(4);
        let mut producer = SimpleProducer::new(session(&broker).await, "t", config);
        let err = producer.send(["ok", "too long"]).await.unwrap_err();
        assert_eq!(err, BusError::MessageTooLarge { size: 8, max: 4 });
        assert_eq!(producer.pending(), 0);
    }

    #[tokio::test]
    async fn keyed_send_routes_every_message_to_one_partition() {
        let broker = broker(4).await;
        let mut producer = KeyedProducer::new(
            session(&broker).await,
            "t",
            TransportConfig::default(),
            Partitioning::Fingerprint,
            4,
        );
        let key = "http://a.example/x";
        let expected = producer.partition_for(key.as_bytes());
        producer.send(key, ["one", "two", "three"]).await.unwrap();
        producer.close().await.unwrap();

        for p in 0..4 {
            let want = if p == expected { 3 } else { 0 };
            assert_eq!(broker.high_watermark("t", p), Some(want));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let broker = broker(1).await;
        let mut producer = SimpleProducer::new(session(&broker).await, "t", TransportConfig::default());
        producer.send(["x"]).await.unwrap();
        broker.fail_next_requests(2);
        producer.flush().await.unwrap();
        assert_eq!(total(&broker, 1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_past_deadline_times_out_and_keeps_buffer() {
        let broker = broker(1).await;
        let config = TransportConfig::default().with_max_block(Duration::from_millis(500));
        let mut producer = SimpleProducer::new(session(&broker).await, "t", config);
        producer.send(["x", "y"]).await.unwrap();

        broker.disconnect();
        let err = producer.close().await.unwrap_err();
        assert_eq!(err, BusError::ProduceTimeout(Duration::from_millis(500)));
        assert!(!producer.is_closed());
        assert_eq!(producer.pending(), 2);

        broker.reconnect();
        producer.close().await.unwrap();
        assert!(producer.is_closed());
        assert_eq!(total(&broker, 1), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_last_error() {
        let broker = broker(1).await;
        let mut config = TransportConfig::default();
        config.retries = 1;
        let mut producer = SimpleProducer::new(session(&broker).await, "t", config);
        producer.send(["x"]).await.unwrap();
        broker.fail_next_requests(5);
        assert!(matches!(
            producer.flush().await,
            Err(BusError::TransportUnavailable(_))
        ));
        assert_eq!(producer.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_automatic_delivery_keeps_records_accepted() {
        let broker = broker(1).await;
        let config = TransportConfig::default()
            .with_buffer_limits(4, 64)
            .with_max_block(Duration::from_millis(300));
        let mut producer = SimpleProducer::new(session(&broker).await, "t", config);

        broker.disconnect();
        // Reaching batch_size flushes, which fails; the record stays accepted.
        producer.send(["url-1"]).await.unwrap();
        assert_eq!(producer.pending(), 1);
        assert_eq!(total(&broker, 1), 0);

        broker.reconnect();
        producer.close().await.unwrap();
        assert_eq!(total(&broker, 1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_send_buffers_nothing() {
        let broker = broker(1).await;
        let config = TransportConfig::default()
            .with_buffer_limits(8, 8)
            .with_max_block(Duration::from_millis(300));
        let mut producer = SimpleProducer::new(session(&broker).await, "t", config);
        producer.send(["12345"]).await.unwrap();

        broker.disconnect();
        // The buffer budget forces a flush before buffering, and it fails.
        assert!(producer.send(["abcde"]).await.is_err());
        assert_eq!(producer.pending(), 1);

        broker.reconnect();
        producer.send(["abcde"]).await.unwrap();
        producer.close().await.unwrap();
        assert_eq!(total(&broker, 1), 2);
    }

    /// Session that rejects the record with payload `b` once.
    #[derive(Debug, Default)]
    struct RejectOnce {
        delivered: Arc<Mutex<Vec<Bytes>>>,
        rejected: bool,
    }

    impl ProducerSession for RejectOnce {
        fn deliver(
            &mut self,
            records: &[OutgoingRecord],
        ) -> impl Future<Output = DeliveryReport> + Send {
            let outcomes = records
                .iter()
                .map(|record| {
                    if &record.payload[..] == b"b" && !self.rejected {
                        self.rejected = true;
                        return Err(BusError::TransportUnavailable("reset".into()));
                    }
                    self.delivered.lock().unwrap().push(record.payload.clone());
                    Ok(())
                })
                .collect();
            std::future::ready(DeliveryReport::new(outcomes))
        }

        fn release(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn retry_resends_only_failed_records() {
        let session = RejectOnce::default();
        let delivered = session.delivered.clone();
        let mut producer = SimpleProducer::new(session, "t", TransportConfig::default());
        producer.send(["a", "b", "c"]).await.unwrap();
        producer.flush().await.unwrap();

        assert_eq!(producer.pending(), 0);
        assert_eq!(producer.buffered_bytes(), 0);
        let mut payloads = delivered.lock().unwrap().clone();
        payloads.sort();
        assert_eq!(
            payloads,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
    }

    /// Session whose deliveries never complete.
    #[derive(Debug)]
    struct StalledSession;

    impl ProducerSession for StalledSession {
        fn deliver(
            &mut self,
            _records: &[OutgoingRecord],
        ) -> impl Future<Output = DeliveryReport> + Send {
            std::future::pending()
        }

        fn release(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_delivery_times_out() {
        let config = TransportConfig::default().with_max_block(Duration::from_secs(2));
        let mut producer = SimpleProducer::new(StalledSession, "t", config);
        producer.send(["x"]).await.unwrap();
        assert_eq!(
            producer.flush().await,
            Err(BusError::ProduceTimeout(Duration::from_secs(2)))
        );
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let broker = broker(1).await;
        let mut producer = SimpleProducer::new(session(&broker).await, "t", TransportConfig::default());
        producer.close().await.unwrap();
        producer.close().await.unwrap();
        assert_eq!(producer.send(["x"]).await, Err(BusError::Closed));
    }
}
