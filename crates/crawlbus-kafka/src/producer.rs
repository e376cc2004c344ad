use std::fmt;
use std::time::Duration;

use crawlbus_core::{BusError, DeliveryReport, OutgoingRecord, ProducerSession};
use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};

use crate::error::map_kafka_error;

/// Kafka producer for one topic.
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    flush_timeout: Duration,
}

impl fmt::Debug for KafkaProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaProducer")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl KafkaProducer {
    pub(crate) fn new(producer: FutureProducer, topic: String, flush_timeout: Duration) -> Self {
        Self {
            producer,
            topic,
            flush_timeout,
        }
    }
}

impl ProducerSession for KafkaProducer {
    async fn deliver(&mut self, records: &[OutgoingRecord]) -> DeliveryReport {
        let sends = records.iter().map(|record| {
            let mut future_record = FutureRecord::<[u8], [u8]>::to(&self.topic)
                .payload(record.payload.as_ref());
            if let Some(key) = &record.key {
                future_record = future_record.key(key.as_ref());
            }
            if let Some(partition) = record.partition {
                future_record = future_record.partition(partition as i32);
            }
            // The local queue is bounded by queue.buffering.max.kbytes; the
            // delivery itself is bounded by message.timeout.ms.
            self.producer.send(future_record, Duration::ZERO)
        });

        let outcomes: Vec<Result<(), BusError>> = join_all(sends)
            .await
            .into_iter()
            .map(|result| result.map(|_| ()).map_err(|(e, _)| map_kafka_error(e)))
            .collect();
        let report = DeliveryReport::new(outcomes);
        let failed = records.len() - report.acknowledged();
        if failed > 0 {
            tracing::warn!(topic = %self.topic, failed, total = records.len(), "Kafka delivery failed");
        }
        report
    }

    fn release(&mut self) {
        if let Err(e) = self.producer.flush(self.flush_timeout) {
            tracing::warn!(topic = %self.topic, error = %e, "Producer flush on release failed");
        }
    }
}
