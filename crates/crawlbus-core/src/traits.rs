use std::future::Future;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::error::BusError;
use crate::message::{Assignment, DeliveryReport, Message, OutgoingRecord, PartitionOffsets};

/// Connection to a partitioned, append-only log service.
///
/// Implementations are cheap to clone; every session they open is owned by
/// exactly one caller.
pub trait Transport: Send + Sync + Clone + 'static {
    type Consumer: ConsumerSession;
    type Producer: ProducerSession;
    type Probe: OffsetProbe;

    /// Live partition count of `topic`. Fails with `UnknownTopic` if absent.
    fn partition_count(&self, topic: &str) -> impl Future<Output = Result<u32, BusError>> + Send;

    fn open_consumer(
        &self,
        topic: &str,
        group: &str,
        assignment: Assignment,
    ) -> impl Future<Output = Result<Self::Consumer, BusError>> + Send;

    fn open_producer(
        &self,
        topic: &str,
        config: &TransportConfig,
    ) -> impl Future<Output = Result<Self::Producer, BusError>> + Send;

    /// Offsets reader for lag computation of `group` over `topic`.
    fn open_offset_probe(
        &self,
        topic: &str,
        group: &str,
    ) -> impl Future<Output = Result<Self::Probe, BusError>> + Send;
}

/// One group member's read session over a topic.
pub trait ConsumerSession: Send + 'static {
    /// Partitions currently owned by this session.
    fn assignment(&self) -> Vec<u32>;

    /// Read up to `max` messages, waiting at most `timeout` for the first one.
    fn poll(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Message>, BusError>> + Send;

    /// Next offset this session will read from an assigned `partition`.
    /// Before the first read this is the group's committed offset, or the
    /// earliest available offset if the group never committed.
    fn position(&self, partition: u32) -> impl Future<Output = Result<u64, BusError>> + Send;

    /// The group's committed offset for `partition`.
    fn committed(&self, partition: u32)
    -> impl Future<Output = Result<Option<u64>, BusError>> + Send;

    /// Commit the current read positions of all assigned partitions.
    fn commit(&mut self) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Leave the group and drop the connection. Must be safe to call once
    /// from `Drop`.
    fn release(&mut self);
}

/// Write session over a topic.
pub trait ProducerSession: Send + 'static {
    /// Deliver `records` in order; resolves once every record is either
    /// acknowledged or failed, with one outcome per record.
    fn deliver(
        &mut self,
        records: &[OutgoingRecord],
    ) -> impl Future<Output = DeliveryReport> + Send;

    fn release(&mut self);
}

/// Reads high watermarks and committed offsets for one (topic, group).
pub trait OffsetProbe: Send + Sync + 'static {
    fn offsets(
        &self,
        partitions: u32,
    ) -> impl Future<Output = Result<Vec<PartitionOffsets>, BusError>> + Send;
}
