use bytes::Bytes;

use crate::error::BusError;

/// One unit of work read from a partition. The payload is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub partition: u32,
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

/// A record handed to the transport for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    /// Explicit target partition; `None` lets the transport spread records.
    pub partition: Option<u32>,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

impl OutgoingRecord {
    pub fn unkeyed(payload: Bytes) -> Self {
        Self {
            partition: None,
            key: None,
            payload,
        }
    }

    pub fn routed(partition: u32, key: Bytes, payload: Bytes) -> Self {
        Self {
            partition: Some(partition),
            key: Some(key),
            payload,
        }
    }

    /// Bytes this record occupies in a producer buffer.
    pub fn size(&self) -> usize {
        self.payload.len() + self.key.as_ref().map_or(0, Bytes::len)
    }
}

/// Outcome of one delivery call, one entry per record in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    outcomes: Vec<Result<(), BusError>>,
}

impl DeliveryReport {
    pub fn new(outcomes: Vec<Result<(), BusError>>) -> Self {
        Self { outcomes }
    }

    /// The same outcome for all `count` records, e.g. when the connection
    /// failed before anything was sent.
    pub fn uniform(count: usize, outcome: Result<(), BusError>) -> Self {
        Self {
            outcomes: vec![outcome; count],
        }
    }

    pub fn outcomes(&self) -> &[Result<(), BusError>] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<Result<(), BusError>> {
        self.outcomes
    }

    pub fn acknowledged(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    /// `Ok` if every record was acknowledged, otherwise the first failure.
    pub fn into_result(self) -> Result<(), BusError> {
        self.outcomes.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }
}

/// How a consumer obtains its partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Exclusive ownership of one partition, chosen by the caller.
    Static(u32),
    /// Partitions balanced by the broker across the group's live members.
    Dynamic,
}

impl Assignment {
    pub fn from_partition(partition: Option<u32>) -> Self {
        partition.map_or(Assignment::Dynamic, Assignment::Static)
    }

    /// Label used in client ids: the partition index or `all`.
    pub fn label(&self) -> String {
        match self {
            Assignment::Static(p) => p.to_string(),
            Assignment::Dynamic => "all".to_string(),
        }
    }
}

/// Latest written offset and a group's committed offset for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOffsets {
    pub partition: u32,
    pub high_watermark: u64,
    pub committed: Option<u64>,
}

impl PartitionOffsets {
    /// Outstanding messages for the group. A group that never committed
    /// owes the whole partition.
    pub fn lag(&self) -> u64 {
        self.high_watermark
            .saturating_sub(self.committed.unwrap_or(0))
    }
}
