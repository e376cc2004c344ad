//! In-process transport.
//!
//! `MemoryBroker` keeps every topic as a set of append-only vectors and
//! every consumer group as a committed-offset table plus a member list.
//! It honours the same contract as a networked broker: static partition
//! ownership is exclusive within a group, dynamic members are rebalanced
//! on every join/leave, and offsets only advance on explicit commit.
//!
//! It also supports simulated outages (`disconnect`, `fail_next_requests`)
//! so callers can exercise their transient-failure paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{BusSettings, TransportConfig};
use crate::error::BusError;
use crate::message::{Assignment, DeliveryReport, Message, OutgoingRecord, PartitionOffsets};
use crate::traits::{ConsumerSession, OffsetProbe, ProducerSession, Transport};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<bytes::Bytes>,
    payload: bytes::Bytes,
}

#[derive(Debug, Default)]
struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    next_spread: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Static(u32),
    Dynamic,
}

#[derive(Debug, Default)]
struct GroupState {
    committed: HashMap<u32, u64>,
    members: BTreeMap<u64, Membership>,
}

impl GroupState {
    fn static_owner(&self, partition: u32) -> Option<u64> {
        self.members
            .iter()
            .find(|(_, m)| **m == Membership::Static(partition))
            .map(|(id, _)| *id)
    }

    /// Range assignment of the partitions no static member owns, over the
    /// dynamic members ordered by join order.
    fn assignment_of(&self, member_id: u64, partition_count: u32) -> Vec<u32> {
        match self.members.get(&member_id) {
            None => Vec::new(),
            Some(Membership::Static(p)) => vec![*p],
            Some(Membership::Dynamic) => {
                let free: Vec<u32> = (0..partition_count)
                    .filter(|p| self.static_owner(*p).is_none())
                    .collect();
                let dynamic: Vec<u64> = self
                    .members
                    .iter()
                    .filter(|(_, m)| **m == Membership::Dynamic)
                    .map(|(id, _)| *id)
                    .collect();
                let Some(index) = dynamic.iter().position(|id| *id == member_id) else {
                    return Vec::new();
                };
                let per_member = free.len() / dynamic.len();
                let extra = free.len() % dynamic.len();
                let start = index * per_member + index.min(extra);
                let len = per_member + usize::from(index < extra);
                free[start..start + len].to_vec()
            }
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<(String, String), GroupState>,
    next_member_id: u64,
}

impl BrokerState {
    fn topic(&self, topic: &str) -> Result<&TopicLog, BusError> {
        self.topics
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))
    }

    fn group_mut(&mut self, topic: &str, group: &str) -> &mut GroupState {
        self.groups
            .entry((topic.to_string(), group.to_string()))
            .or_default()
    }

    fn group(&self, topic: &str, group: &str) -> Option<&GroupState> {
        self.groups.get(&(topic.to_string(), group.to_string()))
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    appended: tokio::sync::Notify,
    disconnected: AtomicBool,
    failures_left: AtomicU32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned broker mutex");
            poisoned.into_inner()
        })
    }

    fn check_reachable(&self) -> Result<(), BusError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BusError::TransportUnavailable(
                "memory broker is disconnected".into(),
            ));
        }
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::TransportUnavailable(
                "injected transport failure".into(),
            ));
        }
        Ok(())
    }
}

/// In-process partitioned log.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker with every topic named in `settings` already created. Topics
    /// without a configured partition count get one partition.
    pub fn with_topics(settings: &BusSettings) -> Result<Self, BusError> {
        let broker = Self::new();
        broker.create_topic(&settings.spider_feed_topic, settings.spider_feed_partitions)?;
        broker.create_topic(&settings.spider_log_topic, settings.spider_log_partitions)?;
        broker.create_topic(
            &settings.scoring_log_topic,
            settings.scoring_log_partitions.unwrap_or(1),
        )?;
        broker.create_topic(
            &settings.stats_log_topic,
            settings.stats_log_partitions.unwrap_or(1),
        )?;
        Ok(broker)
    }

    /// Create a topic. Partition counts are fixed for the topic's life.
    pub fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), BusError> {
        if partitions == 0 {
            return Err(BusError::Config(format!(
                "topic '{topic}' needs at least one partition"
            )));
        }
        let mut state = self.shared.lock();
        if state.topics.contains_key(topic) {
            return Err(BusError::Config(format!("topic '{topic}' already exists")));
        }
        state.topics.insert(
            topic.to_string(),
            TopicLog {
                partitions: vec![Vec::new(); partitions as usize],
                next_spread: 0,
            },
        );
        Ok(())
    }

    /// Offset the next record appended to `partition` will receive.
    pub fn high_watermark(&self, topic: &str, partition: u32) -> Option<u64> {
        let state = self.shared.lock();
        let log = state.topics.get(topic)?;
        log.partitions
            .get(partition as usize)
            .map(|p| p.len() as u64)
    }

    pub fn committed_offset(&self, topic: &str, group: &str, partition: u32) -> Option<u64> {
        let state = self.shared.lock();
        state
            .group(topic, group)?
            .committed
            .get(&partition)
            .copied()
    }

    /// Live members of `group` on `topic`.
    pub fn member_count(&self, topic: &str, group: &str) -> usize {
        let state = self.shared.lock();
        state.group(topic, group).map_or(0, |g| g.members.len())
    }

    /// Make every request fail with `TransportUnavailable` until `reconnect`.
    pub fn disconnect(&self) {
        self.shared.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.shared.disconnected.store(false, Ordering::SeqCst);
    }

    /// Fail the next `count` requests with `TransportUnavailable`.
    pub fn fail_next_requests(&self, count: u32) {
        self.shared.failures_left.store(count, Ordering::SeqCst);
    }
}

impl Transport for MemoryBroker {
    type Consumer = MemoryConsumer;
    type Producer = MemoryProducer;
    type Probe = MemoryProbe;

    async fn partition_count(&self, topic: &str) -> Result<u32, BusError> {
        self.shared.check_reachable()?;
        let state = self.shared.lock();
        Ok(state.topic(topic)?.partitions.len() as u32)
    }

    async fn open_consumer(
        &self,
        topic: &str,
        group: &str,
        assignment: Assignment,
    ) -> Result<MemoryConsumer, BusError> {
        self.shared.check_reachable()?;
        let mut state = self.shared.lock();
        let partition_count = state.topic(topic)?.partitions.len() as u32;

        let membership = match assignment {
            Assignment::Static(partition) => {
                if partition >= partition_count {
                    return Err(BusError::Config(format!(
                        "partition {partition} out of range for topic '{topic}' with {partition_count} partitions"
                    )));
                }
                if state.group_mut(topic, group).static_owner(partition).is_some() {
                    return Err(BusError::PartitionOwned {
                        topic: topic.to_string(),
                        group: group.to_string(),
                        partition,
                    });
                }
                Membership::Static(partition)
            }
            Assignment::Dynamic => Membership::Dynamic,
        };

        let member_id = state.next_member_id;
        state.next_member_id += 1;
        state
            .group_mut(topic, group)
            .members
            .insert(member_id, membership);
        tracing::debug!(%topic, %group, member_id, ?assignment, "Consumer joined group");

        Ok(MemoryConsumer {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            member_id,
            positions: HashMap::new(),
            released: false,
        })
    }

    async fn open_producer(
        &self,
        topic: &str,
        _config: &TransportConfig,
    ) -> Result<MemoryProducer, BusError> {
        self.shared.check_reachable()?;
        self.shared.lock().topic(topic)?;
        Ok(MemoryProducer {
            shared: self.shared.clone(),
            topic: topic.to_string(),
        })
    }

    async fn open_offset_probe(&self, topic: &str, group: &str) -> Result<MemoryProbe, BusError> {
        self.shared.check_reachable()?;
        self.shared.lock().topic(topic)?;
        Ok(MemoryProbe {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
        })
    }
}

/// Consumer session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    member_id: u64,
    /// Read positions of the partitions this member has fetched from.
    positions: HashMap<u32, u64>,
    released: bool,
}

impl MemoryConsumer {
    fn current_assignment(&self, state: &BrokerState) -> Vec<u32> {
        let partition_count = state
            .topics
            .get(&self.topic)
            .map_or(0, |t| t.partitions.len() as u32);
        state
            .group(&self.topic, &self.group)
            .map(|g| g.assignment_of(self.member_id, partition_count))
            .unwrap_or_default()
    }

    fn start_offset(state: &BrokerState, topic: &str, group: &str, partition: u32) -> u64 {
        state
            .group(topic, group)
            .and_then(|g| g.committed.get(&partition).copied())
            .unwrap_or(0)
    }

    /// Take up to `max` records, one per assigned partition per pass.
    fn fetch(&mut self, max: usize) -> Result<Vec<Message>, BusError> {
        let state = self.shared.lock();
        let assigned = self.current_assignment(&state);

        // Partitions revoked by a rebalance restart from the committed
        // offset if they come back.
        self.positions.retain(|p, _| assigned.contains(p));
        for &p in &assigned {
            if !self.positions.contains_key(&p) {
                let start = Self::start_offset(&state, &self.topic, &self.group, p);
                self.positions.insert(p, start);
            }
        }

        let log = state.topic(&self.topic)?;
        let mut batch = Vec::new();
        loop {
            let mut progressed = false;
            for &p in &assigned {
                if batch.len() >= max {
                    return Ok(batch);
                }
                let Some(records) = log.partitions.get(p as usize) else {
                    continue;
                };
                let position = self.positions.entry(p).or_insert(0);
                if let Some(record) = records.get(*position as usize) {
                    batch.push(Message {
                        partition: p,
                        offset: *position,
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                    });
                    *position += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(batch);
            }
        }
    }
}

impl ConsumerSession for MemoryConsumer {
    fn assignment(&self) -> Vec<u32> {
        if self.released {
            return Vec::new();
        }
        let state = self.shared.lock();
        self.current_assignment(&state)
    }

    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<Message>, BusError> {
        if self.released {
            return Err(BusError::Closed);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = self.shared.clone();
        loop {
            self.shared.check_reachable()?;
            let appended = shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.fetch(max)?;
            if !batch.is_empty() || max == 0 {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(batch);
            }
        }
    }

    async fn position(&self, partition: u32) -> Result<u64, BusError> {
        let state = self.shared.lock();
        if !self.current_assignment(&state).contains(&partition) {
            return Err(BusError::PartitionNotAssigned {
                topic: self.topic.clone(),
                partition,
            });
        }
        Ok(self.positions.get(&partition).copied().unwrap_or_else(|| {
            Self::start_offset(&state, &self.topic, &self.group, partition)
        }))
    }

    async fn committed(&self, partition: u32) -> Result<Option<u64>, BusError> {
        self.shared.check_reachable()?;
        let state = self.shared.lock();
        Ok(state
            .group(&self.topic, &self.group)
            .and_then(|g| g.committed.get(&partition).copied()))
    }

    async fn commit(&mut self) -> Result<(), BusError> {
        self.shared.check_reachable()?;
        let mut state = self.shared.lock();
        let assigned = self.current_assignment(&state);
        let group = state.group_mut(&self.topic, &self.group);
        for (partition, position) in &self.positions {
            if assigned.contains(partition) {
                group.committed.insert(*partition, *position);
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.shared.lock();
        state
            .group_mut(&self.topic, &self.group)
            .members
            .remove(&self.member_id);
        tracing::debug!(topic = %self.topic, group = %self.group, member_id = self.member_id, "Consumer left group");
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Producer session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryProducer {
    shared: Arc<Shared>,
    topic: String,
}

impl ProducerSession for MemoryProducer {
    async fn deliver(&mut self, records: &[OutgoingRecord]) -> DeliveryReport {
        if let Err(e) = self.shared.check_reachable() {
            return DeliveryReport::uniform(records.len(), Err(e));
        }
        let mut outcomes = Vec::with_capacity(records.len());
        {
            let mut state = self.shared.lock();
            let Some(log) = state.topics.get_mut(&self.topic) else {
                return DeliveryReport::uniform(
                    records.len(),
                    Err(BusError::UnknownTopic(self.topic.clone())),
                );
            };
            let count = log.partitions.len();
            for record in records {
                let partition = match record.partition {
                    Some(p) => p as usize,
                    None => {
                        let p = log.next_spread % count;
                        log.next_spread = log.next_spread.wrapping_add(1);
                        p
                    }
                };
                let Some(target) = log.partitions.get_mut(partition) else {
                    outcomes.push(Err(BusError::Transport(format!(
                        "partition {partition} does not exist in topic '{}'",
                        self.topic
                    ))));
                    continue;
                };
                target.push(StoredRecord {
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                });
                outcomes.push(Ok(()));
            }
        }
        self.shared.appended.notify_waiters();
        DeliveryReport::new(outcomes)
    }

    fn release(&mut self) {}
}

/// Offset probe on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryProbe {
    shared: Arc<Shared>,
    topic: String,
    group: String,
}

impl OffsetProbe for MemoryProbe {
    async fn offsets(&self, partitions: u32) -> Result<Vec<PartitionOffsets>, BusError> {
        self.shared.check_reachable()?;
        let state = self.shared.lock();
        let log = state.topic(&self.topic)?;
        let group = state.group(&self.topic, &self.group);
        (0..partitions)
            .map(|partition| -> Result<PartitionOffsets, BusError> {
                let high_watermark = log
                    .partitions
                    .get(partition as usize)
                    .map(|p| p.len() as u64)
                    .ok_or_else(|| {
                        BusError::LagFetchFailure(format!(
                            "partition {partition} missing from topic '{}'",
                            self.topic
                        ))
                    })?;
                Ok(PartitionOffsets {
                    partition,
                    high_watermark,
                    committed: group.and_then(|g| g.committed.get(&partition).copied()),
                })
            })
            .collect()
    }
}
