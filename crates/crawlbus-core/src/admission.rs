//! Lag-based admission control for the spider feed.
//!
//! A background task periodically reads, for every feed partition, the gap
//! between the latest written offset and the feed group's committed offset.
//! Each refresh publishes a complete new [`LagSnapshot`]; readers load the
//! current one without waiting on the refresh.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::BusError;
use crate::message::PartitionOffsets;
use crate::traits::OffsetProbe;

/// Outstanding messages per partition at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LagSnapshot {
    lags: BTreeMap<u32, u64>,
    refreshed_at: Option<Instant>,
}

impl LagSnapshot {
    /// Snapshot that reports no partition available.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_offsets(offsets: &[PartitionOffsets]) -> Self {
        Self {
            lags: offsets.iter().map(|o| (o.partition, o.lag())).collect(),
            refreshed_at: Some(Instant::now()),
        }
    }

    pub fn lag(&self, partition: u32) -> Option<u64> {
        self.lags.get(&partition).copied()
    }

    /// Partitions whose lag is strictly below `threshold`, ascending.
    pub fn below(&self, threshold: u64) -> Vec<u32> {
        self.lags
            .iter()
            .filter(|(_, lag)| **lag < threshold)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.lags.iter().map(|(p, l)| (*p, *l))
    }

    pub fn is_empty(&self) -> bool {
        self.lags.is_empty()
    }

    /// When the data was read; `None` until the first successful refresh.
    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }
}

/// Supervised refresh loop plus the snapshot it maintains.
///
/// Answers are advisory: a partition reported open may fill up before the
/// caller uses it. Dropping the controller stops the loop.
#[derive(Debug)]
pub struct AdmissionController {
    snapshot: Arc<ArcSwap<LagSnapshot>>,
    threshold: u64,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl AdmissionController {
    /// Perform one refresh, then keep refreshing every `interval` in the
    /// background. A failed first refresh leaves the snapshot empty.
    pub async fn start<P: OffsetProbe>(
        probe: P,
        topic: impl Into<String>,
        group: impl Into<String>,
        partitions: u32,
        threshold: u64,
        interval: Duration,
    ) -> Self {
        let refresher = Refresher {
            probe,
            topic: topic.into(),
            group: group.into(),
            partitions,
            snapshot: Arc::new(ArcSwap::from_pointee(LagSnapshot::empty())),
        };
        refresher.refresh().await;

        let snapshot = refresher.snapshot.clone();
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(refresher.run(interval, cancel_token.clone()));

        Self {
            snapshot,
            threshold,
            cancel_token,
            handle: Some(handle),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Partitions whose lag is below the configured threshold.
    pub fn available_partitions(&self) -> Vec<u32> {
        self.snapshot.load().below(self.threshold)
    }

    pub fn available_partitions_below(&self, threshold: u64) -> Vec<u32> {
        self.snapshot.load().below(threshold)
    }

    pub fn is_available(&self, partition: u32) -> bool {
        self.snapshot
            .load()
            .lag(partition)
            .is_some_and(|lag| lag < self.threshold)
    }

    pub fn lag(&self, partition: u32) -> Option<u64> {
        self.snapshot.load().lag(partition)
    }

    pub fn snapshot(&self) -> Arc<LagSnapshot> {
        self.snapshot.load_full()
    }

    /// Stop the refresh loop and wait for it to finish.
    pub async fn stop(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Lag refresh task ended abnormally");
        }
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct Refresher<P> {
    probe: P,
    topic: String,
    group: String,
    partitions: u32,
    snapshot: Arc<ArcSwap<LagSnapshot>>,
}

impl<P: OffsetProbe> Refresher<P> {
    async fn run(self, interval: Duration, cancel_token: CancellationToken) {
        tracing::debug!(topic = %self.topic, group = %self.group, ?interval, "Lag refresh started");
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => self.refresh().await,
                () = cancel_token.cancelled() => break,
            }
        }
        tracing::debug!(topic = %self.topic, group = %self.group, "Lag refresh stopped");
    }

    /// Replace the snapshot, or keep the previous one if the fetch fails.
    async fn refresh(&self) {
        match self.probe.offsets(self.partitions).await {
            Ok(offsets) => {
                let next = LagSnapshot::from_offsets(&offsets);
                tracing::debug!(
                    topic = %self.topic,
                    group = %self.group,
                    lag = ?next.lags,
                    "Lag snapshot refreshed"
                );
                self.snapshot.store(Arc::new(next));
            }
            Err(e) => {
                let e = match e {
                    BusError::LagFetchFailure(_) => e,
                    other => BusError::LagFetchFailure(other.to_string()),
                };
                tracing::warn!(
                    topic = %self.topic,
                    group = %self.group,
                    error = %e,
                    "Keeping previous lag snapshot"
                );
            }
        }
    }
}
