use std::time::Duration;

use crate::error::BusError;
use crate::message::Message;
use crate::traits::ConsumerSession;

/// Group member reading batches from one topic.
///
/// Nothing is committed while pulling; the read position is checkpointed
/// only by [`StreamConsumer::close`], so a crash between pull and close
/// redelivers the last batch.
#[derive(Debug)]
pub struct StreamConsumer<C: ConsumerSession> {
    session: C,
    topic: String,
    group: String,
    closed: bool,
}

impl<C: ConsumerSession> StreamConsumer<C> {
    pub(crate) fn new(session: C, topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            session,
            topic: topic.into(),
            group: group.into(),
            closed: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Partitions currently owned by this consumer.
    pub fn assignment(&self) -> Vec<u32> {
        if self.closed {
            return Vec::new();
        }
        self.session.assignment()
    }

    /// Pull between 0 and `max` messages, waiting at most `timeout`.
    pub async fn pull(&mut self, max: usize, timeout: Duration) -> Result<Vec<Message>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        let batch = self.session.poll(max, timeout).await?;
        tracing::trace!(topic = %self.topic, group = %self.group, count = batch.len(), "Pulled batch");
        Ok(batch)
    }

    /// The group's committed offset for `partition`, or 0 if the group has
    /// never committed there.
    pub async fn committed_offset(&self, partition: u32) -> Result<u64, BusError> {
        self.ensure_assigned(partition)?;
        Ok(self.session.committed(partition).await?.unwrap_or(0))
    }

    /// Offset of the next message this consumer will read from `partition`.
    /// Before the first pull this is where the group resumes.
    pub async fn position(&self, partition: u32) -> Result<u64, BusError> {
        self.ensure_assigned(partition)?;
        self.session.position(partition).await
    }

    /// Commit the read position of every assigned partition, then leave the
    /// group. Calling it again is a no-op.
    ///
    /// A failed commit is returned after the session has been released;
    /// the previously committed offsets remain a safe resume point.
    pub async fn close(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let commit = self.session.commit().await;
        self.session.release();

        match commit {
            Ok(()) => {
                tracing::debug!(topic = %self.topic, group = %self.group, "Consumer closed");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    topic = %self.topic,
                    group = %self.group,
                    error = %e,
                    "Commit on close failed, resuming from previous checkpoint"
                );
                Err(e)
            }
        }
    }

    fn ensure_assigned(&self, partition: u32) -> Result<(), BusError> {
        if self.closed || !self.session.assignment().contains(&partition) {
            return Err(self.not_assigned(partition));
        }
        Ok(())
    }

    fn not_assigned(&self, partition: u32) -> BusError {
        BusError::PartitionNotAssigned {
            topic: self.topic.clone(),
            partition,
        }
    }
}

impl<C: ConsumerSession> Drop for StreamConsumer<C> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(
                topic = %self.topic,
                group = %self.group,
                "Consumer dropped without close, read position not committed"
            );
            self.session.release();
        }
    }
}
