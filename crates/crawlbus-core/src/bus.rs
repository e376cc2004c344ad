use crate::config::BusSettings;
use crate::error::BusError;
use crate::streams::{
    FeedParams, ScoringLogStream, SpiderFeedStream, SpiderLogStream, StatsLogStream,
    StreamContext, single_reader_stream, spider_feed_stream, spider_log_stream,
};
use crate::traits::Transport;

/// Configuration root of the pipeline's streams.
///
/// Settings are validated once in [`MessageBus::new`] and never change
/// afterwards; every accessor returns a fresh façade bound to them.
#[derive(Debug, Clone)]
pub struct MessageBus<T: Transport> {
    settings: BusSettings,
    ctx: StreamContext<T>,
}

impl<T: Transport> MessageBus<T> {
    pub fn new(transport: T, settings: BusSettings) -> Result<Self, BusError> {
        settings.validate()?;
        tracing::debug!(
            spider_feed = %settings.spider_feed_topic,
            spider_log = %settings.spider_log_topic,
            scoring_log = %settings.scoring_log_topic,
            stats_log = %settings.stats_log_topic,
            partitioning = %settings.partitioning,
            "Message bus configured"
        );
        let ctx = StreamContext {
            transport,
            retry: settings.connect_retry.clone(),
            transport_config: settings.transport.clone(),
        };
        Ok(Self { settings, ctx })
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.ctx.transport
    }

    pub fn spider_log(&self) -> SpiderLogStream<T> {
        let s = &self.settings;
        spider_log_stream(
            &self.ctx,
            &s.spider_log_topic,
            s.spider_log_partitions,
            &s.spider_log_dbw_group,
            &s.spider_log_sw_group,
        )
    }

    pub fn spider_feed(&self) -> SpiderFeedStream<T> {
        let s = &self.settings;
        spider_feed_stream(
            &self.ctx,
            FeedParams {
                topic: &s.spider_feed_topic,
                partitions: s.spider_feed_partitions,
                group: &s.spider_feed_group,
                partitioning: s.partitioning,
                max_next_requests: s.max_next_requests,
                lag_refresh_interval: s.lag_refresh_interval,
            },
        )
    }

    pub fn scoring_log(&self) -> ScoringLogStream<T> {
        let s = &self.settings;
        single_reader_stream(
            &self.ctx,
            &s.scoring_log_topic,
            &s.scoring_log_dbw_group,
            s.scoring_log_partitions,
        )
    }

    pub fn stats_log(&self) -> StatsLogStream<T> {
        let s = &self.settings;
        single_reader_stream(
            &self.ctx,
            &s.stats_log_topic,
            &s.stats_log_reader_group,
            s.stats_log_partitions,
        )
    }
}
