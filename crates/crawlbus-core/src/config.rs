//! Transport and bus configuration.
//!
//! All settings are resolved once, validated, and then treated as
//! read-only by every stream built from them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::BusError;
use crate::partitioner::Partitioning;
use crate::retry::RetryPolicy;

pub const DEFAULT_BATCH_SIZE: usize = 1024 * 1024;
pub const DEFAULT_BUFFER_MEMORY: usize = 130 * 1024 * 1024;
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 4 * 1024 * 1024;

/// Transport security. Exactly one mode is active at a time.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    None,
    /// Mutual TLS with a CA bundle, client certificate and client key.
    Tls {
        ca_file: PathBuf,
        cert_file: PathBuf,
        key_file: PathBuf,
    },
    /// Username/password negotiated over an encrypted channel.
    Sasl { username: String, password: String },
}

impl Security {
    /// TLS material laid out as `ca-cert.pem`, `client-cert.pem` and
    /// `client-key.pem` inside `cert_path`.
    pub fn tls_from_dir(cert_path: impl AsRef<Path>) -> Self {
        let dir = cert_path.as_ref();
        Security::Tls {
            ca_file: dir.join("ca-cert.pem"),
            cert_file: dir.join("client-cert.pem"),
            key_file: dir.join("client-key.pem"),
        }
    }

    pub fn validate(&self) -> Result<(), BusError> {
        match self {
            Security::None => Ok(()),
            Security::Tls {
                ca_file,
                cert_file,
                key_file,
            } => {
                for file in [ca_file, cert_file, key_file] {
                    if !file.is_file() {
                        return Err(BusError::Config(format!(
                            "TLS file '{}' does not exist",
                            file.display()
                        )));
                    }
                }
                Ok(())
            }
            Security::Sasl { username, password } => {
                if username.is_empty() || password.is_empty() {
                    return Err(BusError::Config(
                        "SASL requires a non-empty username and password".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Security::None => f.write_str("None"),
            Security::Tls {
                ca_file,
                cert_file,
                key_file,
            } => f
                .debug_struct("Tls")
                .field("ca_file", ca_file)
                .field("cert_file", cert_file)
                .field("key_file", key_file)
                .finish(),
            Security::Sasl { username, .. } => f
                .debug_struct("Sasl")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

/// Payload compression applied by the transport.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(format!("Unknown compression codec: {s}")),
        }
    }
}

/// Connection target, security and producer buffering limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// `host:port` endpoints.
    pub endpoints: Vec<String>,
    pub security: Security,
    /// Largest single message accepted by `send`.
    pub max_request_size: usize,
    /// Buffered bytes that trigger an automatic delivery.
    pub batch_size: usize,
    /// Upper bound on bytes buffered by one producer.
    pub buffer_memory: usize,
    /// Deadline for a flush to be acknowledged.
    pub max_block: Duration,
    pub compression: Compression,
    /// Delivery retries on transient transport errors.
    pub retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:9092".to_string()],
            security: Security::None,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            buffer_memory: DEFAULT_BUFFER_MEMORY,
            max_block: Duration::from_secs(60),
            compression: Compression::None,
            retries: 5,
        }
    }
}

impl TransportConfig {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn with_max_block(mut self, max_block: Duration) -> Self {
        self.max_block = max_block;
        self
    }

    pub fn with_buffer_limits(mut self, batch_size: usize, buffer_memory: usize) -> Self {
        self.batch_size = batch_size;
        self.buffer_memory = buffer_memory;
        self
    }

    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Comma-joined endpoint list.
    pub fn bootstrap_servers(&self) -> String {
        self.endpoints.join(",")
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.endpoints.is_empty() || self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(BusError::Config(
                "at least one non-empty endpoint is required".into(),
            ));
        }
        if self.max_request_size == 0 || self.batch_size == 0 || self.buffer_memory == 0 {
            return Err(BusError::Config(
                "max_request_size, batch_size and buffer_memory must be positive".into(),
            ));
        }
        if self.batch_size > self.buffer_memory {
            return Err(BusError::Config(format!(
                "batch_size ({}) cannot exceed buffer_memory ({})",
                self.batch_size, self.buffer_memory
            )));
        }
        if self.max_block.is_zero() {
            return Err(BusError::Config("max_block must be positive".into()));
        }
        self.security.validate()
    }
}

/// Topic names, group names, partition counts and transport settings for
/// every logical stream of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    pub spider_feed_topic: String,
    pub spider_log_topic: String,
    pub scoring_log_topic: String,
    pub stats_log_topic: String,

    pub spider_log_dbw_group: String,
    pub spider_log_sw_group: String,
    pub scoring_log_dbw_group: String,
    pub spider_feed_group: String,
    pub stats_log_reader_group: String,

    pub spider_log_partitions: u32,
    pub spider_feed_partitions: u32,
    /// Checked against the live topic only when set.
    pub scoring_log_partitions: Option<u32>,
    pub stats_log_partitions: Option<u32>,

    /// Admission threshold: maximum outstanding work items per feed partition.
    pub max_next_requests: u64,
    pub partitioning: Partitioning,
    pub lag_refresh_interval: Duration,
    pub connect_retry: RetryPolicy,
    pub transport: TransportConfig,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            spider_feed_topic: "frontier-todo".to_string(),
            spider_log_topic: "frontier-done".to_string(),
            scoring_log_topic: "frontier-score".to_string(),
            stats_log_topic: "frontier-stats".to_string(),
            spider_log_dbw_group: "dbw-spider-log".to_string(),
            spider_log_sw_group: "sw-spider-log".to_string(),
            scoring_log_dbw_group: "dbw-scoring-log".to_string(),
            spider_feed_group: "fetchers-spider-feed".to_string(),
            stats_log_reader_group: "stats-reader-log".to_string(),
            spider_log_partitions: 1,
            spider_feed_partitions: 1,
            scoring_log_partitions: None,
            stats_log_partitions: None,
            max_next_requests: 64,
            partitioning: Partitioning::Fingerprint,
            lag_refresh_interval: Duration::from_secs(5),
            connect_retry: RetryPolicy::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl BusSettings {
    /// Read settings from environment variables, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self, BusError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let text = |key: &str, default: String| get(key).unwrap_or(default);

        let mut transport = TransportConfig::default();
        if let Some(raw) = get("KAFKA_LOCATION") {
            transport.endpoints = raw
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect();
        }
        if let Some(raw) = get("KAFKA_CODEC") {
            transport.compression = raw.parse().map_err(BusError::Config)?;
        }
        if let Some(ms) = parse_number::<u64>(&get, "KAFKA_MAX_BLOCK_MS")? {
            transport.max_block = Duration::from_millis(ms);
        }

        let enable_ssl = parse_flag(&get, "KAFKA_ENABLE_SSL")?;
        let enable_sasl = parse_flag(&get, "KAFKA_ENABLE_SASL")?;
        transport.security = match (enable_ssl, enable_sasl) {
            (true, true) => {
                return Err(BusError::Config(
                    "KAFKA_ENABLE_SSL and KAFKA_ENABLE_SASL are mutually exclusive".into(),
                ));
            }
            (true, false) => {
                let cert_path = get("KAFKA_CERT_PATH").ok_or_else(|| {
                    BusError::Config("KAFKA_CERT_PATH not set. Required when KAFKA_ENABLE_SSL is on.".into())
                })?;
                Security::tls_from_dir(cert_path)
            }
            (false, true) => Security::Sasl {
                username: get("KAFKA_SASL_USERNAME").unwrap_or_default(),
                password: get("KAFKA_SASL_PASSWORD").unwrap_or_default(),
            },
            (false, false) => Security::None,
        };

        let partitioning = if parse_flag(&get, "QUEUE_HOSTNAME_PARTITIONING")? {
            Partitioning::Hostname
        } else {
            Partitioning::Fingerprint
        };

        let settings = Self {
            spider_feed_topic: text("SPIDER_FEED_TOPIC", defaults.spider_feed_topic),
            spider_log_topic: text("SPIDER_LOG_TOPIC", defaults.spider_log_topic),
            scoring_log_topic: text("SCORING_LOG_TOPIC", defaults.scoring_log_topic),
            stats_log_topic: text("STATS_LOG_TOPIC", defaults.stats_log_topic),
            spider_log_dbw_group: text("SPIDER_LOG_DBW_GROUP", defaults.spider_log_dbw_group),
            spider_log_sw_group: text("SPIDER_LOG_SW_GROUP", defaults.spider_log_sw_group),
            scoring_log_dbw_group: text("SCORING_LOG_DBW_GROUP", defaults.scoring_log_dbw_group),
            spider_feed_group: text("SPIDER_FEED_GROUP", defaults.spider_feed_group),
            stats_log_reader_group: text(
                "STATS_LOG_READER_GROUP",
                defaults.stats_log_reader_group,
            ),
            spider_log_partitions: parse_number(&get, "SPIDER_LOG_PARTITIONS")?
                .unwrap_or(defaults.spider_log_partitions),
            spider_feed_partitions: parse_number(&get, "SPIDER_FEED_PARTITIONS")?
                .unwrap_or(defaults.spider_feed_partitions),
            scoring_log_partitions: parse_number(&get, "SCORING_LOG_PARTITIONS")?,
            stats_log_partitions: parse_number(&get, "STATS_LOG_PARTITIONS")?,
            max_next_requests: parse_number(&get, "MAX_NEXT_REQUESTS")?
                .unwrap_or(defaults.max_next_requests),
            partitioning,
            lag_refresh_interval: parse_number::<u64>(&get, "LAG_REFRESH_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.lag_refresh_interval),
            connect_retry: defaults.connect_retry,
            transport,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), BusError> {
        let names = [
            ("SPIDER_FEED_TOPIC", &self.spider_feed_topic),
            ("SPIDER_LOG_TOPIC", &self.spider_log_topic),
            ("SCORING_LOG_TOPIC", &self.scoring_log_topic),
            ("STATS_LOG_TOPIC", &self.stats_log_topic),
            ("SPIDER_LOG_DBW_GROUP", &self.spider_log_dbw_group),
            ("SPIDER_LOG_SW_GROUP", &self.spider_log_sw_group),
            ("SCORING_LOG_DBW_GROUP", &self.scoring_log_dbw_group),
            ("SPIDER_FEED_GROUP", &self.spider_feed_group),
            ("STATS_LOG_READER_GROUP", &self.stats_log_reader_group),
        ];
        if let Some((key, _)) = names.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(BusError::Config(format!("{key} must not be empty")));
        }
        if self.spider_log_dbw_group == self.spider_log_sw_group {
            return Err(BusError::Config(
                "SPIDER_LOG_DBW_GROUP and SPIDER_LOG_SW_GROUP must differ".into(),
            ));
        }
        let counts = [
            ("SPIDER_LOG_PARTITIONS", Some(self.spider_log_partitions)),
            ("SPIDER_FEED_PARTITIONS", Some(self.spider_feed_partitions)),
            ("SCORING_LOG_PARTITIONS", self.scoring_log_partitions),
            ("STATS_LOG_PARTITIONS", self.stats_log_partitions),
        ];
        if let Some((key, _)) = counts.iter().find(|(_, v)| *v == Some(0)) {
            return Err(BusError::Config(format!("{key} must be at least 1")));
        }
        if self.max_next_requests == 0 {
            return Err(BusError::Config("MAX_NEXT_REQUESTS must be at least 1".into()));
        }
        if self.lag_refresh_interval.is_zero() {
            return Err(BusError::Config(
                "LAG_REFRESH_INTERVAL_MS must be at least 1".into(),
            ));
        }
        self.transport.validate()
    }
}

fn parse_flag<F>(get: &F, key: &str) -> Result<bool, BusError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(false),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(BusError::Config(format!(
                "Invalid {key} '{raw}': expected true or false"
            ))),
        },
    }
}

fn parse_number<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, BusError>
where
    T: FromStr,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            BusError::Config(format!(
                "Invalid {key} '{raw}': must be a non-negative integer"
            ))
        }),
    }
}
