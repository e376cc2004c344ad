//! librdkafka property mapping.

use std::time::Duration;

use crawlbus_core::{Security, TransportConfig};
use rdkafka::ClientConfig;

/// Largest fetch per partition for consumers.
pub const MAX_PARTITION_FETCH_BYTES: usize = 10 * 1024 * 1024;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Endpoints and security, shared by every client.
pub fn base_config(config: &TransportConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", config.bootstrap_servers());
    client.set("socket.timeout.ms", millis(REQUEST_TIMEOUT));

    match &config.security {
        Security::None => {}
        Security::Tls {
            ca_file,
            cert_file,
            key_file,
        } => {
            client
                .set("security.protocol", "ssl")
                .set("ssl.ca.location", ca_file.display().to_string())
                .set("ssl.certificate.location", cert_file.display().to_string())
                .set("ssl.key.location", key_file.display().to_string());
        }
        Security::Sasl { username, password } => {
            client
                .set("security.protocol", "sasl_ssl")
                .set("sasl.mechanism", "SCRAM-SHA-512")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
    }
    client
}

/// Group member that commits only on request and starts from the earliest
/// offset when the group has no checkpoint.
pub fn consumer_config(config: &TransportConfig, group: &str, client_id: &str) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("group.id", group)
        .set("client.id", client_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", "earliest")
        .set("max.partition.fetch.bytes", MAX_PARTITION_FETCH_BYTES.to_string())
        .set("heartbeat.interval.ms", millis(HEARTBEAT_INTERVAL));
    client
}

pub fn producer_config(config: &TransportConfig) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("message.max.bytes", config.max_request_size.to_string())
        .set("batch.size", config.batch_size.to_string())
        .set(
            "queue.buffering.max.kbytes",
            (config.buffer_memory / 1024).max(1).to_string(),
        )
        .set("message.timeout.ms", millis(config.max_block))
        .set("retries", config.retries.to_string())
        .set("compression.codec", config.compression.as_str());
    // Internal retries must not duplicate or reorder records of one partition.
    if config.retries > 0 {
        client.set("enable.idempotence", "true");
    }
    client
}

/// Client for metadata and offset queries of `group`.
pub fn probe_config(config: &TransportConfig, group: &str) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("group.id", group)
        .set("enable.auto.commit", "false");
    client
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}
