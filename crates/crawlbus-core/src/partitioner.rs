//! Key-consistent partition selection.
//!
//! A routing key always maps to the same partition index for a fixed
//! partition count, in every process. Both partitioners are pure and
//! stateless, so a single value can be shared by any number of producers.

use std::fmt;
use std::str::FromStr;

use url::Url;

/// Maps a routing key onto a partition index in `[0, partitions)`.
pub trait Partitioner: Send + Sync {
    fn partition(&self, key: &[u8], partitions: u32) -> u32;
}

/// Routes by URL fingerprint.
///
/// Fingerprints are hex digests; four bytes sampled from fixed positions
/// of the digest are read as a little-endian `u32`. Keys that are not hex
/// fingerprints are hashed with CRC32 instead, so any key routes
/// deterministically.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintPartitioner;

impl FingerprintPartitioner {
    const SAMPLES: [usize; 4] = [0, 5, 10, 15];

    fn sampled_value(key: &[u8]) -> Option<u32> {
        if key.len() < 17 {
            return None;
        }
        let mut digest = [0u8; 4];
        for (byte, &at) in digest.iter_mut().zip(Self::SAMPLES.iter()) {
            let hi = hex_value(key[at])?;
            let lo = hex_value(key[at + 1])?;
            *byte = (hi << 4) | lo;
        }
        Some(u32::from_le_bytes(digest))
    }
}

impl Partitioner for FingerprintPartitioner {
    fn partition(&self, key: &[u8], partitions: u32) -> u32 {
        let value = Self::sampled_value(key).unwrap_or_else(|| crc32fast::hash(key));
        value.checked_rem(partitions).unwrap_or(0)
    }
}

/// Routes by host name so every URL of one host lands in one partition.
///
/// Keys may be absolute URLs, URLs without a scheme, or bare host names,
/// with or without a port. Only the lowercased host is hashed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostnamePartitioner;

impl HostnamePartitioner {
    fn host_of(key: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(key);
        let text = text.trim();
        let parsed = if text.contains("://") {
            Url::parse(text)
        } else {
            Url::parse(&format!("http://{text}"))
        };
        if let Ok(url) = parsed
            && let Some(host) = url.host_str()
        {
            return host.to_ascii_lowercase().into_bytes();
        }
        bare_host(text).into_bytes()
    }
}

/// Host part of a key `Url` could not parse: scheme, path and port removed.
fn bare_host(text: &str) -> String {
    let rest = text.split_once("://").map_or(text, |(_, rest)| rest);
    let authority = rest.split(&['/', '?', '#'][..]).next().unwrap_or(rest);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    };
    host.to_ascii_lowercase()
}

impl Partitioner for HostnamePartitioner {
    fn partition(&self, key: &[u8], partitions: u32) -> u32 {
        let host = Self::host_of(key);
        crc32fast::hash(&host).checked_rem(partitions).unwrap_or(0)
    }
}

/// Partitioning policy selected by configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Partitioning {
    #[default]
    Fingerprint,
    Hostname,
}

impl Partitioning {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partitioning::Fingerprint => "fingerprint",
            Partitioning::Hostname => "hostname",
        }
    }
}

impl Partitioner for Partitioning {
    fn partition(&self, key: &[u8], partitions: u32) -> u32 {
        match self {
            Partitioning::Fingerprint => FingerprintPartitioner.partition(key, partitions),
            Partitioning::Hostname => HostnamePartitioner.partition(key, partitions),
        }
    }
}

impl fmt::Display for Partitioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Partitioning {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fingerprint" => Ok(Partitioning::Fingerprint),
            "hostname" | "host" => Ok(Partitioning::Hostname),
            _ => Err(format!("Unknown partitioning: {s}")),
        }
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
