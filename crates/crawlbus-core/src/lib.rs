pub mod admission;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod partitioner;
pub mod producer;
pub mod retry;
pub mod streams;
pub mod traits;

pub use admission::{AdmissionController, LagSnapshot};
pub use bus::MessageBus;
pub use config::{BusSettings, Compression, Security, TransportConfig};
pub use consumer::StreamConsumer;
pub use error::{BusError, Result};
pub use memory::MemoryBroker;
pub use message::{Assignment, DeliveryReport, Message, OutgoingRecord, PartitionOffsets};
pub use partitioner::{FingerprintPartitioner, HostnamePartitioner, Partitioner, Partitioning};
pub use producer::{KeyedProducer, SimpleProducer};
pub use retry::RetryPolicy;
pub use streams::{
    ScoringLogStream, SingleReaderStream, SpiderFeedStream, SpiderLogReader, SpiderLogStream,
    StatsLogStream,
};
pub use traits::{ConsumerSession, OffsetProbe, ProducerSession, Transport};
