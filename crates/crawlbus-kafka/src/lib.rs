pub mod client;
pub mod consumer;
mod error;
pub mod probe;
pub mod producer;
pub mod transport;

pub use consumer::KafkaConsumer;
pub use probe::KafkaOffsetProbe;
pub use producer::KafkaProducer;
pub use transport::KafkaTransport;
