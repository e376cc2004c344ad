use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use crawlbus_core::{BusSettings, Message, MessageBus, SpiderLogReader};
use crawlbus_kafka::KafkaTransport;

#[derive(Parser)]
#[command(name = "crawlbus", version, about = "Partitioned message bus for crawl pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify that every topic exists with the configured partition count
    Check,

    /// Publish stdin lines to a stream, one message per line
    Produce {
        #[arg(value_enum)]
        stream: StreamName,

        /// Routing key for every line (keyed streams default to the line itself)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Pull one batch from a stream, print it and commit
    Consume {
        #[arg(value_enum)]
        stream: StreamName,

        /// Own this partition instead of joining the group dynamically
        #[arg(short, long)]
        partition: Option<u32>,

        /// Spider log reader role
        #[arg(short, long, value_enum, default_value_t = Reader::DbWriter)]
        reader: Reader,

        /// Maximum messages to pull
        #[arg(short, long, default_value_t = 100)]
        max: usize,

        /// How long to wait for the first message, in milliseconds
        #[arg(short, long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Print the spider feed lag per partition and the partitions open for work
    Lag {
        /// Override MAX_NEXT_REQUESTS for this report
        #[arg(short, long)]
        threshold: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StreamName {
    SpiderFeed,
    SpiderLog,
    ScoringLog,
    StatsLog,
}

#[derive(Clone, Copy, ValueEnum)]
enum Reader {
    DbWriter,
    StrategyWorker,
}

impl From<Reader> for SpiderLogReader {
    fn from(reader: Reader) -> Self {
        match reader {
            Reader::DbWriter => SpiderLogReader::DbWriter,
            Reader::StrategyWorker => SpiderLogReader::StrategyWorker,
        }
    }
}

type Bus = MessageBus<KafkaTransport>;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("crawlbus=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let bus = connect_bus()?;

    match cli.command {
        Commands::Check => cmd_check(&bus).await?,
        Commands::Produce { stream, key } => cmd_produce(&bus, stream, key).await?,
        Commands::Consume {
            stream,
            partition,
            reader,
            max,
            timeout_ms,
        } => {
            cmd_consume(
                &bus,
                stream,
                partition,
                reader.into(),
                max,
                Duration::from_millis(timeout_ms),
            )
            .await?;
        }
        Commands::Lag { threshold } => cmd_lag(&bus, threshold).await?,
    }

    Ok(())
}

/// Build the bus from environment settings.
fn connect_bus() -> Result<Bus> {
    let settings = BusSettings::from_env().context("Invalid bus settings")?;
    let transport = KafkaTransport::new(settings.transport.clone())
        .context("Failed to create Kafka transport")?;
    MessageBus::new(transport, settings).context("Invalid bus settings")
}

async fn cmd_check(bus: &Bus) -> Result<()> {
    let checks = [
        (bus.spider_feed().topic().to_string(), bus.spider_feed().partition_count().await),
        (bus.spider_log().topic().to_string(), bus.spider_log().partition_count().await),
        (bus.scoring_log().topic().to_string(), bus.scoring_log().partition_count().await),
        (bus.stats_log().topic().to_string(), bus.stats_log().partition_count().await),
    ];

    let mut failed = 0;
    for (topic, result) in checks {
        match result {
            Ok(count) => println!("ok      {topic} ({count} partitions)"),
            Err(e) => {
                failed += 1;
                println!("FAILED  {topic}: {e}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} stream(s) failed the check");
    }
    Ok(())
}

async fn cmd_produce(bus: &Bus, stream: StreamName, key: Option<String>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0usize;

    match stream {
        StreamName::SpiderFeed | StreamName::SpiderLog => {
            let mut producer = match stream {
                StreamName::SpiderFeed => bus.spider_feed().producer().await?,
                _ => bus.spider_log().producer().await?,
            };
            while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
                if line.is_empty() {
                    continue;
                }
                let routing = key.clone().unwrap_or_else(|| line.clone());
                producer.send(routing, [line]).await?;
                sent += 1;
            }
            producer.close().await?;
        }
        StreamName::ScoringLog | StreamName::StatsLog => {
            if key.is_some() {
                bail!("--key is only supported for the spider feed and spider log");
            }
            let mut producer = match stream {
                StreamName::ScoringLog => bus.scoring_log().producer().await?,
                _ => bus.stats_log().producer().await?,
            };
            while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
                if line.is_empty() {
                    continue;
                }
                producer.send([line]).await?;
                sent += 1;
            }
            producer.close().await?;
        }
    }

    tracing::info!(sent, "Messages delivered");
    Ok(())
}

async fn cmd_consume(
    bus: &Bus,
    stream: StreamName,
    partition: Option<u32>,
    reader: SpiderLogReader,
    max: usize,
    timeout: Duration,
) -> Result<()> {
    let mut consumer = match stream {
        StreamName::SpiderFeed => bus.spider_feed().consumer(partition).await?,
        StreamName::SpiderLog => bus.spider_log().consumer(reader, partition).await?,
        StreamName::ScoringLog | StreamName::StatsLog => {
            if partition.is_some() {
                bail!("--partition is not supported for single-reader streams");
            }
            match stream {
                StreamName::ScoringLog => bus.scoring_log().consumer().await?,
                _ => bus.stats_log().consumer().await?,
            }
        }
    };

    let batch = consumer.pull(max, timeout).await;
    // Close before inspecting the pull result so the session is always released.
    let closed = consumer.close().await;
    let batch = batch?;

    for message in &batch {
        println!("{}", format_message(message));
    }
    tracing::info!(count = batch.len(), "Batch consumed");

    if let Err(e) = closed {
        tracing::warn!(error = %e, "Commit failed; the batch will be redelivered");
    }
    Ok(())
}

async fn cmd_lag(bus: &Bus, threshold: Option<u64>) -> Result<()> {
    let feed = bus.spider_feed();
    let mut admission = feed.admission().await?;
    let snapshot = admission.snapshot();
    let threshold = threshold.unwrap_or(feed.max_next_requests());

    if snapshot.is_empty() {
        admission.stop().await;
        bail!("Could not read offsets for {}", feed.topic());
    }

    println!("{} / {} (threshold {threshold})", feed.topic(), feed.group());
    for (partition, lag) in snapshot.iter() {
        let state = if lag < threshold { "open" } else { "full" };
        println!("  partition {partition:>3}  lag {lag:>8}  {state}");
    }
    println!(
        "available: {:?}",
        admission.available_partitions_below(threshold)
    );

    admission.stop().await;
    Ok(())
}

fn format_message(message: &Message) -> String {
    let key = message
        .key
        .as_ref()
        .map(lossy)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}\t{}\t{}\t{}",
        message.partition,
        message.offset,
        key,
        lossy(&message.payload)
    )
}

fn lossy(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
