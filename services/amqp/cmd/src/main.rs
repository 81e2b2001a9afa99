//! AMQP 0-9-1 probe binary.
//!
//! Connects to a broker, declares a queue, optionally publishes test
//! messages and then consumes for a while, printing each message as JSON.

use amqp_session::{Client, REPLY_SUCCESS};
use amqp_wire::{BasicConsume, BasicProperties, BasicPublish, QueueDeclare};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ProbeConfig;
use logging::AmqpLogFormatter;

/// AMQP 0-9-1 broker probe
#[derive(Parser, Debug)]
#[command(
    name = "redb-amqp",
    version,
    about = "Declare, publish to and consume from an AMQP 0-9-1 broker"
)]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Broker address, e.g. 127.0.0.1:5672 (overrides config)
    #[arg(long)]
    broker: Option<String>,

    /// Virtual host (overrides config)
    #[arg(long)]
    vhost: Option<String>,

    /// Queue to declare and consume from
    #[arg(long, default_value = "redb-amqp-probe")]
    queue: String,

    /// Number of test messages to publish before consuming
    #[arg(long, default_value = "0")]
    publish: u32,

    /// Use publisher confirms for published messages
    #[arg(long)]
    confirm: bool,

    /// Stop after this many messages
    #[arg(long, default_value = "1")]
    count: u32,

    /// Give up consuming after this long, e.g. 10s
    #[arg(long, default_value = "10s")]
    wait: humantime::Duration,

    /// Prefetch window for the consumer
    #[arg(long, default_value = "10")]
    prefetch: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("redb_amqp={}", args.log_level).parse()?)
        .add_directive(format!("amqp_session={}", args.log_level).parse()?)
        .add_directive(format!("amqp_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .event_format(AmqpLogFormatter::new("amqp"))
        .init();

    info!("Starting reDB AMQP probe v{}", env!("CARGO_PKG_VERSION"));

    let mut probe = ProbeConfig::load_from_file(&args.config)?;
    if let Some(vhost) = &args.vhost {
        probe.vhost = vhost.clone();
    }
    let broker = args.broker.clone().unwrap_or_else(|| probe.broker_addr());

    let client = Client::connect(broker.as_str(), probe.connection_config())
        .await
        .with_context(|| format!("failed to connect to {}", broker))?;
    let tuning = client.tuning();
    info!(
        "Connected to {} (channel_max={}, frame_max={}, heartbeat={}s)",
        broker, tuning.channel_max, tuning.frame_max, tuning.heartbeat
    );

    let channel = client.channel(None).await.context("failed to open channel")?;
    let queue = channel
        .queue_declare(QueueDeclare::new(args.queue.as_str()))
        .await
        .with_context(|| format!("failed to declare queue '{}'", args.queue))?;
    info!(
        component = "probe",
        "Queue '{}' has {} messages and {} consumers",
        queue.queue,
        queue.message_count,
        queue.consumer_count
    );

    if args.publish > 0 {
        if args.confirm {
            channel.confirm_select().await.context("failed to enable confirms")?;
        }
        for i in 0..args.publish {
            let publish = BasicPublish {
                routing_key: queue.queue.clone(),
                ..Default::default()
            };
            let properties = BasicProperties {
                content_type: Some("text/plain".to_string()),
                timestamp: Some(chrono::Utc::now().timestamp() as u64),
                ..Default::default()
            };
            let body = format!("probe message {}", i + 1);
            channel
                .basic_publish(publish, properties, body.as_bytes())
                .await
                .context("failed to publish")?;
        }
        info!(component = "probe", "Published {} messages", args.publish);
    }

    channel
        .basic_qos(0, args.prefetch, false)
        .await
        .context("failed to set prefetch")?;
    let mut consumer = channel
        .basic_consume(BasicConsume::new(queue.queue.as_str()))
        .await
        .context("failed to start consumer")?;

    let deadline = tokio::time::Instant::now() + Duration::from(args.wait);
    let mut received = 0;
    while received < args.count {
        let message = match tokio::time::timeout_at(deadline, consumer.next()).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                warn!("Consumer '{}' was cancelled", consumer.tag());
                break;
            }
            Err(_) => {
                warn!("No message within {}", args.wait);
                break;
            }
        };
        println!("{}", serde_json::to_string(&message)?);
        channel.basic_ack(message.delivery_tag, false).await?;
        received += 1;
    }

    if args.confirm {
        if let Some(unconfirmed) = channel.unconfirmed_count().await {
            info!(
                component = "probe",
                "{} publishes still unconfirmed",
                unconfirmed
            );
        }
    }

    channel.basic_cancel(consumer.tag()).await?;
    channel.close(REPLY_SUCCESS, "probe finished").await?;
    client.close(REPLY_SUCCESS, "probe finished").await?;
    info!("Received {} messages, connection closed", received);
    Ok(())
}
