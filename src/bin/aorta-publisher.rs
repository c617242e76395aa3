//! Delivers the local spool to a RabbitMQ broker.

use std::{path::PathBuf, time::Duration};

use aorta::{
    FileSpool, HeartbeatMonitor, Publisher, PublisherConfig, SpoolIntake, queue::RetryOrdering,
    spool::RetentionSweeper, transport::rabbitmq::RabbitMqConnector,
};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Publish to the messaging infrastructure from the local spool.
#[derive(Parser)]
#[command(name = "aorta-publisher", version)]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(long, env = "AORTA_CONFIG")]
    config: Option<PathBuf>,

    /// Broker address, e.g. amqp://127.0.0.1:5672/%2f
    #[arg(long, env = "AORTA_BROKER")]
    broker: Option<String>,

    /// Spool directory
    #[arg(long, env = "AORTA_SPOOL")]
    spool: Option<PathBuf>,

    /// Exchange to publish to; empty selects the default exchange
    #[arg(long, env = "AORTA_EXCHANGE", default_value = "")]
    exchange: String,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, env = "AORTA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "AORTA_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    #[arg(long, env = "AORTA_BACKOFF_BASE_MS")]
    backoff_base_ms: Option<u64>,

    #[arg(long, env = "AORTA_BACKOFF_CAP_MS")]
    backoff_cap_ms: Option<u64>,

    #[arg(long, env = "AORTA_ACK_TIMEOUT_MS")]
    ack_timeout_ms: Option<u64>,

    #[arg(long, env = "AORTA_DRAIN_WORKERS")]
    drain_workers: Option<usize>,

    #[arg(long, env = "AORTA_RETRY_ORDERING", value_enum)]
    retry_ordering: Option<Ordering>,

    /// How often to pick up records other processes wrote into the spool
    #[arg(long, env = "AORTA_INTAKE_INTERVAL_MS")]
    intake_interval_ms: Option<u64>,

    #[arg(long, env = "AORTA_HEARTBEAT_INTERVAL_MS")]
    heartbeat_interval_ms: Option<u64>,

    #[arg(long, env = "AORTA_HEARTBEAT_DESTINATION")]
    heartbeat_destination: Option<String>,

    /// Time given to in-flight deliveries on shutdown
    #[arg(long, env = "AORTA_GRACE_PERIOD_MS", default_value_t = 5_000)]
    grace_period_ms: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Ordering {
    Requeue,
    HoldDestination,
}

impl From<Ordering> for RetryOrdering {
    fn from(value: Ordering) -> Self {
        match value {
            Ordering::Requeue => RetryOrdering::Requeue,
            Ordering::HoldDestination => RetryOrdering::HoldDestination,
        }
    }
}

impl Cli {
    fn publisher_config(&self) -> Result<PublisherConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
            None => PublisherConfig::default(),
        };

        if let Some(broker) = &self.broker {
            config = config.with_broker_address(broker.clone());
        }
        if let Some(spool) = &self.spool {
            config = config.with_spool_path(spool.clone());
        }
        if let Some(max_attempts) = self.max_attempts {
            config = config.with_max_attempts(max_attempts);
        }
        if let Some(base) = self.backoff_base_ms {
            config.backoff_base = Duration::from_millis(base);
        }
        if let Some(cap) = self.backoff_cap_ms {
            config.backoff_cap = Duration::from_millis(cap);
        }
        if let Some(timeout) = self.ack_timeout_ms {
            config = config.with_ack_timeout(Duration::from_millis(timeout));
        }
        if let Some(workers) = self.drain_workers {
            config = config.with_drain_workers(workers);
        }
        if let Some(ordering) = self.retry_ordering {
            config = config.with_retry_ordering(ordering.into());
        }
        if let Some(interval) = self.intake_interval_ms {
            config = config.with_intake_interval(Duration::from_millis(interval));
        }
        if let Some(interval) = self.heartbeat_interval_ms {
            config.heartbeat.interval = Duration::from_millis(interval);
        }
        if let Some(destination) = &self.heartbeat_destination {
            config.heartbeat.destination = destination.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .with(ErrorLayer::default())
        .init();

    let config = cli.publisher_config()?;
    let spool = FileSpool::open(&config.spool_path).await?;
    tracing::info!(
        spool = %config.spool_path.display(),
        broker = %config.broker_address,
        exchange = %cli.exchange,
        "Starting aorta publisher"
    );

    let publisher = Publisher::start(
        spool.clone(),
        RabbitMqConnector::new(cli.exchange.clone()),
        config.clone(),
    )
    .await?;

    let cancel = CancellationToken::new();
    let heartbeat = HeartbeatMonitor::from_config(&config.heartbeat);
    tracing::info!(destination = heartbeat.destination(), "Heartbeats enabled");
    let heartbeat_handle = heartbeat.start(publisher.clone(), cancel.clone());
    let intake_handle =
        SpoolIntake::new(config.intake_interval).start(publisher.clone(), cancel.clone());
    let sweeper_handle = RetentionSweeper::new(
        config.retention_policy(),
        config.retention.sweep_interval,
    )
    .start(spool, cancel.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");

    cancel.cancel();
    let report = publisher
        .shutdown(Duration::from_millis(cli.grace_period_ms))
        .await;
    let _ = tokio::join!(heartbeat_handle, intake_handle, sweeper_handle);

    if report.aborted_workers > 0 {
        tracing::warn!(
            aborted = report.aborted_workers,
            "Some deliveries were interrupted; they will be retried on next start"
        );
    }
    Ok(())
}
