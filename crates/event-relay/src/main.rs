//! Event relay binary entry point.
//!
//! Usage:
//!   event-relay run
//!   event-relay publish --kind team_created --data '{"team_id":1,"team_name":"Team1"}'
//!
//! Settings come from the environment (see `RelayConfig::from_env`);
//! command-line flags override them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use event_relay::{EventEnvelope, Publisher, RedisConnector, Relay, RelayConfig, RelayStats};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Durable domain-event relay.
#[derive(Parser, Debug)]
#[command(name = "event-relay")]
#[command(about = "Relays domain events from a durable broker queue to a GraphQL gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Broker host
    #[arg(long, global = true)]
    broker_host: Option<String>,

    /// Broker port
    #[arg(long, global = true)]
    broker_port: Option<u16>,

    /// Durable queue name
    #[arg(long, global = true)]
    queue: Option<String>,

    /// Gateway endpoint URL
    #[arg(long, global = true)]
    gateway_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit JSON lines instead of human-readable logs
    #[arg(long, env = "RELAY_JSON_LOGS", global = true)]
    json_logs: bool,

    /// Also write JSON logs to this file
    #[arg(long, env = "RELAY_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume the queue and forward events until interrupted
    Run,

    /// Publish one event and exit once it is written
    Publish {
        /// Event kind, e.g. team_created
        #[arg(long)]
        kind: String,

        /// Event data as a JSON object
        #[arg(long)]
        data: String,
    },
}

impl Cli {
    fn log_config(&self) -> observability::LogConfig {
        observability::LogConfig {
            service_name: "event-relay".into(),
            default_level: self.log_level.clone(),
            json: self.json_logs,
            log_path: self.log_file.clone(),
            also_stderr: self.log_file.is_some(),
        }
    }

    fn config(&self) -> Result<RelayConfig> {
        let mut config = RelayConfig::from_env().context("invalid relay configuration")?;

        if let Some(host) = &self.broker_host {
            config.broker.host = host.clone();
        }
        if let Some(port) = self.broker_port {
            config.broker.port = port;
        }
        if let Some(queue) = &self.queue {
            if queue.is_empty() {
                bail!("--queue must not be empty");
            }
            config.broker.queue_name = queue.clone();
        }
        if let Some(url) = &self.gateway_url {
            config.gateway.url = url.clone();
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    observability::init_with_config(cli.log_config())?;

    let config = cli.config()?;

    info!(
        broker = %config.broker.url(),
        queue = %config.broker.queue_name,
        consumer = %config.broker.consumer_name,
        gateway = %config.gateway.url,
        ack_policy = ?config.ack_policy,
        "Configuration loaded"
    );

    match cli.command {
        Command::Run => run(config).await,
        Command::Publish { kind, data } => publish(config, kind, &data).await,
    }
}

async fn run(config: RelayConfig) -> Result<()> {
    let relay = Relay::connect(config)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    relay.shutdown().await?;
    Ok(())
}

async fn publish(config: RelayConfig, kind: String, data: &str) -> Result<()> {
    let payload = match serde_json::from_str::<Value>(data).context("--data is not valid JSON")? {
        Value::Object(map) => map,
        _ => bail!("--data must be a JSON object"),
    };

    // Publishing alone must not start a consumer on the queue.
    let connector = Arc::new(RedisConnector::new(config.broker.clone())?);
    let stats = Arc::new(RelayStats::default());
    let publisher = Publisher::start(
        connector,
        config.broker.queue_name.clone(),
        config.publisher,
        stats.clone(),
    );

    publisher.handle().publish(EventEnvelope::new(kind, payload))?;
    publisher.shutdown().await?;

    if stats.snapshot().published == 0 {
        bail!("event was not written to the broker before the shutdown grace period elapsed");
    }

    info!("Event published");
    Ok(())
}
