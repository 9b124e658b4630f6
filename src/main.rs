//! pubsub-mqtt command line entry point

use chrono::Utc;
use clap::{Parser, Subcommand};
use pubsub_mqtt::config::ClientConfig;
use pubsub_mqtt::health::Health;
use pubsub_mqtt::observability::{init_default_logging, init_logging, HealthServer, LogFormat};
use pubsub_mqtt::PubSubClient;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

const DISCONNECT_WAIT: Duration = Duration::from_secs(1);

/// Subscribe, query and publish over MQTT
#[derive(Parser)]
#[command(name = "pubsub-mqtt")]
#[command(about = "Topic subscription and bounded query client for MQTT brokers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "PUBSUB_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every message on a topic until interrupted
    Listen {
        #[arg(short, long)]
        topic: String,
        /// Serve /health, /metrics and /live on this port
        #[arg(long)]
        health_port: Option<u16>,
    },
    /// Collect a bounded batch of messages from a topic
    Query {
        #[arg(short, long)]
        topic: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Publish one payload
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        payload: String,
    },
    /// Report broker health as JSON
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => {
            init_default_logging();
        }
        1 => {
            init_logging(Level::DEBUG, LogFormat::Pretty, false);
        }
        _ => {
            init_logging(Level::TRACE, LogFormat::Pretty, true);
        }
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen { topic, health_port } => listen(config, &topic, health_port).await,
        Commands::Query {
            topic,
            timeout_ms,
            limit,
        } => query(config, &topic, timeout_ms, limit).await,
        Commands::Publish { topic, payload } => publish(config, &topic, payload).await,
        Commands::Health => health(config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for candidate in ["pubsub.toml", "config/pubsub.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using the public default broker");
    let mut config = ClientConfig::default();
    config.prepare()?;
    Ok(config)
}

async fn listen(
    config: ClientConfig,
    topic: &str,
    health_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(PubSubClient::connect_mqtt(config).await?);
    let shutdown = CancellationToken::new();

    if let Some(port) = health_port {
        let server = HealthServer::new(client.clone(), port);
        tokio::spawn(server.serve(shutdown.clone()));
    }

    let receiver = {
        let client = client.clone();
        let topic = topic.to_string();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            loop {
                match client.subscribe(&cancel, &topic).await {
                    Ok(Some(envelope)) => {
                        println!(
                            "{} [{}] {}",
                            Utc::now().to_rfc3339(),
                            envelope.topic(),
                            envelope.payload_str()
                        );
                        envelope.commit();
                    }
                    Ok(None) => break,
                    Err(e) if cancel.is_cancelled() => {
                        info!("Listener stopping: {}", e);
                        break;
                    }
                    Err(e) => {
                        error!("Subscribe failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    };

    info!(topic = %topic, "Listening, press Ctrl+C to stop");
    signal::ctrl_c().await?;
    info!("Received interrupt, shutting down");

    shutdown.cancel();
    let _ = receiver.await;
    client.disconnect(DISCONNECT_WAIT).await?;
    Ok(())
}

async fn query(
    config: ClientConfig,
    topic: &str,
    timeout_ms: Option<u64>,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = PubSubClient::connect_mqtt(config).await?;

    let mut options = client.default_query_options();
    if let Some(timeout_ms) = timeout_ms {
        options = options.with_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(limit) = limit {
        options = options.with_limit(limit);
    }

    let collected = client.query(&CancellationToken::new(), topic, options).await;
    client.disconnect(DISCONNECT_WAIT).await?;

    println!("{}", String::from_utf8_lossy(&collected?));
    Ok(())
}

async fn publish(
    config: ClientConfig,
    topic: &str,
    payload: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = PubSubClient::connect_mqtt(config).await?;
    let published = client.publish(topic, payload).await;
    client.disconnect(DISCONNECT_WAIT).await?;
    published?;
    info!(topic = %topic, "Published");
    Ok(())
}

/// Never fails: a client that cannot be built reports DOWN with the reason
async fn health(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let host = config
        .broker
        .endpoint()
        .map(|endpoint| endpoint.host)
        .unwrap_or_default();

    let report = match PubSubClient::connect_mqtt(config).await {
        Ok(client) => {
            let report = client.health().await;
            let _ = client.disconnect(DISCONNECT_WAIT).await;
            report
        }
        Err(e) => Health::down(host).with_detail("error", e.to_string()),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
