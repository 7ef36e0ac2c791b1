//! mqkafka - MQTT to Kafka bridge
//!
//! Usage:
//!   mqkafka [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>          Configuration file path
//!   --mqtt-broker <ADDR>         Source broker address [env: MQTT_BROKER]
//!   --client-id <ID>             MQTT client ID [env: CLIENT_ID]
//!   --mqtt-user <USER>           MQTT username [env: MQTT_USER]
//!   --mqtt-password <PASS>       MQTT password [env: MQTT_PASSWORD]
//!   --kafka-broker <LIST>        Kafka bootstrap servers [env: KAFKA_BROKER]
//!   --kafka-topic <TOPIC>        Destination topic [env: KAFKA_TOPIC]
//!   -l, --log-level              Log level (error, warn, info, debug, trace)
//!   -h, --help                   Print help

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mqkafka::config::Config;
use mqkafka::{Bridge, Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// mqkafka - forward MQTT device telemetry and presence to Kafka
#[derive(Parser, Debug)]
#[command(name = "mqkafka")]
#[command(version)]
#[command(about = "Forward MQTT device telemetry and presence events to Kafka")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source MQTT broker address
    #[arg(long, env = "MQTT_BROKER")]
    mqtt_broker: Option<String>,

    /// MQTT client ID
    #[arg(long, env = "CLIENT_ID")]
    client_id: Option<String>,

    /// MQTT username
    #[arg(long, env = "MQTT_USER")]
    mqtt_user: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// Kafka bootstrap servers
    #[arg(long, env = "KAFKA_BROKER")]
    kafka_broker: Option<String>,

    /// Destination Kafka topic
    #[arg(long, env = "KAFKA_TOPIC")]
    kafka_topic: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI args override file and environment config
    fn apply(&self, config: &mut Config) {
        if let Some(address) = &self.mqtt_broker {
            config.mqtt.address = address.clone();
        }
        if let Some(client_id) = &self.client_id {
            config.mqtt.client_id = client_id.clone();
        }
        if let Some(username) = &self.mqtt_user {
            config.mqtt.username = Some(username.clone());
        }
        if let Some(password) = &self.mqtt_password {
            config.mqtt.password = Some(password.clone());
        }
        if let Some(brokers) = &self.kafka_broker {
            config.kafka.brokers = brokers.clone();
        }
        if let Some(topic) = &self.kafka_topic {
            config.kafka.topic = topic.clone();
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Validated below, once the CLI overrides are in
    let mut config = match &args.config {
        Some(path) => Config::read(path),
        None => Config::read(Path::new("")),
    }
    .unwrap_or_else(|e| {
        eprintln!("Error loading configuration: {}", e);
        std::process::exit(1);
    });
    args.apply(&mut config);

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("Starting mqkafka");
    info!("  MQTT broker: {}", config.mqtt.address);
    info!("  MQTT client ID: {}", config.mqtt.client_id);
    info!("  Kafka brokers: {}", config.kafka.brokers);
    info!("  Kafka topic: {}", config.kafka.topic);
    info!("  Payload encoding: {:?}", config.bridge.payload_encoding);
    info!("  Presence payload: {:?}", config.bridge.presence_payload);

    let metrics = Arc::new(Metrics::new());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        let server = MetricsServer::new(metrics.clone(), config.metrics.bind);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown_rx).await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    let bridge = match Bridge::start(config, metrics).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Failed to start bridge: {}", e);
            std::process::exit(1);
        }
    };

    shutdown_signal().await;

    bridge.shutdown().await;
    let _ = shutdown_tx.send(());

    Ok(())
}
