//! CLI entry point for the campus sensor simulator.

use anyhow::{Context, Result};
use campus_sensor_simulator::{
    config::Config,
    inject::{InjectStats, TelemetryInjector},
    BrokerConnector, HttpRegistry, MqttConnector, Orchestrator, OrchestratorSettings, SensorKind,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "campus-sim.yml";

#[derive(Parser)]
#[command(name = "campus-sensor-simulator")]
#[command(about = "Registry-driven MQTT sensor simulator for campus IoT deployments")]
#[command(version)]
struct Cli {
    /// Configuration file (default: campus-sim.yml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write the default configuration to the --config path (default
    /// campus-sim.yml) and exit
    #[arg(long)]
    generate_config: bool,

    /// Device registry URL (overrides config)
    #[arg(long, global = true)]
    registry_url: Option<String>,

    /// MQTT broker host (overrides config)
    #[arg(long, global = true)]
    broker_host: Option<String>,

    /// MQTT broker port (overrides config)
    #[arg(long, global = true)]
    broker_port: Option<u16>,

    /// Registry poll interval in seconds (overrides config)
    #[arg(long, global = true)]
    poll_interval: Option<u64>,

    /// Log level (overrides config; RUST_LOG wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep simulators in sync with the device registry (default)
    Run,

    /// Check broker connectivity by publishing a test message
    Probe {
        /// Topic for the test message
        #[arg(long, default_value = "test/connection")]
        topic: String,
    },

    /// Post generated readings straight to the telemetry API, either as a
    /// backfill ending now or as a live stream until Ctrl+C
    Inject {
        /// Device id to attribute readings to
        #[arg(short, long)]
        device: String,

        /// Sensor kind (temperature, occupancy, light, humidity, energy)
        #[arg(short, long)]
        sensor: String,

        /// Number of readings
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,

        /// Spacing between readings in seconds, ending now
        #[arg(long, default_value = "300")]
        step_secs: u64,

        /// Keep posting one current reading per period until interrupted
        #[arg(long)]
        follow: bool,

        /// Follow period in seconds (overrides config)
        #[arg(long, requires = "follow")]
        every: Option<u64>,

        /// Telemetry endpoint (overrides config)
        #[arg(long)]
        url: Option<String>,
    },
}

/// Path `--generate-config` writes to.
fn generated_config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                Config::from_file(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?
            } else {
                Config::default()
            }
        }
    };

    // Apply command line overrides
    if let Some(url) = &cli.registry_url {
        config.registry.url = url.clone();
    }
    if let Some(host) = &cli.broker_host {
        config.broker.host = host.clone();
    }
    if let Some(port) = cli.broker_port {
        config.broker.port = port;
    }
    if let Some(secs) = cli.poll_interval {
        config.orchestrator.poll_interval_secs = secs;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)
            .with_context(|| format!("Invalid log level '{}'", config.logging.level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(config.logging.show_target))
        .with(filter)
        .init();
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, shutting down gracefully..."),
        _ = terminate => info!("SIGTERM received, shutting down gracefully..."),
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting campus sensor simulator v{}", env!("CARGO_PKG_VERSION"));
    info!("Registry: {}", config.registry.url);
    info!("Broker: {}:{}", config.broker.host, config.broker.port);

    let registry = HttpRegistry::new(config.registry.url.clone(), config.registry.timeout())
        .context("Failed to create registry client")?;
    let connector = MqttConnector::new(config.broker.clone());
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        Arc::new(connector),
        OrchestratorSettings::from_config(&config),
    );

    let shutdown = orchestrator.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    orchestrator.run().await;
    info!("Shutdown complete");
    Ok(())
}

async fn probe(config: Config, topic: String) -> Result<()> {
    let client_id = format!("{}probe", config.broker.client_id_prefix);
    info!(
        "Connecting to {}:{} as {}",
        config.broker.host, config.broker.port, client_id
    );

    let connector = MqttConnector::new(config.broker.clone());
    let mut session = connector.connect(&client_id).await.with_context(|| {
        format!(
            "Cannot connect to broker at {}:{}",
            config.broker.host, config.broker.port
        )
    })?;
    info!("Connected to broker");

    let payload = serde_json::to_vec(&serde_json::json!({ "test": "message" }))?;
    let published = session.publish(&topic, payload).await;
    session.disconnect().await;
    published.with_context(|| format!("Test publish to {} failed", topic))?;

    info!("Broker acknowledged test message on {}", topic);
    Ok(())
}

struct InjectArgs {
    device: String,
    sensor: String,
    count: usize,
    step_secs: u64,
    follow: bool,
    every: Option<u64>,
    url: Option<String>,
}

async fn inject(mut config: Config, args: InjectArgs) -> Result<()> {
    let kind: SensorKind = args.sensor.parse()?;
    if let Some(url) = args.url {
        config.inject.telemetry_url = url;
    }
    let every = match args.every {
        Some(0) => anyhow::bail!("--every must be at least 1 second"),
        Some(secs) => Duration::from_secs(secs),
        None => config.inject.follow_interval(),
    };

    let stats = Arc::new(InjectStats::new());
    let injector = TelemetryInjector::new(config.inject, stats)
        .context("Failed to create telemetry client")?;
    let mut rng = StdRng::from_entropy();

    if args.follow {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            stop.cancel();
        });

        let posted = injector
            .follow(&args.device, kind, every, &mut rng, cancel)
            .await;
        info!("Posted {} live readings", posted);
        return Ok(());
    }

    let posted = injector
        .backfill(
            &args.device,
            kind,
            args.count,
            Duration::from_secs(args.step_secs),
            Utc::now(),
            &mut rng,
        )
        .await?;

    if posted < args.count as u64 {
        anyhow::bail!("Only {} of {} readings were injected", posted, args.count);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Generate config and exit if requested
    if cli.generate_config {
        let path = generated_config_path(&cli);
        Config::write_default(&path)?;
        println!("Generated default configuration: {}", path.display());
        return Ok(());
    }

    let config = load_config(&cli)?;
    init_logging(&config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Probe { topic } => probe(config, topic).await,
        Commands::Inject {
            device,
            sensor,
            count,
            step_secs,
            follow,
            every,
            url,
        } => {
            let args = InjectArgs {
                device,
                sensor,
                count,
                step_secs,
                follow,
                every,
                url,
            };
            inject(config, args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_config_honours_config_path() {
        let cli = Cli::parse_from([
            "campus-sensor-simulator",
            "--generate-config",
            "--config",
            "/tmp/lab.yml",
        ]);
        assert_eq!(generated_config_path(&cli), PathBuf::from("/tmp/lab.yml"));

        let cli = Cli::parse_from(["campus-sensor-simulator", "--generate-config"]);
        assert_eq!(generated_config_path(&cli), PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_inject_follow_flags() {
        let cli = Cli::parse_from([
            "campus-sensor-simulator",
            "inject",
            "--device",
            "lab-01",
            "--sensor",
            "temperature",
            "--follow",
            "--every",
            "15",
        ]);
        match cli.command {
            Some(Commands::Inject { follow, every, .. }) => {
                assert!(follow);
                assert_eq!(every, Some(15));
            }
            _ => panic!("expected inject"),
        }

        // --every only makes sense with --follow.
        assert!(Cli::try_parse_from([
            "campus-sensor-simulator",
            "inject",
            "-d",
            "lab-01",
            "-s",
            "light",
            "--every",
            "15",
        ])
        .is_err());
    }
}
