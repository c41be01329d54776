//! Knowledge coordinator - main entry point

use knowledge_coordinator::config::CoordinatorConfig;
use knowledge_coordinator::health::{
    AgentPoolHealthCheck, ChannelHealthCheck, ControlLoopHealthCheck, HealthCheckManager,
};
use knowledge_coordinator::observability::logging::{init_logging, LogFormat};
use knowledge_coordinator::observability::{init_default_logging, HealthServer, MetricsCollector};
use knowledge_coordinator::orchestrator::Orchestrator;
use knowledge_coordinator::protocol::Capability;
use knowledge_coordinator::transport::{InMemoryChannel, MessageChannel, MqttChannel};
use knowledge_coordinator::worker::{ExecutorRegistry, WorkerPool};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn, Level};

/// Knowledge pipeline coordinator
#[derive(Parser)]
#[command(name = "coordinator")]
#[command(about = "Task and agent coordinator for the knowledge pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator
    Run {
        /// Use the in-process channel with embedded echo workers
        #[arg(long)]
        local: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format(), false),
        _ => init_logging(Level::TRACE, log_format(), true),
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting knowledge coordinator"
    );

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { local } => run_coordinator(config, local).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn log_format() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<CoordinatorConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(CoordinatorConfig::load_from_file(path)?);
    }

    let default_paths = ["coordinator.toml", "config/coordinator.toml"];
    for path_str in default_paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(CoordinatorConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create coordinator.toml".into())
}

async fn run_coordinator(
    config: CoordinatorConfig,
    local: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = Arc::new(MetricsCollector::new());
    let embedded = local || config.workers.embedded;

    let channel: Arc<dyn MessageChannel> = if local {
        info!("Using in-process message channel");
        Arc::new(InMemoryChannel::new(config.workers.redelivery_delay()))
    } else {
        info!(broker_url = %config.mqtt.broker_url, "Using MQTT message channel");
        Arc::new(MqttChannel::new(
            config.mqtt.clone(),
            config.workers.redelivery_delay(),
        )?)
    };

    // Pools subscribe before the orchestrator starts so they see every agent.started
    let pools = if embedded {
        start_worker_pools(channel.clone(), &config).await?
    } else {
        Vec::new()
    };

    let orchestrator = Arc::new(Orchestrator::new(
        channel.clone(),
        config.clone(),
        metrics.clone(),
    )?);

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.health.port);

    let mut checks = HealthCheckManager::new();
    checks.add_health_check(Box::new(ChannelHealthCheck::new(channel.clone())));
    checks.add_health_check(Box::new(ControlLoopHealthCheck::new(
        metrics.clone(),
        config.coordinator.tick_interval() * 3 + Duration::from_secs(1),
    )));
    checks.add_health_check(Box::new(AgentPoolHealthCheck::new(orchestrator.registry())));

    let health_server = Arc::new(HealthServer::new(
        orchestrator.clone(),
        Arc::new(checks),
        health_port,
    ));
    tokio::spawn(health_server.start());

    orchestrator.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(embedded_workers = embedded, "Coordinator is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    let shutdown = orchestrator
        .shutdown(config.coordinator.shutdown_timeout())
        .await;
    for pool in &pools {
        pool.shutdown().await;
    }
    shutdown?;

    let snapshot = metrics.get_metrics();
    info!(
        submitted = snapshot.tasks.submitted,
        completed = snapshot.tasks.completed,
        failed = snapshot.tasks.failed,
        "Final task counters"
    );
    Ok(())
}

/// One echo worker pool per capability that has agents configured
async fn start_worker_pools(
    channel: Arc<dyn MessageChannel>,
    config: &CoordinatorConfig,
) -> Result<Vec<WorkerPool>, Box<dyn std::error::Error>> {
    let mut pools = Vec::new();
    for capability in Capability::ALL {
        if config.agents.pool_size(capability) == 0 {
            continue;
        }
        let pool = WorkerPool::new(
            ExecutorRegistry::echo(capability),
            channel.clone(),
            &config.workers,
        )?;
        pool.start().await?;
        pools.push(pool);
    }

    if pools.is_empty() {
        warn!("Embedded workers requested but no agent pools are configured");
    }
    Ok(pools)
}

fn handle_config_command(
    config: CoordinatorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    config.require_mqtt_password()?;
    info!("Configuration validation complete");
    Ok(())
}
