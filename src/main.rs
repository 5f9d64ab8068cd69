use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tally::config::{LoggingConfig, TallyConfig};
use tally::mesh::Cluster;
use tally::provider::{ClusterCounterProvider, ProviderRegistry, CLUSTER_PROVIDER_KEY};
use tally::replay::{replay, ReplayScript};

#[derive(Debug, Parser)]
#[command(name = "tally", version, about = "Time-windowed counter and quota engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a node until interrupted
    Serve {
        /// Configuration file (YAML, JSON or TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a scripted sequence of counter operations and print the outcomes
    Replay {
        /// Replay script (YAML)
        script: PathBuf,

        /// Configuration file (YAML, JSON or TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => serve(config.as_deref()).await,
        Command::Replay { script, config } => run_replay(&script, config.as_deref()).await,
    }
}

async fn serve(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = TallyConfig::load(config_path)?;
    init_tracing(&config.logging);

    info!("Starting Tally");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let registry = build_registry(&config).await?;
    info!(providers = ?registry.keys(), "Counter providers ready");

    shutdown_signal().await;

    registry.shutdown().await;
    info!("Tally stopped");
    Ok(())
}

async fn run_replay(script_path: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = TallyConfig::load(config_path)?;
    init_tracing(&config.logging);

    let script = ReplayScript::from_file(script_path)?.with_defaults(&config.provider);

    let registry = build_registry(&config).await?;
    let result = replay(&registry, &script);
    registry.shutdown().await;

    for outcome in result? {
        println!("{}", outcome.to_json()?);
    }
    Ok(())
}

/// Local provider always, cluster provider when enabled.
async fn build_registry(config: &TallyConfig) -> anyhow::Result<ProviderRegistry> {
    let registry = ProviderRegistry::with_local();

    if config.cluster.enabled {
        let cluster = Cluster::start(config.cluster.to_cluster_config()).await?;
        info!(node_id = %cluster.node_id(), "Cluster mesh started");
        let settings = config.cluster.sync_settings();
        registry.register(CLUSTER_PROVIDER_KEY, move || {
            ClusterCounterProvider::start(cluster, settings)
        });
    }

    Ok(registry)
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
