//! flightdeck - A management plane for remote recording agents

use anyhow::Result;
use clap::{Parser, Subcommand};
use flightdeck::agent::memory::MemoryConnector;
use flightdeck::agent::{ServiceRef, TargetId};
use flightdeck::config::Config;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "flightdeck")]
#[command(about = "A management plane for remote recording agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP and WebSocket planes
    Serve {
        /// Listen address override
        #[arg(short, long)]
        listen: Option<String>,

        /// Archive directory override
        #[arg(long)]
        recordings_dir: Option<PathBuf>,

        /// Serve in-process demo targets instead of real agents
        #[arg(long)]
        demo: bool,

        /// Demo target ids, as `id` or `id=alias`
        #[arg(long = "demo-target", default_value = "localhost:9091")]
        demo_targets: Vec<String>,
    },
    /// Load the configuration, apply environment overrides and print it
    CheckConfig,
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;

    match cli.command {
        Commands::Serve {
            listen,
            recordings_dir,
            demo,
            demo_targets,
        } => {
            if let Some(listen) = listen {
                config.general.listen = listen;
            }
            if let Some(dir) = recordings_dir {
                config.general.recordings_dir = Some(dir);
            }
            if !demo {
                anyhow::bail!(
                    "no agent connector is configured; run with --demo to serve in-process targets"
                );
            }

            let connector = Arc::new(MemoryConnector::new());
            let mut services = Vec::new();
            for entry in &demo_targets {
                let (id, alias) = match entry.split_once('=') {
                    Some((id, alias)) => (id, Some(alias.to_string())),
                    None => (entry.as_str(), None),
                };
                let target = connector.add_target(TargetId::from(id));
                tracing::info!("Serving demo target {}", target.id());
                services.push(ServiceRef::new(target.id(), alias));
            }
            let targets = config.target_provider(services)?;

            flightdeck::web::serve(config, connector, targets, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for ctrl-c: {}", e);
                }
            })
            .await
        }
        Commands::CheckConfig => {
            config.auth_manager()?;
            config.target_provider(Vec::new())?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
