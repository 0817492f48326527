//! Steward - fleet control plane

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use steward_core::{BindMode, StewardConfig};
use steward_gateway::{serve, StewardService};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG: &str = "steward.toml";

#[derive(Parser)]
#[command(name = "steward", about = "Steward - fleet control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP control plane
    Serve {
        /// Config file (default: $STEWARD_CONFIG or ./steward.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        port: Option<u16>,
        /// loopback or lan
        #[arg(short, long)]
        bind: Option<String>,
        /// Log as JSON lines
        #[arg(long)]
        json_logs: bool,
    },
    /// Print the effective configuration as TOML
    DumpConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Show version
    Version,
}

fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var("STEWARD_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn init_tracing(filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            config,
            port,
            bind,
            json_logs,
        }) => {
            let path = config_path(config);
            let mut config = StewardConfig::load(&path);
            init_tracing(&config.logging.filter, json_logs);

            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = match bind.as_str() {
                    "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
                    _ => BindMode::Lan,
                };
            }
            info!("Config: {}", path.display());

            let service = Arc::new(StewardService::new(config)?);
            serve(service).await?;
        }

        Some(Commands::DumpConfig { config }) => {
            let config = StewardConfig::load(&config_path(config));
            print!("{}", config.to_toml());
        }

        Some(Commands::Version) | None => {
            println!("steward v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
