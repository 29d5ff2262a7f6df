//! univrs-jsonkv server
//!
//! Serves one JSON document over HTTP. Settings come from an optional TOML
//! file; command-line flags override it.
//!
//! ```text
//! univrs-jsonkv --file root_tree.json
//! univrs-jsonkv --sqlite root_tree.db --bind 0.0.0.0:8000
//! univrs-jsonkv --config jsonkv.toml
//! univrs-jsonkv --print-config > jsonkv.toml
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use univrs_jsonkv::{server, BackendConfig, ServerConfig};

#[derive(Parser)]
#[command(name = "univrs-jsonkv")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hierarchical JSON key-value store over HTTP")]
struct Cli {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Store the document in this JSON file
    #[arg(long, conflicts_with = "sqlite")]
    file: Option<PathBuf>,

    /// Store the document as snapshots in this SQLite database
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Lock wait bound in milliseconds (overrides config)
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    /// Print the default config file and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(cli: &Cli) -> univrs_jsonkv::Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    if let Some(bind) = &cli.bind {
        config.bind = bind.clone();
    }
    if let Some(ms) = cli.lock_timeout_ms {
        config.lock_timeout_ms = ms;
    }
    if let Some(path) = &cli.file {
        config.backend = BackendConfig::File { path: path.clone() };
    }
    if let Some(path) = &cli.sqlite {
        let lease_ms = match config.backend {
            BackendConfig::Sqlite { lease_ms, .. } => lease_ms,
            BackendConfig::File { .. } => univrs_jsonkv::sqlite::DEFAULT_LEASE.as_millis() as u64,
        };
        config.backend = BackendConfig::Sqlite {
            path: path.clone(),
            lease_ms,
        };
    }
    Ok(config)
}

async fn run(config: ServerConfig) -> univrs_jsonkv::Result<()> {
    info!("Starting with {:?}", config.backend);
    let store = config.open_store().await?;
    let listener = TcpListener::bind(config.bind.as_str()).await?;

    server::serve(listener, store, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    })
    .await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", ServerConfig::default_toml());
        return;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
