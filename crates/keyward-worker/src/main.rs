//! Keyward Worker - background key rotation service

use clap::Parser;
use keyward_worker::{run_worker, WorkerConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "keyward-worker")]
#[command(about = "Background key rotation worker for Keyward")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "KEYWARD_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Database pool size
    #[arg(long, default_value = "10", env = "KEYWARD_MAX_CONNECTIONS")]
    max_connections: u32,

    /// Seconds between maintenance passes
    #[arg(long, default_value = "60", env = "KEYWARD_MAINTENANCE_INTERVAL")]
    maintenance_interval: u64,

    /// Use in-memory storage (for testing, data will not persist)
    #[arg(long, env = "KEYWARD_MEMORY_STORE")]
    memory_store: bool,

    /// Enable debug logging
    #[arg(short, long, env = "KEYWARD_DEBUG")]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, env = "KEYWARD_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "keyward_worker={level},keyward_core={level},sqlx=warn",
            level = log_level
        )
        .into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting Keyward worker");

    let config = WorkerConfig {
        config_path: args.config,
        database_url: args.database_url,
        use_memory_store: args.memory_store,
        max_connections: args.max_connections,
        maintenance_interval_secs: args.maintenance_interval,
    };

    run_worker(config).await
}
