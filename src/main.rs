use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rproxy::{Config, ProxyEngine};

#[derive(Parser, Debug)]
#[command(name = "rproxy")]
#[command(about = "A multithreaded caching reverse proxy")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Check the configuration and exit
    #[arg(long)]
    validate_config: bool,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to
    #[arg(long)]
    port: Option<u16>,

    /// Worker pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Cache store host
    #[arg(long)]
    redis_host: Option<String>,

    /// Cache store port
    #[arg(long)]
    redis_port: Option<u16>,

    /// Cache expiration in seconds
    #[arg(long)]
    cache_expiry: Option<u64>,

    /// Backend servers (comma-separated origin URLs)
    #[arg(long)]
    backend: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    config.apply_env();

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(threads) = args.threads {
        config.server.thread_pool_size = threads;
    }
    if let Some(host) = args.redis_host {
        config.cache.host = host;
    }
    if let Some(port) = args.redis_port {
        config.cache.port = port;
    }
    if let Some(expiry) = args.cache_expiry {
        config.cache.expiration = expiry;
    }
    if let Some(backends) = args.backend {
        config.backends = backends
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    config.validate()?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let engine = ProxyEngine::new(config).await?;
    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    engine.stop().await;
    Ok(())
}
