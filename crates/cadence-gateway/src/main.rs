use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::CadenceConfig;
use cadence_scheduler::{db, PublisherRegistry, SchedulerEngine};
use clap::Parser;
use tracing::{info, warn};

mod app;
mod http;

/// cadence - scheduled and recurring post publisher
#[derive(Parser)]
#[command(name = "cadence-gateway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to cadence.toml (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Process everything currently due, wait for it to finish, then exit
    #[arg(long)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence_gateway=info,cadence_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let db_path = &config.database.path;
    let busy_timeout = Duration::from_millis(config.database.busy_timeout_ms);
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let registry = PublisherRegistry::from_config(&config.publishers);
    if registry.is_empty() {
        warn!("no publishers configured; every publish attempt will fail");
    }
    let platforms: Vec<String> = registry
        .platforms()
        .iter()
        .map(|p| p.to_string())
        .collect();

    // engine and handle each get their own connection
    let engine = SchedulerEngine::new(db::open(db_path, busy_timeout)?, registry, &config.scheduler)?;
    info!("database ready");

    if cli.scan_once {
        let processed = engine.run_pending().await?;
        info!(processed, "scan-once complete");
        return Ok(());
    }

    let handle = engine.handle(db::open(db_path, busy_timeout)?)?;

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(config, handle, platforms));
    let router = app::build_router(state);

    // spawn scheduler engine loop in background
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Cadence gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // signal scheduler to stop and let running workers finish
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        warn!("scheduler task ended abnormally: {e}");
    }
    Ok(())
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
