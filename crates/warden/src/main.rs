//! # Warden - Beian filing query credential engine
//!
//! Solves the filing portal's click CAPTCHA to mint signed query
//! credentials, keeps a small pool of them warm, and serves cached filing
//! lookups over HTTP.
//!
//! ## Architecture
//! ```text
//! Consumer → Warden ─┬→ ResultCache (Redis | memory)
//!                    ├→ CredentialStore (JSON snapshot)
//!                    └→ Remote API ← ChallengeOrchestrator ← Solver (ONNX)
//!                                            ↑
//!                                       Replenisher
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod broker;
mod config;
mod export;
mod protocol;
mod query;
mod replenisher;
mod routes;
mod solver;
mod state;
mod store;

use config::AppConfig;
use state::AppState;

/// Beian Warden - filing query credential engine
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/warden.toml")]
    config: String,

    /// Redis URL for the result cache (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,

    /// Do not run the background credential replenisher
    #[arg(long, default_value = "false")]
    no_replenisher: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up .env before clap reads env-backed flags
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("🔥 Starting Beian Warden v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(&args.config, &args)?;
    info!(path = %args.config, "📋 Configuration loaded");

    let state = AppState::new(&config).await?;
    info!(path = ?config.store.path, "✅ Credential store ready");

    if config.replenisher.enabled {
        state.replenisher.start().await;
    } else {
        info!("Replenisher disabled");
    }

    let replenisher = state.replenisher.clone();
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("🚀 Warden listening on {}", config.listen_addr);

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("🛑 Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    replenisher.stop().await;
    info!("👋 Warden shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()?;
    }

    Ok(())
}
