// crates/server/src/main.rs
//! Charart server binary.
//!
//! Loads config (file, then `CHARART_*` env, then flags), installs logging
//! and metrics, and serves the progress hub over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use charart_core::AppConfig;
use charart_server::{app, init_metrics, AppState};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "charart-server", version, about = "Character-art progress hub")]
struct Args {
    /// TOML config file. Falls back to `CHARART_CONFIG`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on. Overrides config and env.
    #[arg(short, long)]
    port: Option<u16>,

    /// Base URL of the remote worker service.
    #[arg(long)]
    remote_url: Option<String>,

    /// Emit JSON logs on the console.
    #[arg(long)]
    json_logs: bool,
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = AppConfig::load(args.config.as_deref()).context("loading config")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = &args.remote_url {
        config.relay.base_url = Some(url.clone());
    }
    if args.json_logs {
        config.logging.json = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Keep the guard alive for the whole run or buffered file logs are lost.
    let _log_guard = charart_observability::init_tracing(&config.logging)?;
    init_metrics();

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.server.bind, config.server.port))?;

    let state = AppState::new(config);
    let _sweeper = state.spawn_temp_sweeper();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!(
        %addr,
        version = env!("CARGO_PKG_VERSION"),
        relay = state.relay.is_some(),
        temp_root = %state.temp.root().display(),
        "charart server listening"
    );

    axum::serve(listener, app(state)).await?;
    Ok(())
}
