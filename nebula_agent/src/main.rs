//! nebula_agent daemon entry point.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use nebula_agent::config::{ConfigManager, ConfigProvider, Overrides};
use nebula_agent::metrics::SysinfoCollector;
use nebula_agent::terminal::PtyLauncher;
use nebula_agent::{logging, privileges, Agent};

#[derive(Debug, Parser)]
#[command(name = "nebula_agent", version, about = "Host metrics and shell sessions over WebSocket")]
struct Cli {
    /// Config file (defaults to ./config.toml when present)
    #[arg(long, env = "NEBULA_CONFIG")]
    config: Option<PathBuf>,

    /// Listen port, overrides server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared secret for the API and WebSocket routes, overrides auth.token
    #[arg(long, env = "NEBULA_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Run without root privileges
    #[arg(
        long = "no-root-check",
        env = "NEBULA_NO_ROOT",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    no_root_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = Overrides {
        port: cli.port,
        auth_token: cli.token.clone(),
    };
    let config = Arc::new(ConfigManager::load(cli.config.clone(), overrides)?);
    let cfg = config.get();
    logging::init(&cfg.logging);
    if let Some(path) = config.path() {
        info!(path = %path.display(), "configuration loaded");
    }
    privileges::require_root(cli.no_root_check)?;

    let agent = Agent::start(
        config.clone(),
        Box::new(SysinfoCollector::new()),
        Arc::new(PtyLauncher),
    )?;
    let addr = cfg.address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %listener.local_addr()?, "nebula_agent listening");

    #[cfg(unix)]
    reload_on_sighup(config.clone());

    agent.serve(listener, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(unix)]
fn reload_on_sighup(config: Arc<ConfigManager>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("SIGHUP handler unavailable: {e}");
                return;
            }
        };
        while hup.recv().await.is_some() {
            let manager = config.clone();
            match tokio::task::spawn_blocking(move || manager.reload()).await {
                Ok(Ok(_)) => info!("configuration reloaded"),
                Ok(Err(e)) => warn!("configuration reload failed: {e:#}"),
                Err(e) => warn!("configuration reload task failed: {e}"),
            }
        }
    });
}
