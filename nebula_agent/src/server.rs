//! Wiring of the long-lived components and their shutdown order.

use anyhow::{Context, Result};
use axum::Router;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::config::{ConfigManager, ConfigProvider};
use crate::history::History;
use crate::hub::Hub;
use crate::metrics::MetricsSource;
use crate::process::ProcessManager;
use crate::sampler::{Sampler, SamplerHandle};
use crate::state::AppState;
use crate::store::{JsonlStore, MetricsStore};
use crate::terminal::{ShellLauncher, TerminalManager};

pub struct Agent {
    state: AppState,
    sampler: SamplerHandle,
    hub_task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Agent {
    /// Start the hub and the sampler. Must be called inside a tokio runtime.
    pub fn start(
        config: Arc<ConfigManager>,
        source: Box<dyn MetricsSource>,
        launcher: Arc<dyn ShellLauncher>,
    ) -> Result<Self> {
        let cfg = config.get();
        let store = open_store(&cfg.storage);
        let cancel = CancellationToken::new();

        let (hub, hub_task) = Hub::spawn(cfg.websocket.send_queue, cancel.child_token());
        let history = Arc::new(History::new(cfg.metrics.history_size));
        let provider: Arc<dyn ConfigProvider> = config.clone();
        let terminals = Arc::new(TerminalManager::new(provider, launcher));

        let retention = Some(Duration::from_secs(cfg.storage.retention_secs)).filter(|d| !d.is_zero());
        let mut sampler = Sampler::new(source, history.clone(), hub.clone(), cfg.interval());
        if let Some(store) = store.clone() {
            sampler = sampler.with_store(store, retention);
        }
        let sampler = sampler.spawn(cancel.child_token());

        let state = AppState {
            config,
            hub,
            history,
            terminals,
            processes: Arc::new(ProcessManager::new()),
            store,
            started_at: Instant::now(),
        };
        Ok(Self {
            state,
            sampler,
            hub_task,
            cancel,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        api::router(self.state.clone())
    }

    /// Serve until `signal` resolves, then stop accepting and tear down.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(stop.clone().cancelled_owned())
            .into_future();
        let server = tokio::spawn(server);

        signal.await;
        info!("shutdown requested");
        stop.cancel();

        let grace = Duration::from_secs(self.state.config().server.shutdown_timeout_secs);
        let drain = async move {
            self.shutdown().await;
            server.await
        };
        match tokio::time::timeout(grace, drain).await {
            Ok(Ok(res)) => res.context("http server"),
            Ok(Err(e)) => Err(e).context("http server task"),
            Err(_) => {
                warn!(timeout_secs = grace.as_secs(), "graceful shutdown timed out");
                Ok(())
            }
        }
    }

    /// Close every terminal session, stop the sampler, then the hub.
    pub async fn shutdown(self) {
        let terminals = self.state.terminals.clone();
        match tokio::task::spawn_blocking(move || terminals.close_all()).await {
            Ok(0) => {}
            Ok(n) => info!(sessions = n, "terminal sessions closed"),
            Err(e) => warn!("closing terminal sessions failed: {e}"),
        }
        self.sampler.stop().await;
        self.cancel.cancel();
        let _ = self.hub_task.await;
        info!("agent stopped");
    }
}

fn open_store(cfg: &crate::config::StorageConfig) -> Option<Arc<dyn MetricsStore>> {
    if !cfg.enabled {
        return None;
    }
    match JsonlStore::open(&cfg.path) {
        Ok(s) => {
            info!(path = %s.path().display(), "persisting metrics");
            Some(Arc::new(s))
        }
        // persistence is best-effort; the live pipeline runs without it
        Err(e) => {
            warn!("metrics storage unavailable: {e:#}");
            None
        }
    }
}
