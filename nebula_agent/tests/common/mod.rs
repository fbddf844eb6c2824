//! Helpers shared by the integration tests.
#![allow(dead_code)]

use chrono::Utc;
use nebula_agent::config::{Config, ConfigManager};
use nebula_agent::metrics::MetricsSource;
use nebula_agent::state::AppState;
use nebula_agent::terminal::PtyLauncher;
use nebula_agent::types::Snapshot;
use nebula_agent::Agent;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const HOSTNAME: &str = "test-host";

/// Deterministic snapshot source.
pub struct StaticSource;

impl MetricsSource for StaticSource {
    fn collect(&mut self) -> Snapshot {
        let mut s = Snapshot {
            timestamp: Utc::now(),
            ..Default::default()
        };
        s.system.hostname = HOSTNAME.into();
        s.system.num_cpu = 2;
        s.cpu.cores = 2;
        s.cpu.usage_percent = vec![10.0, 30.0];
        s.cpu.total_percent = 20.0;
        s.memory.total = 1024;
        s.memory.used = 512;
        s.memory.used_percent = 50.0;
        s
    }
}

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.server.host = "127.0.0.1".into();
    cfg.server.port = 0;
    cfg.server.shutdown_timeout_secs = 5;
    cfg.metrics.interval_ms = 20;
    cfg.storage.enabled = false;
    cfg.terminal.allowed_shells = vec!["sh".into(), "bash".into()];
    cfg
}

pub struct TestAgent {
    pub addr: SocketAddr,
    pub state: AppState,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestAgent {
    pub async fn start(cfg: Config) -> Self {
        let agent = Agent::start(
            Arc::new(ConfigManager::new(cfg)),
            Box::new(StaticSource),
            Arc::new(PtyLauncher),
        )
        .unwrap();
        let state = agent.state().clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(agent.serve(listener, async move {
            let _ = stopped.await;
        }));
        Self {
            addr,
            state,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub fn ws_url(&self, path_and_query: &str) -> String {
        format!("ws://{}{}", self.addr, path_and_query)
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("agent shut down in time")
                .unwrap()
                .unwrap();
        }
    }
}
