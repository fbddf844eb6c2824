//! Shared agent state handed to every HTTP and WebSocket handler.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{Config, ConfigManager, ConfigProvider};
use crate::history::History;
use crate::hub::Hub;
use crate::process::ProcessManager;
use crate::store::MetricsStore;
use crate::terminal::TerminalManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigManager>,
    pub hub: Hub,
    // Last `history_size` snapshots; the newest one is served to fresh clients
    pub history: Arc<History>,
    pub terminals: Arc<TerminalManager>,
    pub processes: Arc<ProcessManager>,
    pub store: Option<Arc<dyn MetricsStore>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn config(&self) -> Arc<Config> {
        self.config.get()
    }

    /// Token required on protected routes, if any.
    pub fn auth_token(&self) -> Option<String> {
        self.config().auth.token.clone().filter(|t| !t.is_empty())
    }
}
