//! Registry of live terminal sessions with limits taken from the current config.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::launcher::ShellLauncher;
use super::session::{Session, SessionInfo};
use super::shell;
use crate::config::ConfigProvider;
use crate::error::TerminalError;

pub struct TerminalManager {
    registry: RwLock<Registry>,
    launcher: Arc<dyn ShellLauncher>,
    config: Arc<dyn ConfigProvider>,
}

/// Live sessions plus ids whose shell is still being started.
#[derive(Default)]
struct Registry {
    live: HashMap<String, Arc<Session>>,
    starting: HashSet<String>,
}

impl Registry {
    fn occupied(&self) -> usize {
        self.live.len() + self.starting.len()
    }
}

impl TerminalManager {
    pub fn new(config: Arc<dyn ConfigProvider>, launcher: Arc<dyn ShellLauncher>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            launcher,
            config,
        }
    }

    /// Start `shell` (empty for the default) on a new PTY registered as `id`.
    pub fn create_session(
        &self,
        id: &str,
        shell: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Session>, TerminalError> {
        let max = self.config.get().terminal.max_sessions;
        {
            let mut reg = self.registry.write();
            if reg.occupied() >= max {
                return Err(TerminalError::CapacityExceeded { max });
            }
            if reg.live.contains_key(id) || reg.starting.contains(id) {
                return Err(TerminalError::DuplicateSession(id.to_string()));
            }
            reg.starting.insert(id.to_string());
        }

        // the PTY is opened without the registry lock; the reservation holds the id and the slot
        let started = self.resolve_shell(shell).and_then(|shell| {
            let spawned = self.launcher.spawn(&shell, cols, rows)?;
            Ok(Arc::new(Session::new(id, shell.as_str(), spawned)))
        });

        let mut reg = self.registry.write();
        let reserved = reg.starting.remove(id);
        let session = started?;
        if !reserved {
            // close_all ran while the shell was starting
            drop(reg);
            session.close();
            return Err(TerminalError::SessionClosed(id.to_string()));
        }
        reg.live.insert(id.to_string(), session.clone());
        info!(session = id, shell = %session.shell(), cols, rows, "terminal session created");
        Ok(session)
    }

    /// Empty means the default shell; anything else must pass the allow-list
    /// and is launched exactly as given.
    pub fn resolve_shell(&self, requested: &str) -> Result<String, TerminalError> {
        let cfg = self.config.get();
        let allowed = &cfg.terminal.allowed_shells;
        if requested.is_empty() {
            let Some(path) = shell::default_shell(&cfg.terminal.default_shell) else {
                return Err(TerminalError::SpawnFailed("no default shell found".into()));
            };
            let path = path.to_string_lossy().into_owned();
            if !shell::is_shell_allowed(&path, allowed) {
                warn!(shell = %path, "default shell is not in the allow-list");
                return Err(TerminalError::ShellNotAllowed(path));
            }
            return Ok(path);
        }
        if !shell::is_shell_allowed(requested, allowed) {
            return Err(TerminalError::ShellNotAllowed(requested.to_string()));
        }
        Ok(requested.to_string())
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>, TerminalError> {
        self.registry
            .read()
            .live
            .get(id)
            .cloned()
            .ok_or_else(|| TerminalError::SessionNotFound(id.to_string()))
    }

    /// Blocking; call from a blocking context.
    pub fn read(&self, id: &str, buf: &mut [u8]) -> Result<usize, TerminalError> {
        self.get(id)?.read(buf)
    }

    pub fn write(&self, id: &str, data: &[u8]) -> Result<usize, TerminalError> {
        self.get(id)?.write(data)
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.get(id)?.resize(cols, rows)
    }

    /// Kill and unregister. Returns false if no such session was registered.
    pub fn close_session(&self, id: &str) -> bool {
        let removed = self.registry.write().live.remove(id);
        match removed {
            Some(s) => {
                s.close();
                true
            }
            None => false,
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self.registry.read().live.values().map(|s| s.info()).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn session_count(&self) -> usize {
        self.registry.read().live.len()
    }

    pub fn available_shells(&self) -> Vec<PathBuf> {
        shell::available_shells(&self.config.get().terminal.allowed_shells)
    }

    pub fn default_shell(&self) -> Option<PathBuf> {
        shell::default_shell(&self.config.get().terminal.default_shell)
    }

    /// Close every session; used on shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = {
            let mut reg = self.registry.write();
            reg.starting.clear();
            reg.live.drain().map(|(_, s)| s).collect()
        };
        for s in &drained {
            s.close();
        }
        drained.len()
    }
}
