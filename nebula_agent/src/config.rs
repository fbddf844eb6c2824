//! Daemon configuration: TOML file + defaults, with CLI/env overrides and reload.
//! Default file: ./config.toml (or $NEBULA_CONFIG).

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub terminal: TerminalConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub websocket: WebSocketConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_ms: u64,
    pub history_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    pub default_shell: String,
    pub allowed_shells: Vec<String>,
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    pub ping_interval_secs: u64,
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
    pub max_message_bytes: usize,
    pub send_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            history_size: 60,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_shell: String::new(),
            allowed_shells: ["bash", "zsh", "sh", "ksh", "cmd", "powershell"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_sessions: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_store_path(),
            retention_secs: 3_600,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            pong_wait_secs: 60,
            write_wait_secs: 10,
            max_message_bytes: 512 * 1024,
            send_queue: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

fn default_store_path() -> PathBuf {
    dirs_next::data_dir()
        .map(|d| d.join("nebula").join("metrics.jsonl"))
        .unwrap_or_else(|| PathBuf::from("metrics.jsonl"))
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(s).context("invalid config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.metrics.interval_ms == 0 {
            bail!("metrics.interval_ms must be greater than zero");
        }
        if self.metrics.history_size == 0 {
            bail!("metrics.history_size must be greater than zero");
        }
        if self.terminal.max_sessions == 0 {
            bail!("terminal.max_sessions must be greater than zero");
        }
        let ws = &self.websocket;
        if ws.send_queue == 0 {
            bail!("websocket.send_queue must be greater than zero");
        }
        if ws.ping_interval_secs == 0 || ws.write_wait_secs == 0 {
            bail!("websocket.ping_interval_secs and write_wait_secs must be greater than zero");
        }
        if ws.pong_wait_secs <= ws.ping_interval_secs {
            bail!("websocket.pong_wait_secs must exceed ping_interval_secs");
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.metrics.interval_ms)
    }

    /// Copy safe to hand out over the REST API.
    pub fn redacted(&self) -> Config {
        let mut c = self.clone();
        if c.auth.token.is_some() {
            c.auth.token = Some("********".into());
        }
        c
    }
}

/// Read access to the current configuration.
pub trait ConfigProvider: Send + Sync {
    fn get(&self) -> Arc<Config>;
}

/// Values applied on top of whatever the file says, on load and on every reload.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub auth_token: Option<String>,
}

impl Overrides {
    fn apply(&self, cfg: &mut Config) {
        if let Some(p) = self.port {
            cfg.server.port = p;
        }
        if let Some(t) = self.auth_token.as_ref().filter(|t| !t.is_empty()) {
            cfg.auth.token = Some(t.clone());
        }
    }
}

pub struct ConfigManager {
    current: RwLock<Arc<Config>>,
    path: Option<PathBuf>,
    required: bool,
    overrides: Overrides,
}

impl ConfigManager {
    /// In-memory configuration with no backing file; `reload` is a no-op.
    pub fn new(cfg: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(cfg)),
            path: None,
            required: false,
            overrides: Overrides::default(),
        }
    }

    /// Load from `explicit` (must exist) or the default file (may be absent).
    pub fn load(explicit: Option<PathBuf>, overrides: Overrides) -> Result<Self> {
        let (path, required) = match explicit {
            Some(p) => (p, true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        let cfg = read_config(&path, required, &overrides)?;
        Ok(Self {
            current: RwLock::new(Arc::new(cfg)),
            path: Some(path),
            required,
            overrides,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file. The previous config stays active on error.
    pub fn reload(&self) -> Result<Arc<Config>> {
        let Some(path) = self.path.as_ref() else {
            return Ok(self.get());
        };
        let cfg = Arc::new(read_config(path, self.required, &self.overrides)?);
        *self.current.write() = cfg.clone();
        Ok(cfg)
    }
}

impl ConfigProvider for ConfigManager {
    fn get(&self) -> Arc<Config> {
        self.current.read().clone()
    }
}

fn read_config(path: &Path, required: bool, overrides: &Overrides) -> Result<Config> {
    let mut cfg = match fs::read_to_string(path) {
        Ok(s) => Config::from_toml(&s).with_context(|| format!("parsing {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Config::default(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    overrides.apply(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}
