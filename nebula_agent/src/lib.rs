//! nebula_agent: local administration daemon streaming host metrics and
//! interactive shells over WebSocket.

pub mod api;
pub mod config;
pub mod error;
pub mod history;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod privileges;
pub mod process;
pub mod sampler;
pub mod server;
pub mod state;
pub mod store;
pub mod terminal;
pub mod types;
pub mod ws;

pub use config::{Config, ConfigManager, ConfigProvider};
pub use server::Agent;
