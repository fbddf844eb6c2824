//! Interactive shell sessions on pseudo-terminals.

pub mod launcher;
pub mod manager;
pub mod session;
pub mod shell;

pub use launcher::{PtyLauncher, ShellControl, ShellLauncher, SpawnedShell};
pub use manager::TerminalManager;
pub use session::{Session, SessionInfo};
