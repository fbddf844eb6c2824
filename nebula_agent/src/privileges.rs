//! The daemon manages other users' processes and shells, so it expects root.

use anyhow::Result;

#[cfg(unix)]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_root() -> bool {
    false
}

pub fn require_root(skip: bool) -> Result<()> {
    if skip {
        tracing::warn!("root check disabled");
        return Ok(());
    }
    if cfg!(not(unix)) {
        tracing::warn!("privilege check is not supported on this platform");
        return Ok(());
    }
    if !is_root() {
        anyhow::bail!("nebula_agent must run as root (use --no-root-check or NEBULA_NO_ROOT=1 to override)");
    }
    Ok(())
}
