//! Shell allow-list matching and PATH lookup.

use std::env;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const FALLBACK_SHELLS: &[&str] = &["powershell", "cmd"];
#[cfg(not(windows))]
const FALLBACK_SHELLS: &[&str] = &["bash", "sh"];

/// Final path component, accepting both separators, without a trailing `.exe`.
pub fn base_name(shell: &str) -> &str {
    let name = shell.rsplit(['/', '\\']).next().unwrap_or(shell);
    match name.len().checked_sub(4) {
        Some(i) if name.is_char_boundary(i) && name[i..].eq_ignore_ascii_case(".exe") => &name[..i],
        _ => name,
    }
}

/// A shell is allowed when the request equals an entry or its base name does.
pub fn is_shell_allowed(shell: &str, allowed: &[String]) -> bool {
    if shell.is_empty() {
        return false;
    }
    let base = base_name(shell);
    allowed.iter().any(|a| a == shell || a == base)
}

/// Locate an executable. Names containing a separator are checked as given.
pub fn lookup_path(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains(['/', '\\']) {
        let p = PathBuf::from(name);
        return is_executable(&p).then_some(p);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .flat_map(|dir| candidates(&dir, name))
        .find(|p| is_executable(p))
}

#[cfg(windows)]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    let exts = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".into());
    std::iter::once(dir.join(name))
        .chain(exts.split(';').filter(|e| !e.is_empty()).map(|e| dir.join(format!("{name}{e}"))))
        .collect()
}

#[cfg(not(windows))]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name)]
}

#[cfg(unix)]
fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    p.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(p: &Path) -> bool {
    p.is_file()
}

/// Configured default if it is on PATH, else the first platform fallback found.
pub fn default_shell(configured: &str) -> Option<PathBuf> {
    if let Some(p) = lookup_path(configured) {
        return Some(p);
    }
    FALLBACK_SHELLS.iter().find_map(|s| lookup_path(s))
}

/// Allowed shells that actually exist on this host.
pub fn available_shells(allowed: &[String]) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = allowed.iter().filter_map(|s| lookup_path(s)).collect();
    out.dedup();
    out
}
