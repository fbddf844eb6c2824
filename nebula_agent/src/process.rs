//! Host process listing and signalling on top of sysinfo.
//!
//! One `System` is kept across calls: sysinfo derives per-process CPU% from the
//! delta between two refreshes, so the first listing reports zero CPU and later
//! ones cover the time since the previous request.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, Signal, System, Users};
use tracing::{info, warn};

use crate::error::ProcessError;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub name: String,
    pub status: String,
    pub username: String,
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub mem_rss: u64,
    pub mem_vms: u64,
    // seconds since the epoch
    pub create_time: u64,
    pub cmdline: String,
    pub exe: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessNode {
    #[serde(flatten)]
    pub process: ProcessInfo,
    pub children: Vec<ProcessNode>,
}

pub struct ProcessManager {
    inner: Mutex<Inner>,
    self_pid: u32,
}

struct Inner {
    sys: System,
    users: Users,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sys: System::new(),
                users: Users::new_with_refreshed_list(),
            }),
            self_pid: std::process::id(),
        }
    }

    /// Every process, busiest first. Blocking.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut inner = self.inner.lock();
        inner.refresh();
        let mut out: Vec<ProcessInfo> = inner.sys.processes().values().map(|p| inner.describe(p)).collect();
        out.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent).then_with(|| a.pid.cmp(&b.pid)));
        out
    }

    pub fn get(&self, pid: u32) -> Result<ProcessInfo, ProcessError> {
        let mut inner = self.inner.lock();
        inner.refresh();
        let p = inner.sys.process(Pid::from_u32(pid)).ok_or(ProcessError::NotFound(pid))?;
        Ok(inner.describe(p))
    }

    /// Case-insensitive match on the name or the command line.
    pub fn search(&self, query: &str) -> Vec<ProcessInfo> {
        let needle = query.to_lowercase();
        self.list()
            .into_iter()
            .filter(|p| p.name.to_lowercase().contains(&needle) || p.cmdline.to_lowercase().contains(&needle))
            .collect()
    }

    /// `pid` and its descendants, children ordered by pid.
    pub fn tree(&self, pid: u32) -> Result<ProcessNode, ProcessError> {
        let mut inner = self.inner.lock();
        inner.refresh();
        let procs = inner.sys.processes();
        if !procs.contains_key(&Pid::from_u32(pid)) {
            return Err(ProcessError::NotFound(pid));
        }
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for p in procs.values() {
            if let Some(parent) = p.parent() {
                children.entry(parent.as_u32()).or_default().push(p.pid().as_u32());
            }
        }
        for kids in children.values_mut() {
            kids.sort_unstable();
        }
        let mut seen = HashSet::new();
        Ok(inner.build_node(pid, &children, &mut seen))
    }

    /// SIGTERM, or SIGKILL when `force`. Init and the agent itself are refused.
    pub fn kill(&self, pid: u32, force: bool) -> Result<(), ProcessError> {
        if pid <= 1 || pid == self.self_pid {
            warn!(pid, "refusing to signal protected process");
            return Err(ProcessError::Protected(pid));
        }
        let mut inner = self.inner.lock();
        let target = Pid::from_u32(pid);
        inner.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing(),
        );
        let p = inner.sys.process(target).ok_or(ProcessError::NotFound(pid))?;
        let signal = if force { Signal::Kill } else { Signal::Term };
        match p.kill_with(signal) {
            Some(true) => {
                info!(pid, ?signal, "process signalled");
                Ok(())
            }
            // unsupported on this platform: fall back to the platform's kill
            None if p.kill() => Ok(()),
            _ => Err(ProcessError::SignalFailed(pid)),
        }
    }
}

impl Inner {
    fn refresh(&mut self) {
        self.sys.refresh_memory();
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything().without_tasks(),
        );
    }

    fn describe(&self, p: &Process) -> ProcessInfo {
        let total = self.sys.total_memory();
        let mem_percent = if total == 0 {
            0.0
        } else {
            (p.memory() as f64 / total as f64 * 100.0) as f32
        };
        let username = p
            .user_id()
            .and_then(|uid| self.users.get_user_by_id(uid))
            .map(|u| u.name().to_string())
            .unwrap_or_default();
        let cmdline = p
            .cmd()
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        ProcessInfo {
            pid: p.pid().as_u32(),
            ppid: p.parent().map(|pp| pp.as_u32()),
            name: p.name().to_string_lossy().into_owned(),
            status: p.status().to_string(),
            username,
            cpu_percent: p.cpu_usage(),
            mem_percent,
            mem_rss: p.memory(),
            mem_vms: p.virtual_memory(),
            create_time: p.start_time(),
            cmdline,
            exe: p.exe().map(|e| e.display().to_string()).unwrap_or_default(),
            cwd: p.cwd().map(|c| c.display().to_string()).unwrap_or_default(),
        }
    }

    fn build_node(&self, pid: u32, children: &HashMap<u32, Vec<u32>>, seen: &mut HashSet<u32>) -> ProcessNode {
        seen.insert(pid);
        // a parent link can name a pid that exited mid-walk
        let process = match self.sys.process(Pid::from_u32(pid)) {
            Some(p) => self.describe(p),
            None => ProcessInfo {
                pid,
                ..Default::default()
            },
        };
        let kids = children
            .get(&pid)
            .map(|kids| {
                kids.iter()
                    .filter(|k| !seen.contains(*k))
                    .copied()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let children = kids.into_iter().map(|k| self.build_node(k, children, seen)).collect();
        ProcessNode { process, children }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_current_process() {
        let m = ProcessManager::new();
        let me = std::process::id();
        let info = m.get(me).unwrap();
        assert_eq!(info.pid, me);
        assert!(info.mem_rss > 0);
        assert!(m.list().iter().any(|p| p.pid == me));
    }

    #[test]
    fn listing_is_sorted_by_cpu() {
        let list = ProcessManager::new().list();
        assert!(list.windows(2).all(|w| w[0].cpu_percent >= w[1].cpu_percent));
    }

    #[test]
    fn unknown_pid_is_not_found() {
        let m = ProcessManager::new();
        assert!(matches!(m.get(u32::MAX - 7), Err(ProcessError::NotFound(_))));
        assert!(matches!(m.tree(u32::MAX - 7), Err(ProcessError::NotFound(_))));
        assert!(matches!(m.kill(u32::MAX - 7, false), Err(ProcessError::NotFound(_))));
    }

    #[test]
    fn init_and_self_are_protected() {
        let m = ProcessManager::new();
        assert!(matches!(m.kill(1, true), Err(ProcessError::Protected(1))));
        let me = std::process::id();
        assert!(matches!(m.kill(me, false), Err(ProcessError::Protected(_))));
    }

    #[cfg(unix)]
    #[test]
    fn tree_contains_spawned_child_and_kill_terminates_it() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let m = ProcessManager::new();

        let tree = m.tree(std::process::id()).unwrap();
        assert!(tree.children.iter().any(|c| c.process.pid == pid));
        assert!(m.search("sleep").iter().any(|p| p.pid == pid));

        m.kill(pid, false).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
