//! Best-effort persistence of sampled metrics as JSON lines.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::types::{CpuInfo, DiskInfo, MemoryInfo, NetworkInfo, Snapshot};

/// Condensed record kept on disk for each tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEntry {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuMetrics,
    pub memory: MemoryInfo,
    pub disk: Vec<DiskInfo>,
    pub network: Vec<NetCounters>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuMetrics {
    pub usage_percent: Vec<f64>,
    pub total_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetCounters {
    pub name: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

impl From<&CpuInfo> for CpuMetrics {
    fn from(c: &CpuInfo) -> Self {
        Self {
            usage_percent: c.usage_percent.clone(),
            total_percent: c.total_percent,
        }
    }
}

impl From<&NetworkInfo> for NetCounters {
    fn from(n: &NetworkInfo) -> Self {
        Self {
            name: n.name.clone(),
            bytes_sent: n.bytes_sent,
            bytes_recv: n.bytes_recv,
            packets_sent: n.packets_sent,
            packets_recv: n.packets_recv,
        }
    }
}

impl From<&Snapshot> for MetricsEntry {
    fn from(s: &Snapshot) -> Self {
        Self {
            timestamp: s.timestamp,
            cpu: CpuMetrics::from(&s.cpu),
            memory: s.memory.clone(),
            disk: s.disks.clone(),
            network: s.network.iter().map(NetCounters::from).collect(),
        }
    }
}

pub trait MetricsStore: Send + Sync {
    fn add_metrics_entry(&self, entry: &MetricsEntry) -> Result<()>;

    /// Up to `limit` entries, newest first. `limit == 0` means all.
    fn recent(&self, limit: usize) -> Result<Vec<MetricsEntry>>;

    /// Drop entries older than `retention`. Returns how many were removed.
    fn prune_older_than(&self, retention: Duration) -> Result<usize>;
}

pub struct JsonlStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Lines that fail to parse (torn writes) are skipped.
    fn read_all(&self) -> Result<Vec<MetricsEntry>> {
        let f = File::open(&self.path).with_context(|| format!("opening {}", self.path.display()))?;
        let mut out = Vec::new();
        for line in BufReader::new(f).lines() {
            let line = line?;
            if let Ok(e) = serde_json::from_str::<MetricsEntry>(&line) {
                out.push(e);
            }
        }
        Ok(out)
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

impl MetricsStore for JsonlStore {
    fn add_metrics_entry(&self, entry: &MetricsEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut f = self.file.lock();
        f.write_all(&line)?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<MetricsEntry>> {
        let _guard = self.file.lock();
        let mut all = self.read_all()?;
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if limit > 0 {
            all.truncate(limit);
        }
        Ok(all)
    }

    fn prune_older_than(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut file = self.file.lock();
        let all = self.read_all()?;
        let before = all.len();
        let keep: Vec<_> = all.into_iter().filter(|e| e.timestamp >= cutoff).collect();
        let removed = before - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
            for e in &keep {
                serde_json::to_writer(&mut out, e)?;
                out.write_all(b"\n")?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        *file = open_append(&self.path)?;
        Ok(removed)
    }
}
