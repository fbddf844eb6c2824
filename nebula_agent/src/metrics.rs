//! Snapshot collection using sysinfo for nebula_agent.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use chrono::Utc;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, Networks, RefreshKind, System};
use tracing::warn;

use crate::types::{CpuInfo, DiskInfo, MemoryInfo, NetworkInfo, Snapshot, SystemInfo};

/// Produces one snapshot per call. Implementations only read OS facilities.
pub trait MetricsSource: Send + 'static {
    fn collect(&mut self) -> Snapshot;
}

/// sysinfo-backed collector. Handles are kept alive across ticks so CPU usage and
/// network counters have a previous sample to diff against.
pub struct SysinfoCollector {
    sys: System,
    disks: Disks,
    networks: Networks,
    hostname: String,
    // iface -> (bytes_recv, bytes_sent) at `last_sample`
    last_counters: HashMap<String, (u64, u64)>,
    last_sample: Option<Instant>,
}

impl SysinfoCollector {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        let hostname = System::host_name()
            .or_else(|| hostname::get().ok().and_then(|s| s.into_string().ok()))
            .unwrap_or_else(|| "unknown".into());
        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            hostname,
            last_counters: HashMap::new(),
            last_sample: None,
        }
    }

    fn system_info(&self) -> SystemInfo {
        SystemInfo {
            hostname: self.hostname.clone(),
            os: std::env::consts::OS.to_string(),
            platform: System::distribution_id(),
            platform_version: System::os_version().unwrap_or_default(),
            kernel_version: System::kernel_version().unwrap_or_default(),
            kernel_arch: std::env::consts::ARCH.to_string(),
            uptime: System::uptime(),
            boot_time: System::boot_time(),
            num_cpu: self.sys.cpus().len(),
        }
    }

    fn cpu_info(&mut self) -> CpuInfo {
        self.sys.refresh_cpu_all();
        let cpus = self.sys.cpus();
        let (model_name, mhz) = cpus
            .first()
            .map(|c| (c.brand().trim().to_string(), c.frequency() as f64))
            .unwrap_or_default();
        CpuInfo {
            cores: cpus.len(),
            model_name,
            mhz,
            usage_percent: cpus.iter().map(|c| c.cpu_usage() as f64).collect(),
            total_percent: self.sys.global_cpu_usage() as f64,
        }
    }

    fn memory_info(&mut self) -> MemoryInfo {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let used = self.sys.used_memory();
        MemoryInfo {
            total,
            used,
            free: self.sys.free_memory(),
            available: self.sys.available_memory(),
            used_percent: percent(used, total),
            swap_total: self.sys.total_swap(),
            swap_used: self.sys.used_swap(),
            swap_free: self.sys.free_swap(),
        }
    }

    fn disk_info(&mut self) -> Vec<DiskInfo> {
        self.disks.refresh(true);
        // Filter pseudo filesystems reporting no capacity (proc, overlay stubs, ...)
        self.disks
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let total = d.total_space();
                let free = d.available_space();
                let used = total.saturating_sub(free);
                DiskInfo {
                    device: d.name().to_string_lossy().into_owned(),
                    mountpoint: d.mount_point().display().to_string(),
                    fstype: d.file_system().to_string_lossy().into_owned(),
                    total,
                    used,
                    free,
                    used_percent: percent(used, total),
                }
            })
            .collect()
    }

    fn network_info(&mut self) -> Vec<NetworkInfo> {
        self.networks.refresh(true);
        let now = Instant::now();
        let elapsed = self
            .last_sample
            .map(|t| now.duration_since(t).as_secs_f64())
            .filter(|s| *s > 0.0);

        let mut counters = HashMap::with_capacity(self.last_counters.len());
        let mut out: Vec<NetworkInfo> = self
            .networks
            .iter()
            .map(|(name, data)| {
                let recv = data.total_received();
                let sent = data.total_transmitted();
                let (rx_rate, tx_rate) = match (elapsed, self.last_counters.get(name)) {
                    (Some(secs), Some(&(prev_recv, prev_sent))) => (
                        recv.saturating_sub(prev_recv) as f64 / secs,
                        sent.saturating_sub(prev_sent) as f64 / secs,
                    ),
                    _ => (0.0, 0.0),
                };
                counters.insert(name.to_string(), (recv, sent));
                NetworkInfo {
                    name: name.to_string(),
                    bytes_sent: sent,
                    bytes_recv: recv,
                    packets_sent: data.total_packets_transmitted(),
                    packets_recv: data.total_packets_received(),
                    errin: data.total_errors_on_received(),
                    errout: data.total_errors_on_transmitted(),
                    rx_bytes_per_sec: rx_rate,
                    tx_bytes_per_sec: tx_rate,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));

        self.last_counters = counters;
        self.last_sample = Some(now);
        out
    }
}

impl Default for SysinfoCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoCollector {
    fn collect(&mut self) -> Snapshot {
        let timestamp = Utc::now();
        let system = section("system", || self.system_info());
        let cpu = section("cpu", || self.cpu_info());
        let memory = section("memory", || self.memory_info());
        let disks = section("disk", || self.disk_info());
        let network = section("network", || self.network_info());
        Snapshot {
            timestamp,
            system,
            cpu,
            memory,
            disks,
            network,
        }
    }
}

// A failing sub-collection degrades to its zero value; the tick carries on.
fn section<T: Default>(name: &'static str, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => v,
        Err(e) => {
            warn!(section = name, "partial metrics collection failure: {e:?}");
            T::default()
        }
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(25, 100), 25.0);
    }

    #[test]
    fn panicking_section_yields_default() {
        let v: Vec<DiskInfo> = section("disk", || panic!("enumeration failed"));
        assert!(v.is_empty());
    }

    #[test]
    fn collector_produces_a_snapshot() {
        let mut c = SysinfoCollector::new();
        let first = c.collect();
        assert!(first.system.num_cpu > 0);
        assert!(first.network.iter().all(|n| n.rx_bytes_per_sec == 0.0));
        let second = c.collect();
        assert!(second.timestamp >= first.timestamp);
    }
}
