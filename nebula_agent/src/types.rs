//! Data types sent to clients over WebSocket and REST.
//! Keep this module minimal and stable: it defines the wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub platform_version: String,
    pub kernel_version: String,
    pub kernel_arch: String,
    pub uptime: u64,
    pub boot_time: u64,
    pub num_cpu: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CpuInfo {
    pub cores: usize,
    pub model_name: String,
    pub mhz: f64,
    pub usage_percent: Vec<f64>,
    pub total_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub available: u64,
    pub used_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub swap_free: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskInfo {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkInfo {
    pub name: String,
    // cumulative counters since boot
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    // derived from the real elapsed time between two samples
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

/// One immutable sample of the host. Every section has a zero-value default so a
/// partially failed collection is still a valid snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub system: SystemInfo,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disks: Vec<DiskInfo>,
    pub network: Vec<NetworkInfo>,
}

/// `{"type": ..., "payload": ...}` frame pushed to hub clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(kind: impl Into<String>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            payload: Some(payload),
        }
    }
}

/// Control directive a terminal client may send as a text frame.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ResizeDirective {
    #[serde(rename = "type")]
    kind: ResizeTag,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ResizeTag {
    Resize,
}

impl ResizeDirective {
    /// Returns the directive if `text` is a well-formed resize message, `None` for
    /// anything else (which the caller treats as raw terminal input).
    pub fn parse(text: &str) -> Option<Self> {
        if !text.trim_start().starts_with('{') {
            return None;
        }
        let d: Self = serde_json::from_str(text).ok()?;
        (d.kind == ResizeTag::Resize).then_some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_envelope_shape() {
        let env = Envelope::new("metrics", Snapshot::default());
        let v: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "metrics");
        assert!(v["payload"]["cpu"]["usage_percent"].is_array());
        assert!(v["payload"]["timestamp"].is_string());
    }

    #[test]
    fn resize_directive_is_recognised() {
        let d = ResizeDirective::parse(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!((d.cols, d.rows), (120, 40));
    }

    #[test]
    fn other_text_is_raw_input() {
        assert!(ResizeDirective::parse("ls -la\n").is_none());
        assert!(ResizeDirective::parse(r#"{"type":"input","data":"x"}"#).is_none());
        assert!(ResizeDirective::parse(r#"{"type":"resize","cols":-1,"rows":2}"#).is_none());
        assert!(ResizeDirective::parse("{not json").is_none());
    }
}
