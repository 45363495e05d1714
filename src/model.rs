//! Records handed to the presentation layer. All of them serialize to
//! field-named JSON and are immutable once built.

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub host_name: Option<String>,
    pub uptime_secs: u64,
    /// Boot time, RFC 3339.
    pub time_since_uptime: Option<String>,
    pub process_count: u64,

    pub cpu_percent: Vec<f64>,
    pub cpu_used_percent: f64,
    pub cpu_used: f64,
    pub cpu_total: usize,
    /// `[user, system, nice, idle, iowait, irq, softirq, steal]`
    pub cpu_detailed_percent: Vec<f64>,

    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub load_usage_percent: f64,

    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    pub memory_shared: u64,
    pub memory_cache: u64,
    pub memory_available: u64,
    pub memory_used_percent: f64,

    pub swap_total: u64,
    pub swap_available: u64,
    pub swap_used: u64,
    pub swap_used_percent: f64,

    pub disks: Vec<DiskUsageRecord>,

    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub io_count: u64,
    pub io_read_time_ms: u64,
    pub io_write_time_ms: u64,

    pub net_bytes_sent: u64,
    pub net_bytes_recv: u64,

    pub captured_at: String,
    pub captured_at_unix: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskUsageRecord {
    pub path: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub device: String,
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_percent: f64,
    pub inodes_total: u64,
    pub inodes_used: u64,
    pub inodes_free: u64,
    pub inodes_used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub cmd: String,
    pub user: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BaseFacts {
    pub host_name: Option<String>,
    pub os: String,
    pub platform: Option<String>,
    pub platform_family: Option<String>,
    pub platform_version: Option<String>,
    pub pretty_distro: Option<String>,
    pub kernel_arch: String,
    pub kernel_version: Option<String>,
    pub ipv4_addr: Option<String>,
    pub system_proxy: String,
    pub cpu_cores: usize,
    pub cpu_logical_cores: usize,
    pub cpu_model_name: Option<String>,
    pub cpu_mhz: f64,
    pub current: Snapshot,
}
