//! Raw point-in-time facts about the host.
//!
//! `HostFacts` is the only way the collectors touch the operating system.
//! Production code uses [`SysinfoFacts`]; tests script a fake.

pub mod procfs;
pub mod system;

#[cfg(test)]
pub mod fake;

use std::time::Duration;
use thiserror::Error;

pub use self::system::SysinfoFacts;

#[derive(Debug, Error)]
pub enum FactsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },
    #[error("{0} unavailable")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostIdentity {
    pub host_name: Option<String>,
    pub os: String,
    pub platform: Option<String>,
    /// Distribution family, e.g. `debian` for Ubuntu.
    pub platform_family: Option<String>,
    pub platform_version: Option<String>,
    pub pretty_distro: Option<String>,
    pub kernel_arch: String,
    pub kernel_version: Option<String>,
    pub uptime_secs: u64,
    pub boot_time_unix: u64,
    pub process_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuModel {
    pub model_name: String,
    pub mhz: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryFacts {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub available: u64,
    pub shared: u64,
    pub cached: u64,
    pub buffers: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SwapFacts {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFacts {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageFacts {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_percent: f64,
    pub inodes_total: u64,
    pub inodes_used: u64,
    pub inodes_free: u64,
    pub inodes_used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskIoFacts {
    pub name: String,
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_time_ms: u64,
    pub write_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkFacts {
    pub name: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// One process as enumerated. Per-field `None` means that query failed
/// for this process only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessFacts {
    pub pid: u32,
    pub name: Option<String>,
    pub cmdline: Option<String>,
    pub user: Option<String>,
    pub cpu_percent: Option<f64>,
    pub memory_rss: Option<u64>,
    pub memory_percent: Option<f64>,
}

/// `part / whole * 100`, or 0 when `whole` is 0.
pub fn percent_of(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

pub trait HostFacts: Send + Sync {
    fn host_identity(&self) -> Result<HostIdentity, FactsError>;

    fn cpu_models(&self) -> Result<Vec<CpuModel>, FactsError>;

    fn cpu_count(&self, logical: bool) -> Result<usize, FactsError>;

    /// Per-core busy percentage measured over `window`. Blocks for the window.
    fn cpu_percent(&self, window: Duration) -> Result<Vec<f64>, FactsError>;

    /// Raw kernel tick counters (the text of `/proc/stat` on Linux).
    fn kernel_cpu_counters(&self) -> Result<String, FactsError>;

    fn load_average(&self) -> Result<LoadAverage, FactsError>;

    fn memory(&self) -> Result<MemoryFacts, FactsError>;

    fn swap(&self) -> Result<SwapFacts, FactsError>;

    fn partitions(&self) -> Result<Vec<PartitionFacts>, FactsError>;

    /// Filesystem usage of one mount. May block on unresponsive mounts.
    fn disk_usage(&self, mount_point: &str) -> Result<UsageFacts, FactsError>;

    fn disk_io_counters(&self) -> Result<Vec<DiskIoFacts>, FactsError>;

    /// Cumulative interface counters, sorted by interface name.
    fn network_counters(&self) -> Result<Vec<NetworkFacts>, FactsError>;

    fn processes(&self) -> Result<Vec<ProcessFacts>, FactsError>;
}
