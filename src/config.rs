use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_proc_root")]
    pub proc_root: String,
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub processes: ProcessConfig,
    #[serde(default)]
    pub disk: DiskConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CpuConfig {
    /// Cached usage younger than this is returned without resampling.
    #[serde(default = "default_fast_refresh_ms")]
    pub fast_refresh_ms: u64,
    /// Length of the blocking per-core measurement.
    #[serde(default = "default_sampling_window_ms")]
    pub sampling_window_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProcessConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DiskConfig {
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_excluded_fs_types")]
    pub excluded_fs_types: Vec<String>,
    #[serde(default = "default_excluded_mount_paths")]
    pub excluded_mount_paths: Vec<String>,
    /// Mounts splitting into more `/`-separated segments than this are skipped.
    #[serde(default = "default_max_mount_segments")]
    pub max_mount_segments: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proc_root: default_proc_root(),
            watch_interval_secs: default_watch_interval_secs(),
            cpu: CpuConfig::default(),
            processes: ProcessConfig::default(),
            disk: DiskConfig::default(),
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            fast_refresh_ms: default_fast_refresh_ms(),
            sampling_window_ms: default_sampling_window_ms(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            excluded_fs_types: default_excluded_fs_types(),
            excluded_mount_paths: default_excluded_mount_paths(),
            max_mount_segments: default_max_mount_segments(),
        }
    }
}

impl CpuConfig {
    pub fn fast_refresh(&self) -> Duration {
        Duration::from_millis(self.fast_refresh_ms)
    }

    pub fn sampling_window(&self) -> Duration {
        Duration::from_millis(self.sampling_window_ms)
    }
}

impl DiskConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proc_root.trim().is_empty() {
            return Err(ConfigError::Validation(
                "proc_root must not be empty".to_string(),
            ));
        }
        if self.watch_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "watch_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.cpu.fast_refresh_ms == 0 {
            return Err(ConfigError::Validation(
                "cpu.fast_refresh_ms must be > 0".to_string(),
            ));
        }
        if self.cpu.sampling_window_ms == 0 {
            return Err(ConfigError::Validation(
                "cpu.sampling_window_ms must be > 0".to_string(),
            ));
        }
        if !(1..=1000).contains(&self.processes.top_k) {
            return Err(ConfigError::Validation(
                "processes.top_k must be in range 1..1000".to_string(),
            ));
        }
        validate_disk(&self.disk)?;
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_disk(cfg: &DiskConfig) -> Result<(), ConfigError> {
    if cfg.query_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "disk.query_timeout_ms must be > 0".to_string(),
        ));
    }
    if cfg.max_mount_segments < 2 {
        return Err(ConfigError::Validation(
            "disk.max_mount_segments must be >= 2".to_string(),
        ));
    }
    if let Some(path) = cfg
        .excluded_mount_paths
        .iter()
        .find(|p| !p.starts_with('/'))
    {
        return Err(ConfigError::Validation(format!(
            "disk.excluded_mount_paths entry '{path}' must be absolute"
        )));
    }
    Ok(())
}

fn default_proc_root() -> String {
    "/proc".to_string()
}

const fn default_watch_interval_secs() -> u64 {
    5
}

const fn default_fast_refresh_ms() -> u64 {
    3000
}

const fn default_sampling_window_ms() -> u64 {
    100
}

const fn default_top_k() -> usize {
    5
}

const fn default_query_timeout_ms() -> u64 {
    5000
}

fn default_excluded_fs_types() -> Vec<String> {
    [
        "tmpfs", "overlay", "proc", "cgroup", "sysfs", "mqueue", "devpts",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_excluded_mount_paths() -> Vec<String> {
    [
        "/mnt/cdrom",
        "/boot",
        "/boot/efi",
        "/dev",
        "/dev/shm",
        "/run/lock",
        "/run",
        "/run/shm",
        "/run/user",
        "/snap",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

const fn default_max_mount_segments() -> usize {
    10
}
