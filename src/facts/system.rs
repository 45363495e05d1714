use crate::facts::{
    percent_of, CpuModel, DiskIoFacts, FactsError, HostFacts, HostIdentity, LoadAverage,
    MemoryFacts, NetworkFacts, PartitionFacts, ProcessFacts, SwapFacts, UsageFacts,
};
#[cfg(target_os = "linux")]
use crate::facts::procfs;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
#[cfg(not(target_os = "linux"))]
use sysinfo::DiskExt;
use sysinfo::{
    CpuExt, NetworkExt, NetworksExt, PidExt, ProcessExt, ProcessRefreshKind, System, SystemExt,
    UserExt,
};
#[cfg(target_os = "linux")]
use tracing::debug;

/// `HostFacts` backed by a long-lived `sysinfo::System`, with `/proc` reads
/// for the counters `sysinfo` does not expose.
pub struct SysinfoFacts {
    system: Mutex<System>,
    proc_root: PathBuf,
}

impl SysinfoFacts {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        let mut system = System::new_all();
        system.refresh_users_list();
        Self {
            system: Mutex::new(system),
            proc_root: proc_root.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(target_os = "linux")]
    fn read_proc(&self, name: &str) -> Result<String, FactsError> {
        Ok(fs::read_to_string(self.proc_root.join(name))?)
    }
}

#[cfg(target_os = "linux")]
fn platform_family() -> Option<String> {
    ["/etc/os-release", "/usr/lib/os-release"]
        .iter()
        .find_map(|path| fs::read_to_string(path).ok())
        .and_then(|text| procfs::parse_os_release_family(&text))
}

#[cfg(not(target_os = "linux"))]
fn platform_family() -> Option<String> {
    None
}

impl Default for SysinfoFacts {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl HostFacts for SysinfoFacts {
    fn host_identity(&self) -> Result<HostIdentity, FactsError> {
        let mut system = self.lock();
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_cpu());
        let distribution = system.distribution_id();
        Ok(HostIdentity {
            host_name: system.host_name(),
            os: std::env::consts::OS.to_string(),
            platform: (!distribution.is_empty()).then_some(distribution),
            platform_family: platform_family(),
            platform_version: system.os_version(),
            pretty_distro: system.long_os_version(),
            kernel_arch: std::env::consts::ARCH.to_string(),
            kernel_version: system.kernel_version(),
            uptime_secs: system.uptime(),
            boot_time_unix: system.boot_time(),
            process_count: system.processes().len() as u64,
        })
    }

    fn cpu_models(&self) -> Result<Vec<CpuModel>, FactsError> {
        let mut system = self.lock();
        system.refresh_cpu();
        let models: Vec<CpuModel> = system
            .cpus()
            .iter()
            .map(|cpu| CpuModel {
                model_name: cpu.brand().trim().to_string(),
                mhz: cpu.frequency() as f64,
            })
            .collect();
        if models.is_empty() {
            return Err(FactsError::Unavailable("cpu model list".to_string()));
        }
        Ok(models)
    }

    fn cpu_count(&self, logical: bool) -> Result<usize, FactsError> {
        let system = self.lock();
        if logical {
            let count = system.cpus().len();
            if count > 0 {
                return Ok(count);
            }
            return std::thread::available_parallelism()
                .map(|n| n.get())
                .map_err(FactsError::from);
        }
        system
            .physical_core_count()
            .ok_or_else(|| FactsError::Unavailable("physical core count".to_string()))
    }

    fn cpu_percent(&self, window: Duration) -> Result<Vec<f64>, FactsError> {
        if !window.is_zero() {
            self.lock().refresh_cpu();
            // sysinfo needs a minimum gap between refreshes to produce a delta.
            std::thread::sleep(window.max(System::MINIMUM_CPU_UPDATE_INTERVAL));
        }
        let mut system = self.lock();
        system.refresh_cpu();
        let per_core: Vec<f64> = system
            .cpus()
            .iter()
            .map(|cpu| f64::from(cpu.cpu_usage()))
            .collect();
        if per_core.is_empty() {
            return Err(FactsError::Unavailable("per-core cpu usage".to_string()));
        }
        Ok(per_core)
    }

    #[cfg(target_os = "linux")]
    fn kernel_cpu_counters(&self) -> Result<String, FactsError> {
        self.read_proc("stat")
    }

    #[cfg(not(target_os = "linux"))]
    fn kernel_cpu_counters(&self) -> Result<String, FactsError> {
        Err(FactsError::Unsupported("kernel cpu counters"))
    }

    fn load_average(&self) -> Result<LoadAverage, FactsError> {
        let load = self.lock().load_average();
        Ok(LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        })
    }

    fn memory(&self) -> Result<MemoryFacts, FactsError> {
        let mut facts = {
            let mut system = self.lock();
            system.refresh_memory();
            MemoryFacts {
                total: system.total_memory(),
                used: system.used_memory(),
                free: system.free_memory(),
                available: system.available_memory(),
                ..MemoryFacts::default()
            }
        };

        #[cfg(target_os = "linux")]
        match self.read_proc("meminfo") {
            Ok(text) => {
                let extras = procfs::parse_meminfo_extras(&text);
                facts.shared = extras.shared;
                facts.cached = extras.cached;
                facts.buffers = extras.buffers;
            }
            Err(err) => debug!(error = %err, "meminfo extras unavailable"),
        }

        if facts.total == 0 {
            return Err(FactsError::Unavailable("memory totals".to_string()));
        }
        Ok(facts)
    }

    fn swap(&self) -> Result<SwapFacts, FactsError> {
        let mut system = self.lock();
        system.refresh_memory();
        Ok(SwapFacts {
            total: system.total_swap(),
            used: system.used_swap(),
            free: system.free_swap(),
        })
    }

    #[cfg(target_os = "linux")]
    fn partitions(&self) -> Result<Vec<PartitionFacts>, FactsError> {
        let text = match self.read_proc("self/mounts") {
            Ok(text) => text,
            Err(err) => {
                debug!(error = %err, "self/mounts unreadable, trying mounts");
                self.read_proc("mounts")?
            }
        };
        Ok(procfs::parse_mounts(&text))
    }

    #[cfg(not(target_os = "linux"))]
    fn partitions(&self) -> Result<Vec<PartitionFacts>, FactsError> {
        let mut system = self.lock();
        system.refresh_disks_list();
        Ok(system
            .disks()
            .iter()
            .map(|d| PartitionFacts {
                device: d.name().to_string_lossy().to_string(),
                mount_point: d.mount_point().to_string_lossy().to_string(),
                fs_type: String::from_utf8_lossy(d.file_system()).to_string(),
            })
            .collect())
    }

    #[cfg(unix)]
    fn disk_usage(&self, mount_point: &str) -> Result<UsageFacts, FactsError> {
        statvfs_usage(mount_point)
    }

    #[cfg(not(unix))]
    fn disk_usage(&self, mount_point: &str) -> Result<UsageFacts, FactsError> {
        let mut system = self.lock();
        system.refresh_disks_list();
        let disk = system
            .disks()
            .iter()
            .find(|d| d.mount_point().to_string_lossy() == mount_point)
            .ok_or_else(|| FactsError::Unavailable(format!("disk at {mount_point}")))?;
        let total = disk.total_space();
        let free = disk.available_space();
        let used = total.saturating_sub(free);
        Ok(UsageFacts {
            total,
            free,
            used,
            used_percent: percent_of(used, used + free),
            ..UsageFacts::default()
        })
    }

    #[cfg(target_os = "linux")]
    fn disk_io_counters(&self) -> Result<Vec<DiskIoFacts>, FactsError> {
        Ok(procfs::parse_diskstats(&self.read_proc("diskstats")?))
    }

    #[cfg(not(target_os = "linux"))]
    fn disk_io_counters(&self) -> Result<Vec<DiskIoFacts>, FactsError> {
        Err(FactsError::Unsupported("disk io counters"))
    }

    fn network_counters(&self) -> Result<Vec<NetworkFacts>, FactsError> {
        let mut system = self.lock();
        system.refresh_networks_list();
        let mut out: Vec<NetworkFacts> = system
            .networks()
            .iter()
            .map(|(iface, data)| NetworkFacts {
                name: iface.to_string(),
                bytes_sent: data.total_transmitted(),
                bytes_recv: data.total_received(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn processes(&self) -> Result<Vec<ProcessFacts>, FactsError> {
        let mut system = self.lock();
        system.refresh_memory();
        system.refresh_processes();
        system.refresh_users_list();
        let total_memory = system.total_memory();

        let out: Vec<ProcessFacts> = system
            .processes()
            .values()
            .map(|process| {
                let user = process
                    .user_id()
                    .and_then(|uid| system.get_user_by_id(uid))
                    .map(|u| u.name().to_string());
                ProcessFacts {
                    pid: process.pid().as_u32(),
                    name: Some(process.name().to_string()),
                    cmdline: Some(process.cmd().join(" ")),
                    user,
                    cpu_percent: Some(f64::from(process.cpu_usage())),
                    memory_rss: Some(process.memory()),
                    memory_percent: Some(percent_of(process.memory(), total_memory)),
                }
            })
            .collect();
        if out.is_empty() {
            return Err(FactsError::Unavailable("process list".to_string()));
        }
        Ok(out)
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn statvfs_usage(mount_point: &str) -> Result<UsageFacts, FactsError> {
    let stat = nix::sys::statvfs::statvfs(mount_point).map_err(std::io::Error::from)?;
    let fragment = stat.fragment_size() as u64;
    let block = if fragment > 0 {
        fragment
    } else {
        stat.block_size() as u64
    };
    let blocks = stat.blocks() as u64;
    let total = blocks.saturating_mul(block);
    let free = (stat.blocks_available() as u64).saturating_mul(block);
    let used = blocks
        .saturating_sub(stat.blocks_free() as u64)
        .saturating_mul(block);
    let inodes_total = stat.files() as u64;
    let inodes_free = stat.files_free() as u64;
    let inodes_used = inodes_total.saturating_sub(inodes_free);
    Ok(UsageFacts {
        total,
        free,
        used,
        used_percent: percent_of(used, used + free),
        inodes_total,
        inodes_used,
        inodes_free,
        inodes_used_percent: percent_of(inodes_used, inodes_total),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_host_reports_logical_cores() {
        let facts = SysinfoFacts::default();
        let logical = facts.cpu_count(true).expect("logical core count");
        assert!(logical >= 1);
    }

    #[test]
    fn live_host_network_counters_are_sorted() {
        let facts = SysinfoFacts::default();
        let nets = facts.network_counters().expect("network counters");
        let names: Vec<&str> = nets.iter().map(|n| n.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[cfg(unix)]
    #[test]
    fn statvfs_on_root_is_consistent() {
        let usage = statvfs_usage("/").expect("statvfs /");
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
        assert!((0.0..=100.0).contains(&usage.used_percent));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn missing_proc_root_degrades_to_errors() {
        let facts = SysinfoFacts::new("/nonexistent/proc-root-12345");
        assert!(facts.kernel_cpu_counters().is_err());
        assert!(facts.disk_io_counters().is_err());
        assert!(facts.partitions().is_err());
    }
}
