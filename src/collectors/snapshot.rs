//! Snapshot assembly and the engine façade used by the presentation layer.

use crate::clock::Clock;
use crate::collectors::cpu::{CpuInfoCache, CpuSampler, CpuUsage};
use crate::collectors::disk::DiskFanOut;
use crate::collectors::process::{top_k, ProcessMetric};
use crate::config::Config;
use crate::facts::{
    percent_of, CpuModel, DiskIoFacts, FactsError, HostFacts, HostIdentity, LoadAverage, MemoryFacts,
    NetworkFacts, SwapFacts,
};
use crate::metrics::Metrics;
use crate::model::{BaseFacts, DiskUsageRecord, ProcessSample, Snapshot};
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const NO_PROXY: &str = "noProxy";

/// Readings taken straight from the provider, already degraded to zero
/// values where a query failed.
#[derive(Debug, Clone, Default)]
struct HostReadings {
    identity: HostIdentity,
    load: LoadAverage,
    memory: MemoryFacts,
    swap: SwapFacts,
    disk_io: Vec<DiskIoFacts>,
    network: Option<NetworkFacts>,
}

fn or_zero<T: Default>(metrics: &Metrics, source: &str, result: Result<T, FactsError>) -> T {
    result.unwrap_or_else(|err| {
        warn!(source, error = %err, "fact query failed, using zero values");
        metrics.inc_collect_error(source);
        T::default()
    })
}

impl HostReadings {
    fn collect(facts: &dyn HostFacts, metrics: &Metrics) -> Self {
        let networks = or_zero(metrics, "network", facts.network_counters());
        Self {
            identity: or_zero(metrics, "host", facts.host_identity()),
            load: or_zero(metrics, "load_average", facts.load_average()),
            memory: or_zero(metrics, "memory", facts.memory()),
            swap: or_zero(metrics, "swap", facts.swap()),
            disk_io: or_zero(metrics, "disk_io", facts.disk_io_counters()),
            network: networks.into_iter().next(),
        }
    }
}

fn rfc3339(at: SystemTime) -> String {
    humantime::format_rfc3339_seconds(at).to_string()
}

/// `load1 / (cores * 2 * 0.75) * 100`: a saturation heuristic treating 1.5
/// runnable tasks per core as full load. Not a kernel figure.
fn load_usage_percent(load1: f64, cores: usize) -> f64 {
    if cores == 0 {
        return 0.0;
    }
    load1 / (cores as f64 * 2.0 * 0.75) * 100.0
}

fn assemble(
    readings: HostReadings,
    cpu: CpuUsage,
    cores: usize,
    disks: Vec<DiskUsageRecord>,
    captured_at: SystemTime,
) -> Snapshot {
    let HostReadings {
        identity,
        load,
        memory,
        swap,
        disk_io,
        network,
    } = readings;

    let io = disk_io.iter().fold(DiskIoFacts::default(), |acc, d| DiskIoFacts {
        name: acc.name,
        read_count: acc.read_count.saturating_add(d.read_count),
        write_count: acc.write_count.saturating_add(d.write_count),
        read_bytes: acc.read_bytes.saturating_add(d.read_bytes),
        write_bytes: acc.write_bytes.saturating_add(d.write_bytes),
        read_time_ms: acc.read_time_ms.saturating_add(d.read_time_ms),
        write_time_ms: acc.write_time_ms.saturating_add(d.write_time_ms),
    });
    let network = network.unwrap_or_default();
    let boot_time = (identity.boot_time_unix > 0)
        .then(|| rfc3339(UNIX_EPOCH + Duration::from_secs(identity.boot_time_unix)));
    let captured_at_unix = captured_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    Snapshot {
        host_name: identity.host_name,
        uptime_secs: identity.uptime_secs,
        time_since_uptime: boot_time,
        process_count: identity.process_count,

        cpu_used_percent: cpu.aggregate,
        cpu_used: cpu.aggregate * 0.01 * cores as f64,
        cpu_total: cores,
        cpu_detailed_percent: cpu.detailed.to_vec(),
        cpu_percent: cpu.per_core,

        load1: load.one,
        load5: load.five,
        load15: load.fifteen,
        load_usage_percent: load_usage_percent(load.one, cores),

        memory_total: memory.total,
        memory_used: memory.used,
        memory_free: memory.free,
        memory_shared: memory.shared,
        memory_cache: memory.cached.saturating_add(memory.buffers),
        memory_available: memory.available,
        memory_used_percent: percent_of(memory.used, memory.total),

        swap_total: swap.total,
        swap_available: swap.free,
        swap_used: swap.used,
        swap_used_percent: percent_of(swap.used, swap.total),

        disks,

        io_read_bytes: io.read_bytes,
        io_write_bytes: io.write_bytes,
        io_count: io.read_count.saturating_add(io.write_count),
        io_read_time_ms: io.read_time_ms,
        io_write_time_ms: io.write_time_ms,

        net_bytes_sent: network.bytes_sent,
        net_bytes_recv: network.bytes_recv,

        captured_at: rfc3339(captured_at),
        captured_at_unix,
    }
}

/// Local address the kernel would route public traffic from. No packet is
/// sent: connecting a UDP socket only selects the route.
fn outbound_ipv4() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip.to_string()),
        _ => None,
    }
}

fn system_proxy_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["http_proxy", "HTTP_PROXY"]
        .iter()
        .filter_map(|name| lookup(*name))
        .find(|v| !v.trim().is_empty())
        .unwrap_or_else(|| NO_PROXY.to_string())
}

/// Logical cores, falling back to the sampler's view when the count query
/// fails.
fn core_count(cpu_info: &CpuInfoCache, sampler: &CpuSampler) -> usize {
    match cpu_info.logical_cores(false) {
        Ok(n) if n > 0 => n,
        Ok(_) => sampler.core_count(),
        Err(err) => {
            debug!(error = %err, "logical core count unavailable, using sampler");
            sampler.core_count()
        }
    }
}

/// Host facts that change rarely, read once per `get_base_facts` call.
#[derive(Debug, Default)]
struct StaticFacts {
    identity: HostIdentity,
    model: Option<CpuModel>,
    physical_cores: usize,
    ipv4_addr: Option<String>,
}

pub struct Engine {
    facts: Arc<dyn HostFacts>,
    sampler: Arc<CpuSampler>,
    cpu_info: Arc<CpuInfoCache>,
    disks: DiskFanOut,
    config: Config,
    metrics: Arc<Metrics>,
}

impl Engine {
    pub fn new(
        facts: Arc<dyn HostFacts>,
        clock: Arc<dyn Clock>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let sampler = CpuSampler::new(
            Arc::clone(&facts),
            clock,
            Arc::clone(&metrics),
            config.cpu.fast_refresh(),
            config.cpu.sampling_window(),
        );
        Self {
            cpu_info: Arc::new(CpuInfoCache::new(Arc::clone(&facts))),
            sampler: Arc::new(sampler),
            disks: DiskFanOut::new(
                Arc::clone(&facts),
                config.disk.clone(),
                Arc::clone(&metrics),
            ),
            facts,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// One point-in-time aggregate. Never fails; unreadable sources come
    /// back as zero values.
    pub async fn build_snapshot(&self) -> Snapshot {
        let sampler = Arc::clone(&self.sampler);
        let cpu_info = Arc::clone(&self.cpu_info);
        let cpu = async move {
            tokio::task::spawn_blocking(move || {
                let usage = sampler.get_usage();
                (usage, core_count(&cpu_info, &sampler))
            })
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "cpu sampling task failed");
                (CpuUsage::default(), 0)
            })
        };

        let facts = Arc::clone(&self.facts);
        let metrics = Arc::clone(&self.metrics);
        let host = async move {
            tokio::task::spawn_blocking(move || HostReadings::collect(facts.as_ref(), &metrics))
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "host fact task failed");
                    HostReadings::default()
                })
        };

        let ((cpu, cores), readings, disks) = tokio::join!(cpu, host, self.disks.collect());
        let captured_at = SystemTime::now();
        let snapshot = assemble(readings, cpu, cores, disks, captured_at);
        self.metrics
            .record_snapshot(snapshot.captured_at_unix as f64);
        snapshot
    }

    /// Host identity, CPU metadata and network context, with a current
    /// snapshot embedded.
    pub async fn get_base_facts(&self) -> BaseFacts {
        let facts = Arc::clone(&self.facts);
        let cpu_info = Arc::clone(&self.cpu_info);
        let metrics = Arc::clone(&self.metrics);
        let static_facts = tokio::task::spawn_blocking(move || StaticFacts {
            identity: or_zero(&metrics, "host", facts.host_identity()),
            model: or_zero(&metrics, "cpu_info", cpu_info.models(false))
                .into_iter()
                .next(),
            physical_cores: or_zero(&metrics, "cpu_count", cpu_info.physical_cores(false)),
            ipv4_addr: outbound_ipv4(),
        });

        let (static_facts, current) = tokio::join!(static_facts, self.build_snapshot());
        let StaticFacts {
            identity,
            model,
            physical_cores,
            ipv4_addr,
        } = static_facts.unwrap_or_else(|err| {
            warn!(error = %err, "base fact task failed");
            StaticFacts::default()
        });

        BaseFacts {
            host_name: identity.host_name,
            os: identity.os,
            platform: identity.platform,
            platform_family: identity.platform_family,
            platform_version: identity.platform_version,
            pretty_distro: identity.pretty_distro,
            kernel_arch: identity.kernel_arch,
            kernel_version: identity.kernel_version,
            ipv4_addr,
            system_proxy: system_proxy_from(|name| std::env::var(name).ok()),
            cpu_cores: physical_cores,
            cpu_logical_cores: current.cpu_total,
            cpu_model_name: model.as_ref().map(|m| m.model_name.clone()),
            cpu_mhz: model.map(|m| m.mhz).unwrap_or(0.0),
            current,
        }
    }

    pub async fn top_k_by_cpu(&self) -> Vec<ProcessSample> {
        self.top_k(ProcessMetric::Cpu).await
    }

    pub async fn top_k_by_memory(&self) -> Vec<ProcessSample> {
        self.top_k(ProcessMetric::Memory).await
    }

    async fn top_k(&self, metric: ProcessMetric) -> Vec<ProcessSample> {
        let facts = Arc::clone(&self.facts);
        let metrics = Arc::clone(&self.metrics);
        let k = self.config.processes.top_k;
        tokio::task::spawn_blocking(move || top_k(facts.as_ref(), metric, k, &metrics))
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, metric = metric.as_str(), "top-k task failed");
                Vec::new()
            })
    }
}
