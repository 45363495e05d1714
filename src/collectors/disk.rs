use crate::config::DiskConfig;
use crate::facts::{HostFacts, PartitionFacts, UsageFacts};
use crate::metrics::Metrics;
use crate::model::DiskUsageRecord;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTarget {
    pub fs_type: String,
    pub mount_point: String,
    pub device: String,
}

impl MountTarget {
    fn identity_record(&self) -> DiskUsageRecord {
        DiskUsageRecord {
            path: self.mount_point.clone(),
            fs_type: self.fs_type.clone(),
            device: self.device.clone(),
            ..DiskUsageRecord::default()
        }
    }

    fn usage_record(&self, usage: UsageFacts) -> DiskUsageRecord {
        DiskUsageRecord {
            total: usage.total,
            free: usage.free,
            used: usage.used,
            used_percent: usage.used_percent,
            inodes_total: usage.inodes_total,
            inodes_used: usage.inodes_used,
            inodes_free: usage.inodes_free,
            inodes_used_percent: usage.inodes_used_percent,
            ..self.identity_record()
        }
    }
}

/// `/run` covers `/run` and `/run/user`, but not `/running`.
fn under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Drops pseudo filesystems, deny-listed paths and mounts nested deeper
/// than `max_mount_segments` (bind-mount loops).
pub fn filter_mounts(partitions: Vec<PartitionFacts>, cfg: &DiskConfig) -> Vec<MountTarget> {
    partitions
        .into_iter()
        .filter(|p| {
            if cfg.excluded_fs_types.iter().any(|t| *t == p.fs_type) {
                return false;
            }
            if cfg
                .excluded_mount_paths
                .iter()
                .any(|prefix| under_prefix(&p.mount_point, prefix))
            {
                return false;
            }
            if p.mount_point.split('/').count() > cfg.max_mount_segments {
                debug!(mount = %p.mount_point, "mount path too deep, skipping");
                return false;
            }
            true
        })
        .map(|p| MountTarget {
            fs_type: p.fs_type,
            mount_point: p.mount_point,
            device: p.device,
        })
        .collect()
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Marks a mount as queried until the blocking call returns, even when the
/// waiting side has already given up on it.
struct InFlightGuard {
    in_flight: InFlight,
    mount: String,
}

impl InFlightGuard {
    /// `None` when an earlier query against `mount` is still running.
    fn acquire(in_flight: &InFlight, mount: &str) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(mount.to_string()) {
            return None;
        }
        Some(Self {
            in_flight: Arc::clone(in_flight),
            mount: mount.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.mount);
    }
}

/// Queries usage of every relevant mount concurrently, each under its own
/// deadline. A mount whose previous query never returned is not queried
/// again until it does, so a hung mount holds at most one blocking thread.
pub struct DiskFanOut {
    facts: Arc<dyn HostFacts>,
    config: DiskConfig,
    metrics: Arc<Metrics>,
    in_flight: InFlight,
}

impl DiskFanOut {
    pub fn new(facts: Arc<dyn HostFacts>, config: DiskConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            facts,
            config,
            metrics,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Usage records sorted by path. Slow, failing or still-hung mounts
    /// come back with identity fields only; an enumeration failure yields
    /// an empty list.
    pub async fn collect(&self) -> Vec<DiskUsageRecord> {
        let partitions = match self.facts.partitions() {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "partition enumeration failed");
                self.metrics.inc_collect_error("partitions");
                return Vec::new();
            }
        };
        let targets = filter_mounts(partitions, &self.config);
        let deadline = self.config.query_timeout();
        let results = Arc::new(Mutex::new(Vec::with_capacity(targets.len())));

        let handles: Vec<JoinHandle<()>> = targets
            .into_iter()
            .map(|target| {
                let facts = Arc::clone(&self.facts);
                let metrics = Arc::clone(&self.metrics);
                let in_flight = Arc::clone(&self.in_flight);
                let results = Arc::clone(&results);
                tokio::spawn(async move {
                    let record = query_target(facts, &in_flight, &target, deadline, &metrics).await;
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(record);
                })
            })
            .collect();

        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "disk fan-out task failed");
            }
        }

        let mut records =
            std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }
}

async fn query_target(
    facts: Arc<dyn HostFacts>,
    in_flight: &InFlight,
    target: &MountTarget,
    deadline: Duration,
    metrics: &Metrics,
) -> DiskUsageRecord {
    let Some(guard) = InFlightGuard::acquire(in_flight, &target.mount_point) else {
        debug!(mount = %target.mount_point, "previous usage query still running, skipping");
        metrics.inc_collect_error("disk_usage_in_flight");
        return target.identity_record();
    };
    let mount = target.mount_point.clone();
    let query = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        facts.disk_usage(&mount)
    });

    // On timeout the blocking query is left to finish on its own.
    match tokio::time::timeout(deadline, query).await {
        Ok(Ok(Ok(usage))) => target.usage_record(usage),
        Ok(Ok(Err(err))) => {
            warn!(mount = %target.mount_point, error = %err, "disk usage query failed");
            metrics.inc_collect_error("disk_usage");
            target.identity_record()
        }
        Ok(Err(err)) => {
            warn!(mount = %target.mount_point, error = %err, "disk usage task failed");
            metrics.inc_collect_error("disk_usage");
            target.identity_record()
        }
        Err(_) => {
            warn!(
                mount = %target.mount_point,
                timeout = %humantime::format_duration(deadline),
                "disk usage query timed out"
            );
            metrics.inc_disk_timeout();
            target.identity_record()
        }
    }
}
