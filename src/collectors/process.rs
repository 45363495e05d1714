use crate::facts::{HostFacts, ProcessFacts};
use crate::metrics::Metrics;
use crate::model::ProcessSample;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tracing::{debug, warn};

/// Up to this many slots the current minimum is found by linear scan.
const LINEAR_SCAN_MAX_K: usize = 16;

/// Substituted for a name, command line or user that could not be read.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMetric {
    Cpu,
    Memory,
}

impl ProcessMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessMetric::Cpu => "cpu",
            ProcessMetric::Memory => "memory",
        }
    }

    /// Ranking key. `None` when the field query failed for this process.
    fn key(self, p: &ProcessFacts) -> Option<f64> {
        let value = match self {
            ProcessMetric::Cpu => p.cpu_percent?,
            ProcessMetric::Memory => p.memory_rss? as f64,
        };
        (!value.is_nan()).then_some(value)
    }
}

struct Ranked<T> {
    value: f64,
    seq: usize,
    item: T,
}

impl<T> Ranked<T> {
    /// Orders by value; among equal values a later encounter ranks lower.
    fn rank(&self, other: &Self) -> Ordering {
        self.value
            .total_cmp(&other.value)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

/// The `k` largest items by `key`, sorted descending. A candidate only
/// displaces the current minimum if it is strictly greater, so ties keep
/// whichever item was seen first.
pub fn select_top_k<T, F>(items: impl IntoIterator<Item = T>, k: usize, key: F) -> Vec<T>
where
    F: Fn(&T) -> f64,
{
    if k == 0 {
        return Vec::new();
    }
    let candidates = items.into_iter().enumerate().map(|(seq, item)| Ranked {
        value: key(&item),
        seq,
        item,
    });

    let mut kept = if k <= LINEAR_SCAN_MAX_K {
        scan_linear(candidates, k)
    } else {
        scan_heap(candidates, k)
    };
    kept.sort_by(|a, b| b.rank(a));
    kept.into_iter().map(|r| r.item).collect()
}

fn scan_linear<T>(candidates: impl Iterator<Item = Ranked<T>>, k: usize) -> Vec<Ranked<T>> {
    let mut set: Vec<Ranked<T>> = Vec::with_capacity(k);
    for candidate in candidates {
        if set.len() < k {
            set.push(candidate);
            continue;
        }
        let mut min_idx = 0;
        for (i, r) in set.iter().enumerate().skip(1) {
            if r.rank(&set[min_idx]) == Ordering::Less {
                min_idx = i;
            }
        }
        if candidate.value > set[min_idx].value {
            set[min_idx] = candidate;
        }
    }
    set
}

fn scan_heap<T>(candidates: impl Iterator<Item = Ranked<T>>, k: usize) -> Vec<Ranked<T>> {
    let mut heap: BinaryHeap<Reverse<Ranked<T>>> = BinaryHeap::with_capacity(k + 1);
    for candidate in candidates {
        if heap.len() < k {
            heap.push(Reverse(candidate));
            continue;
        }
        let admit = heap
            .peek()
            .is_some_and(|Reverse(min)| candidate.value > min.value);
        if admit {
            heap.pop();
            heap.push(Reverse(candidate));
        }
    }
    heap.into_iter().map(|Reverse(r)| r).collect()
}

fn to_sample(p: ProcessFacts) -> ProcessSample {
    ProcessSample {
        pid: p.pid,
        name: p.name.unwrap_or_else(|| UNKNOWN.to_string()),
        cmd: p.cmdline.unwrap_or_else(|| UNKNOWN.to_string()),
        user: p.user.unwrap_or_else(|| UNKNOWN.to_string()),
        cpu_percent: p.cpu_percent.unwrap_or(0.0),
        memory_bytes: p.memory_rss.unwrap_or(0),
        memory_percent: p.memory_percent.unwrap_or(0.0),
    }
}

/// Scans the process list once and returns the `k` heaviest by `metric`.
/// Processes whose metric cannot be read are skipped; an enumeration
/// failure yields an empty list.
pub fn top_k(
    facts: &dyn HostFacts,
    metric: ProcessMetric,
    k: usize,
    metrics: &Metrics,
) -> Vec<ProcessSample> {
    let processes = match facts.processes() {
        Ok(list) => list,
        Err(err) => {
            warn!(error = %err, "process enumeration failed");
            metrics.inc_collect_error("processes");
            return Vec::new();
        }
    };

    let ranked = processes.into_iter().filter_map(|p| match metric.key(&p) {
        Some(value) => Some((value, p)),
        None => {
            debug!(pid = p.pid, metric = metric.as_str(), "process metric unreadable, skipping");
            metrics.inc_process_skipped(metric.as_str());
            None
        }
    });

    select_top_k(ranked, k, |(value, _)| *value)
        .into_iter()
        .map(|(_, p)| to_sample(p))
        .collect()
}
