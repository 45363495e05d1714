//! CPU usage sampling.
//!
//! Usage is derived either from deltas between two cumulative kernel tick
//! snapshots or, when no usable pair exists, from a blocking per-core
//! percentage reading. Results are cached for `fast_refresh` so frequent
//! polling does not resample.

use crate::clock::Clock;
use crate::facts::{CpuModel, FactsError, HostFacts};
use crate::metrics::Metrics;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStat {
    pub idle: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDetailedStat {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
    pub total: u64,
}

/// Cumulative tick counters at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total: CpuStat,
    pub detailed: CpuDetailedStat,
    pub per_core: Vec<CpuStat>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DetailedPercent {
    pub user: f64,
    pub system: f64,
    pub nice: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
}

impl DetailedPercent {
    pub fn idle_only() -> Self {
        Self {
            idle: 100.0,
            ..Self::default()
        }
    }

    /// Fixed 0.6 / 0.3 / 0.1 split of the busy share into user, system and
    /// iowait. An approximation for when no breakdown counters exist.
    pub fn approximate(aggregate: f64) -> Self {
        Self {
            user: aggregate * 0.6,
            system: aggregate * 0.3,
            idle: 100.0 - aggregate,
            iowait: aggregate * 0.1,
            ..Self::default()
        }
        .clamped()
    }

    fn clamped(self) -> Self {
        Self {
            user: clamp_percent(self.user),
            system: clamp_percent(self.system),
            nice: clamp_percent(self.nice),
            idle: clamp_percent(self.idle),
            iowait: clamp_percent(self.iowait),
            irq: clamp_percent(self.irq),
            softirq: clamp_percent(self.softirq),
            steal: clamp_percent(self.steal),
        }
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.user,
            self.system,
            self.nice,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuUsage {
    pub aggregate: f64,
    pub per_core: Vec<f64>,
    pub detailed: DetailedPercent,
}

fn clamp_percent(v: f64) -> f64 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(0.0, 100.0)
}

fn parse_cpu_fields(line: &str) -> Vec<u64> {
    line.split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>().unwrap_or(0))
        .collect()
}

/// idle = idle + iowait, total = every field on the line.
fn idle_and_total(nums: &[u64]) -> CpuStat {
    if nums.len() < 5 {
        return CpuStat::default();
    }
    CpuStat {
        idle: nums[3] + nums[4],
        total: nums.iter().sum(),
    }
}

/// Parses the `cpu` and `cpuN` lines of `/proc/stat`.
pub fn parse_proc_stat(content: &str) -> Option<CounterSnapshot> {
    let mut lines = content.lines();
    let first = lines.next()?;
    if !first.starts_with("cpu ") {
        return None;
    }
    let mut nums = parse_cpu_fields(first);
    if nums.len() < 5 {
        return None;
    }
    let total = idle_and_total(&nums);
    if nums.len() < 10 {
        nums.resize(10, 0);
    }
    let mut detailed = CpuDetailedStat {
        user: nums[0],
        nice: nums[1],
        system: nums[2],
        idle: nums[3],
        iowait: nums[4],
        irq: nums[5],
        softirq: nums[6],
        steal: nums[7],
        guest: nums[8],
        guest_nice: nums[9],
        total: 0,
    };
    // guest time is already accounted inside user and nice
    detailed.total = detailed.user
        + detailed.nice
        + detailed.system
        + detailed.idle
        + detailed.iowait
        + detailed.irq
        + detailed.softirq
        + detailed.steal;

    let per_core = lines
        .filter(|line| {
            line.starts_with("cpu") && line.as_bytes().get(3).is_some_and(u8::is_ascii_digit)
        })
        .map(|line| idle_and_total(&parse_cpu_fields(line)))
        .collect();

    Some(CounterSnapshot {
        total,
        detailed,
        per_core,
    })
}

/// Busy share between two cumulative readings. Zero when no ticks elapsed
/// or the counters went backwards.
pub fn calc_cpu_percent(prev: CpuStat, cur: CpuStat) -> f64 {
    if cur.total <= prev.total {
        return 0.0;
    }
    let delta_total = (cur.total - prev.total) as f64;
    let delta_idle = cur.idle.saturating_sub(prev.idle) as f64;
    clamp_percent((1.0 - delta_idle / delta_total) * 100.0)
}

pub fn calc_cpu_detailed_percent(prev: &CpuDetailedStat, cur: &CpuDetailedStat) -> DetailedPercent {
    if cur.total <= prev.total {
        return DetailedPercent::idle_only();
    }
    let delta_total = (cur.total - prev.total) as f64;
    let share = |c: u64, p: u64| c.saturating_sub(p) as f64 / delta_total * 100.0;
    DetailedPercent {
        user: share(cur.user, prev.user),
        system: share(cur.system, prev.system),
        nice: share(cur.nice, prev.nice),
        idle: share(cur.idle, prev.idle),
        iowait: share(cur.iowait, prev.iowait),
        irq: share(cur.irq, prev.irq),
        softirq: share(cur.softirq, prev.softirq),
        steal: share(cur.steal, prev.steal),
    }
    .clamped()
}

pub fn usage_from_counters(prev: &CounterSnapshot, cur: &CounterSnapshot) -> CpuUsage {
    let per_core = cur
        .per_core
        .iter()
        .enumerate()
        .map(|(i, core)| calc_cpu_percent(prev.per_core.get(i).copied().unwrap_or_default(), *core))
        .collect();
    CpuUsage {
        aggregate: calc_cpu_percent(prev.total, cur.total),
        per_core,
        detailed: calc_cpu_detailed_percent(&prev.detailed, &cur.detailed),
    }
}

fn usage_from_percentages(per_core: Vec<f64>) -> CpuUsage {
    let per_core: Vec<f64> = per_core.into_iter().map(clamp_percent).collect();
    let aggregate = if per_core.is_empty() {
        0.0
    } else {
        per_core.iter().sum::<f64>() / per_core.len() as f64
    };
    CpuUsage {
        aggregate,
        detailed: DetailedPercent::approximate(aggregate),
        per_core,
    }
}

#[derive(Debug, Default)]
struct SamplerState {
    last_counters: Option<CounterSnapshot>,
    last_sample_at: Option<Instant>,
    cached: Option<CpuUsage>,
}

pub struct CpuSampler {
    facts: Arc<dyn HostFacts>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    fast_refresh: Duration,
    sampling_window: Duration,
    state: Mutex<SamplerState>,
}

impl CpuSampler {
    pub fn new(
        facts: Arc<dyn HostFacts>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        fast_refresh: Duration,
        sampling_window: Duration,
    ) -> Self {
        Self {
            facts,
            clock,
            metrics,
            fast_refresh,
            sampling_window,
            state: Mutex::new(SamplerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SamplerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Aggregate, per-core and detailed usage. Served from cache while the
    /// last sample is younger than `fast_refresh`; otherwise resamples,
    /// which may block for the sampling window.
    pub fn get_usage(&self) -> CpuUsage {
        {
            let state = self.lock();
            if let (Some(at), Some(cached)) = (state.last_sample_at, &state.cached) {
                if self.clock.now().saturating_duration_since(at) < self.fast_refresh {
                    self.metrics.inc_cpu_sample("cache");
                    return cached.clone();
                }
            }
        }

        // The lock is not held here: the percentage reading blocks.
        let current = self.read_counters();
        let previous = self.lock().last_counters.clone();

        let usage = match (previous, &current) {
            (Some(prev), Some(cur)) if cur.total.total > prev.total.total => {
                self.metrics.inc_cpu_sample("counters");
                usage_from_counters(&prev, cur)
            }
            _ => match self.facts.cpu_percent(self.sampling_window) {
                Ok(per_core) => {
                    self.metrics.inc_cpu_sample("percent");
                    usage_from_percentages(per_core)
                }
                Err(err) => {
                    warn!(error = %err, "cpu percent query failed");
                    self.metrics.inc_collect_error("cpu_percent");
                    CpuUsage::default()
                }
            },
        };

        let mut state = self.lock();
        state.cached = Some(usage.clone());
        state.last_sample_at = Some(self.clock.now());
        // Only kernel readings become the baseline; a failed read keeps the
        // previous one so the next delta spans both intervals.
        if let Some(cur) = current {
            state.last_counters = Some(cur);
        }
        usage
    }

    /// Logical core count from the last sample, falling back to the
    /// available parallelism.
    pub fn core_count(&self) -> usize {
        let state = self.lock();
        match state.cached.as_ref().map(|u| u.per_core.len()) {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    fn read_counters(&self) -> Option<CounterSnapshot> {
        match self.facts.kernel_cpu_counters() {
            Ok(text) => {
                let parsed = parse_proc_stat(&text);
                if parsed.is_none() {
                    debug!("kernel cpu counters unparseable");
                }
                parsed
            }
            Err(err) => {
                debug!(error = %err, "kernel cpu counters unavailable");
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct CpuInfoState {
    models: Option<Vec<CpuModel>>,
    physical_cores: Option<usize>,
    logical_cores: Option<usize>,
}

/// Static CPU metadata, fetched once and kept until a forced refresh.
pub struct CpuInfoCache {
    facts: Arc<dyn HostFacts>,
    state: RwLock<CpuInfoState>,
}

impl CpuInfoCache {
    pub fn new(facts: Arc<dyn HostFacts>) -> Self {
        Self {
            facts,
            state: RwLock::new(CpuInfoState::default()),
        }
    }

    pub fn models(&self, force_refresh: bool) -> Result<Vec<CpuModel>, FactsError> {
        if !force_refresh {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(models) = &state.models {
                return Ok(models.clone());
            }
        }
        let models = self.facts.cpu_models()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.models = Some(models.clone());
        Ok(models)
    }

    pub fn physical_cores(&self, force_refresh: bool) -> Result<usize, FactsError> {
        self.cached_count(force_refresh, false)
    }

    pub fn logical_cores(&self, force_refresh: bool) -> Result<usize, FactsError> {
        self.cached_count(force_refresh, true)
    }

    fn cached_count(&self, force_refresh: bool, logical: bool) -> Result<usize, FactsError> {
        if !force_refresh {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let cached = if logical {
                state.logical_cores
            } else {
                state.physical_cores
            };
            if let Some(n) = cached.filter(|n| *n > 0) {
                return Ok(n);
            }
        }
        let count = self.facts.cpu_count(logical)?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if logical {
            state.logical_cores = Some(count);
        } else {
            state.physical_cores = Some(count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::facts::fake::FakeFacts;
    use proptest::prelude::*;
    use std::sync::atomic::Ordering;

    const STAT_A: &str = "\
cpu  100 0 50 800 50 0 0 0 0 0
cpu0 50 0 25 400 25 0 0 0 0 0
cpu1 50 0 25 400 25 0 0 0 0 0
intr 12345
ctxt 999
";
    const STAT_B: &str = "\
cpu  200 0 100 1100 100 0 0 0 0 0
cpu0 150 0 50 500 50 0 0 0 0 0
cpu1 50 0 50 600 50 0 0 0 0 0
intr 12400
";

    fn sampler(facts: Arc<FakeFacts>, clock: Arc<ManualClock>) -> CpuSampler {
        CpuSampler::new(
            facts,
            clock,
            Metrics::new().unwrap(),
            Duration::from_secs(3),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn half_idle_delta_is_fifty_percent() {
        let prev = CpuStat {
            idle: 100,
            total: 200,
        };
        let cur = CpuStat {
            idle: 150,
            total: 300,
        };
        assert_eq!(calc_cpu_percent(prev, cur), 50.0);
    }

    #[test]
    fn zero_elapsed_ticks_is_zero_percent() {
        let s = CpuStat {
            idle: 10,
            total: 20,
        };
        assert_eq!(calc_cpu_percent(s, s), 0.0);
    }

    #[test]
    fn detailed_degenerate_case_is_all_idle() {
        let s = CpuDetailedStat {
            user: 5,
            total: 100,
            ..CpuDetailedStat::default()
        };
        assert_eq!(calc_cpu_detailed_percent(&s, &s), DetailedPercent::idle_only());
    }

    #[test]
    fn proc_stat_parsing() {
        let snap = parse_proc_stat(STAT_A).expect("parse");
        assert_eq!(snap.total, CpuStat { idle: 850, total: 1000 });
        assert_eq!(snap.per_core.len(), 2);
        assert_eq!(snap.per_core[0], CpuStat { idle: 425, total: 500 });
        assert_eq!(snap.detailed.user, 100);
        assert_eq!(snap.detailed.system, 50);
        assert_eq!(snap.detailed.total, 1000);
    }

    #[test]
    fn proc_stat_short_line_is_padded() {
        let snap = parse_proc_stat("cpu 10 0 10 70 10\n").expect("parse");
        assert_eq!(snap.total, CpuStat { idle: 80, total: 100 });
        assert_eq!(snap.detailed.steal, 0);
        assert!(snap.per_core.is_empty());
    }

    #[test]
    fn proc_stat_rejects_garbage() {
        assert!(parse_proc_stat("").is_none());
        assert!(parse_proc_stat("intr 1 2 3\n").is_none());
        assert!(parse_proc_stat("cpu 1 2\n").is_none());
    }

    #[test]
    fn counter_deltas_give_breakdown() {
        let a = parse_proc_stat(STAT_A).unwrap();
        let b = parse_proc_stat(STAT_B).unwrap();
        let usage = usage_from_counters(&a, &b);
        // 500 ticks elapsed, 350 of them idle+iowait
        assert!((usage.aggregate - 30.0).abs() < 1e-9);
        assert!((usage.per_core[0] - 50.0).abs() < 1e-9);
        assert!((usage.per_core[1] - 10.0).abs() < 1e-9);
        assert!((usage.detailed.user - 20.0).abs() < 1e-9);
        assert!((usage.detailed.system - 10.0).abs() < 1e-9);
        assert!((usage.detailed.idle - 60.0).abs() < 1e-9);
        assert!((usage.detailed.iowait - 10.0).abs() < 1e-9);
    }

    #[test]
    fn approximation_splits_busy_share() {
        let expected = [30.0, 15.0, 0.0, 50.0, 5.0, 0.0, 0.0, 0.0];
        let got = DetailedPercent::approximate(50.0).to_vec();
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-9, "{got:?}");
        }
    }

    #[test]
    fn cached_usage_is_reused_within_fast_refresh() {
        let facts = Arc::new(FakeFacts::default());
        facts.push_cpu_percent(vec![10.0, 30.0]);
        facts.push_cpu_percent(vec![90.0, 90.0]);
        let clock = Arc::new(ManualClock::new());
        let sampler = sampler(facts.clone(), clock.clone());

        let first = sampler.get_usage();
        clock.advance(Duration::from_millis(2999));
        let second = sampler.get_usage();

        assert_eq!(first, second);
        assert_eq!(first.aggregate, 20.0);
        assert_eq!(facts.cpu_percent_calls(), 1);
    }

    #[test]
    fn expired_cache_triggers_fresh_query() {
        let facts = Arc::new(FakeFacts::default());
        facts.push_cpu_percent(vec![10.0, 30.0]);
        facts.push_cpu_percent(vec![90.0, 70.0]);
        let clock = Arc::new(ManualClock::new());
        let sampler = sampler(facts.clone(), clock.clone());

        sampler.get_usage();
        clock.advance(Duration::from_secs(3));
        let usage = sampler.get_usage();

        assert_eq!(facts.cpu_percent_calls(), 2);
        assert_eq!(usage.aggregate, 80.0);
        assert_eq!(usage.per_core, vec![90.0, 70.0]);
    }

    #[test]
    fn kernel_counters_preferred_once_baseline_exists() {
        let facts = Arc::new(FakeFacts::default());
        facts.push_kernel_counters(STAT_A);
        facts.push_cpu_percent(vec![55.0, 55.0]);
        facts.push_kernel_counters(STAT_B);
        let clock = Arc::new(ManualClock::new());
        let sampler = sampler(facts.clone(), clock.clone());

        let first = sampler.get_usage();
        assert_eq!(first.aggregate, 55.0);
        clock.advance(Duration::from_secs(5));
        let second = sampler.get_usage();

        assert_eq!(facts.cpu_percent_calls(), 1);
        assert!((second.aggregate - 30.0).abs() < 1e-9);
        assert!((second.detailed.user - 20.0).abs() < 1e-9);
    }

    #[test]
    fn failed_query_degrades_to_zero() {
        let facts = Arc::new(FakeFacts::default());
        let clock = Arc::new(ManualClock::new());
        let sampler = sampler(facts, clock);
        let usage = sampler.get_usage();
        assert_eq!(usage, CpuUsage::default());
    }

    #[test]
    fn failed_counter_read_keeps_kernel_baseline() {
        let facts = Arc::new(FakeFacts::default());
        facts.push_kernel_counters("cpu 100 0 0 100 0\n");
        facts.push_cpu_percent(vec![10.0]);
        facts.push_kernel_counters("cpu 200 0 0 100 0\n");
        facts.push_kernel_counters_failure();
        facts.push_cpu_percent(vec![100.0]);
        facts.push_kernel_counters("cpu 300 0 0 100 0\n");
        let clock = Arc::new(ManualClock::new());
        let sampler = sampler(facts.clone(), clock.clone());

        sampler.get_usage();
        clock.advance(Duration::from_secs(5));
        assert_eq!(sampler.get_usage().aggregate, 100.0);
        clock.advance(Duration::from_secs(5));
        assert_eq!(sampler.get_usage().aggregate, 100.0);
        clock.advance(Duration::from_secs(5));
        let recovered = sampler.get_usage();

        assert_eq!(recovered.aggregate, 100.0);
        assert_eq!(facts.cpu_percent_calls(), 2);
    }

    #[test]
    fn lock_released_while_percent_reading_blocks() {
        let facts = Arc::new(FakeFacts {
            cpu_percent_delay: Some(Duration::from_millis(600)),
            ..FakeFacts::default()
        });
        facts.push_cpu_percent(vec![10.0, 20.0]);
        let sampler = Arc::new(sampler(facts.clone(), Arc::new(ManualClock::new())));

        let refreshing = {
            let sampler = Arc::clone(&sampler);
            std::thread::spawn(move || sampler.get_usage())
        };
        while facts.cpu_percent_calls() == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        let started = Instant::now();
        let cores = sampler.core_count();

        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(cores >= 1);
        assert_eq!(refreshing.join().unwrap().aggregate, 15.0);
    }

    #[test]
    fn core_count_follows_last_sample() {
        let facts = Arc::new(FakeFacts::default());
        facts.push_cpu_percent(vec![1.0, 2.0, 3.0]);
        let sampler = sampler(facts, Arc::new(ManualClock::new()));
        sampler.get_usage();
        assert_eq!(sampler.core_count(), 3);
    }

    #[test]
    fn info_cache_fetches_once_until_forced() {
        let facts = Arc::new(FakeFacts {
            cpu_models: Some(vec![CpuModel {
                model_name: "Test CPU".to_string(),
                mhz: 2400.0,
            }]),
            physical_cores: Some(4),
            logical_cores: Some(8),
            ..FakeFacts::default()
        });
        let cache = CpuInfoCache::new(facts.clone());

        cache.models(false).unwrap();
        cache.models(false).unwrap();
        assert_eq!(facts.cpu_models_calls.load(Ordering::SeqCst), 1);
        cache.models(true).unwrap();
        assert_eq!(facts.cpu_models_calls.load(Ordering::SeqCst), 2);

        assert_eq!(cache.physical_cores(false).unwrap(), 4);
        assert_eq!(cache.logical_cores(false).unwrap(), 8);
    }

    #[test]
    fn info_cache_propagates_failure_without_caching() {
        let cache = CpuInfoCache::new(Arc::new(FakeFacts::default()));
        assert!(cache.models(false).is_err());
        assert!(cache.physical_cores(false).is_err());
    }

    proptest! {
        #[test]
        fn non_advancing_counters_give_zero(
            prev_idle in 0u64..1_000_000,
            prev_total in 0u64..1_000_000,
            cur_idle in 0u64..1_000_000,
            back in 0u64..1_000_000,
        ) {
            let prev = CpuStat { idle: prev_idle, total: prev_total };
            let cur = CpuStat { idle: cur_idle, total: prev_total.saturating_sub(back) };
            prop_assert_eq!(calc_cpu_percent(prev, cur), 0.0);
        }

        #[test]
        fn advancing_counters_stay_in_range(
            prev_idle in 0u64..1_000_000,
            extra in 0u64..1_000_000,
            d_total in 1u64..1_000_000,
            idle_frac in 0.0f64..=1.0,
        ) {
            let prev = CpuStat { idle: prev_idle, total: prev_idle + extra };
            let d_idle = (d_total as f64 * idle_frac) as u64;
            let cur = CpuStat { idle: prev.idle + d_idle, total: prev.total + d_total };
            let p = calc_cpu_percent(prev, cur);
            prop_assert!((0.0..=100.0).contains(&p));
        }

        #[test]
        fn approximation_stays_in_range(aggregate in -10.0f64..110.0) {
            for v in DetailedPercent::approximate(aggregate).to_vec() {
                prop_assert!((0.0..=100.0).contains(&v));
            }
        }
    }
}
