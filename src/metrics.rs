use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

/// Counters describing how the collectors themselves behave: which sources
/// degraded, how often the CPU cache was hit, how many mounts timed out.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub collect_errors_total: CounterVec,
    pub disk_query_timeouts_total: Counter,
    pub cpu_samples_total: CounterVec,
    pub processes_skipped_total: CounterVec,
    pub snapshots_total: Counter,
    pub last_snapshot_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let collect_errors_total = CounterVec::new(
            opts!(
                "hoststat_collect_errors_total",
                "Fact queries that failed and were replaced by zero values"
            ),
            &["source"],
        )?;
        let disk_query_timeouts_total = Counter::with_opts(opts!(
            "hoststat_disk_query_timeouts_total",
            "Disk usage queries abandoned after their deadline"
        ))?;
        let cpu_samples_total = CounterVec::new(
            opts!(
                "hoststat_cpu_samples_total",
                "CPU usage requests by how they were served"
            ),
            &["path"],
        )?;
        let processes_skipped_total = CounterVec::new(
            opts!(
                "hoststat_processes_skipped_total",
                "Processes skipped during top-k selection because the metric was unreadable"
            ),
            &["metric"],
        )?;
        let snapshots_total = Counter::with_opts(opts!(
            "hoststat_snapshots_total",
            "Snapshots assembled"
        ))?;
        let last_snapshot_timestamp_seconds = Gauge::with_opts(opts!(
            "hoststat_last_snapshot_timestamp_seconds",
            "Unix time of the last assembled snapshot"
        ))?;

        registry.register(Box::new(collect_errors_total.clone()))?;
        registry.register(Box::new(disk_query_timeouts_total.clone()))?;
        registry.register(Box::new(cpu_samples_total.clone()))?;
        registry.register(Box::new(processes_skipped_total.clone()))?;
        registry.register(Box::new(snapshots_total.clone()))?;
        registry.register(Box::new(last_snapshot_timestamp_seconds.clone()))?;

        Ok(Arc::new(Self {
            registry,
            collect_errors_total,
            disk_query_timeouts_total,
            cpu_samples_total,
            processes_skipped_total,
            snapshots_total,
            last_snapshot_timestamp_seconds,
        }))
    }

    pub fn inc_collect_error(&self, source: &str) {
        self.collect_errors_total.with_label_values(&[source]).inc();
    }

    pub fn inc_disk_timeout(&self) {
        self.disk_query_timeouts_total.inc();
    }

    pub fn inc_cpu_sample(&self, path: &str) {
        self.cpu_samples_total.with_label_values(&[path]).inc();
    }

    pub fn inc_process_skipped(&self, metric: &str) {
        self.processes_skipped_total
            .with_label_values(&[metric])
            .inc();
    }

    pub fn record_snapshot(&self, unix_secs: f64) {
        self.snapshots_total.inc();
        self.last_snapshot_timestamp_seconds.set(unix_secs);
    }

    pub fn encode_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_text_contains_registered_families() {
        let metrics = Metrics::new().expect("metrics init");
        metrics.inc_collect_error("load_average");
        metrics.inc_disk_timeout();
        metrics.inc_cpu_sample("cache");
        metrics.record_snapshot(1_700_000_000.0);

        let text = metrics.encode_metrics().expect("encode");
        assert!(text.contains("hoststat_collect_errors_total{source=\"load_average\"} 1"));
        assert!(text.contains("hoststat_disk_query_timeouts_total 1"));
        assert!(text.contains("hoststat_cpu_samples_total{path=\"cache\"} 1"));
        assert!(text.contains("hoststat_snapshots_total 1"));
    }

    #[test]
    fn separate_instances_do_not_share_state() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.inc_disk_timeout();
        assert_eq!(a.disk_query_timeouts_total.get(), 1.0);
        assert_eq!(b.disk_query_timeouts_total.get(), 0.0);
    }
}
