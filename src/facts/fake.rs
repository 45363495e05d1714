use crate::facts::{
    CpuModel, DiskIoFacts, FactsError, HostFacts, HostIdentity, LoadAverage, MemoryFacts,
    NetworkFacts, PartitionFacts, ProcessFacts, SwapFacts, UsageFacts,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted usage answer for one mount.
#[derive(Debug, Clone)]
pub struct FakeUsage {
    pub result: Result<UsageFacts, String>,
    pub delay: Option<Duration>,
}

impl FakeUsage {
    pub fn immediate(usage: UsageFacts) -> Self {
        Self {
            result: Ok(usage),
            delay: None,
        }
    }

    pub fn delayed(usage: UsageFacts, delay: Duration) -> Self {
        Self {
            result: Ok(usage),
            delay: Some(delay),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
            delay: None,
        }
    }
}

/// Minimal fake host used in tests. Every field is an `Option`; `None`
/// makes the matching query fail.
#[derive(Default)]
pub struct FakeFacts {
    pub identity: Option<HostIdentity>,
    pub cpu_models: Option<Vec<CpuModel>>,
    pub physical_cores: Option<usize>,
    pub logical_cores: Option<usize>,
    pub cpu_percent_script: Mutex<VecDeque<Vec<f64>>>,
    /// `None` entries make that read fail.
    pub kernel_counters_script: Mutex<VecDeque<Option<String>>>,
    /// Blocks every `cpu_percent` call this long.
    pub cpu_percent_delay: Option<Duration>,
    pub load: Option<LoadAverage>,
    pub memory: Option<MemoryFacts>,
    pub swap: Option<SwapFacts>,
    pub partitions: Option<Vec<PartitionFacts>>,
    pub usage: HashMap<String, FakeUsage>,
    pub disk_io: Option<Vec<DiskIoFacts>>,
    pub networks: Option<Vec<NetworkFacts>>,
    pub processes: Option<Vec<ProcessFacts>>,
    pub cpu_percent_calls: AtomicUsize,
    pub cpu_models_calls: AtomicUsize,
    pub usage_calls: AtomicUsize,
}

impl FakeFacts {
    pub fn push_cpu_percent(&self, per_core: Vec<f64>) {
        self.cpu_percent_script.lock().unwrap().push_back(per_core);
    }

    pub fn push_kernel_counters(&self, text: &str) {
        self.kernel_counters_script
            .lock()
            .unwrap()
            .push_back(Some(text.to_string()));
    }

    pub fn push_kernel_counters_failure(&self) {
        self.kernel_counters_script.lock().unwrap().push_back(None);
    }

    pub fn cpu_percent_calls(&self) -> usize {
        self.cpu_percent_calls.load(Ordering::SeqCst)
    }
}

fn missing(what: &str) -> FactsError {
    FactsError::Unavailable(format!("fake {what}"))
}

impl HostFacts for FakeFacts {
    fn host_identity(&self) -> Result<HostIdentity, FactsError> {
        self.identity.clone().ok_or_else(|| missing("identity"))
    }

    fn cpu_models(&self) -> Result<Vec<CpuModel>, FactsError> {
        self.cpu_models_calls.fetch_add(1, Ordering::SeqCst);
        self.cpu_models.clone().ok_or_else(|| missing("cpu models"))
    }

    fn cpu_count(&self, logical: bool) -> Result<usize, FactsError> {
        let count = if logical {
            self.logical_cores
        } else {
            self.physical_cores
        };
        count.ok_or_else(|| missing("cpu count"))
    }

    fn cpu_percent(&self, _window: Duration) -> Result<Vec<f64>, FactsError> {
        self.cpu_percent_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.cpu_percent_delay {
            std::thread::sleep(delay);
        }
        self.cpu_percent_script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| missing("cpu percent"))
    }

    fn kernel_cpu_counters(&self) -> Result<String, FactsError> {
        self.kernel_counters_script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(FactsError::Unsupported("fake kernel counters"))?
            .ok_or_else(|| missing("kernel counters"))
    }

    fn load_average(&self) -> Result<LoadAverage, FactsError> {
        self.load.ok_or_else(|| missing("load"))
    }

    fn memory(&self) -> Result<MemoryFacts, FactsError> {
        self.memory.ok_or_else(|| missing("memory"))
    }

    fn swap(&self) -> Result<SwapFacts, FactsError> {
        self.swap.ok_or_else(|| missing("swap"))
    }

    fn partitions(&self) -> Result<Vec<PartitionFacts>, FactsError> {
        self.partitions.clone().ok_or_else(|| missing("partitions"))
    }

    fn disk_usage(&self, mount_point: &str) -> Result<UsageFacts, FactsError> {
        self.usage_calls.fetch_add(1, Ordering::SeqCst);
        let entry = self
            .usage
            .get(mount_point)
            .ok_or_else(|| missing("usage"))?;
        if let Some(delay) = entry.delay {
            std::thread::sleep(delay);
        }
        entry.result.clone().map_err(FactsError::Unavailable)
    }

    fn disk_io_counters(&self) -> Result<Vec<DiskIoFacts>, FactsError> {
        self.disk_io.clone().ok_or_else(|| missing("disk io"))
    }

    fn network_counters(&self) -> Result<Vec<NetworkFacts>, FactsError> {
        self.networks.clone().ok_or_else(|| missing("networks"))
    }

    fn processes(&self) -> Result<Vec<ProcessFacts>, FactsError> {
        self.processes.clone().ok_or_else(|| missing("processes"))
    }
}
