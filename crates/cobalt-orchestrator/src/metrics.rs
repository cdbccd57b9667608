//! Resource probing and bounded metric history.
//!
//! The monitor loop is the only writer of system samples; workers write job
//! samples through the progress path. Readers always get copies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cobalt_training::{JobId, ProgressUpdate};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to read {path}: {source}")]
    Read { path: &'static str, source: std::io::Error },

    #[error("unexpected format in {0}")]
    Parse(&'static str),

    #[error("disk usage probe failed: {0}")]
    Disk(String),

    #[error("resource probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("resource probe unavailable: {0}")]
    Unavailable(String),
}

/// Point-in-time resource usage, all values in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub accelerator_memory_used: Option<u64>,
}

impl ResourceUsage {
    #[must_use]
    pub const fn new(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self { cpu_percent, memory_percent, disk_percent, accelerator_memory_used: None }
    }
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> Result<ResourceUsage, ProbeError>;
}

/// Reads `/proc` and `statvfs` on Linux.
///
/// CPU usage is the busy share since the previous call (since boot on the
/// first call). Disk usage is measured on the volume holding `disk_path`.
#[derive(Debug)]
pub struct ProcResourceProbe {
    disk_path: PathBuf,
    last_cpu: Mutex<Option<CpuTimes>>,
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

impl ProcResourceProbe {
    #[must_use]
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self { disk_path: disk_path.into(), last_cpu: Mutex::new(None) }
    }

    fn cpu_percent(&self) -> Result<f64, ProbeError> {
        let stat = read_proc("/proc/stat")?;
        let current = parse_cpu_times(&stat).ok_or(ProbeError::Parse("/proc/stat"))?;
        let previous = self.last_cpu.lock().replace(current);
        let (total, idle) = match previous {
            Some(prev) => {
                (current.total.saturating_sub(prev.total), current.idle.saturating_sub(prev.idle))
            }
            None => (current.total, current.idle),
        };
        if total == 0 {
            return Ok(0.0);
        }
        Ok((total.saturating_sub(idle)) as f64 / total as f64 * 100.0)
    }

    #[cfg(unix)]
    fn disk_percent(&self) -> Result<f64, ProbeError> {
        let mut path = self.disk_path.as_path();
        // the checkpoint root may not exist yet
        while !path.exists() {
            path = path.parent().ok_or_else(|| ProbeError::Disk("no existing ancestor".into()))?;
            if path.as_os_str().is_empty() {
                path = std::path::Path::new(".");
            }
        }
        let stat = nix::sys::statvfs::statvfs(path).map_err(|e| ProbeError::Disk(e.to_string()))?;
        let blocks = stat.blocks() as f64;
        let free = stat.blocks_free() as f64;
        let available = stat.blocks_available() as f64;
        let used = blocks - free;
        let usable = used + available;
        if usable <= 0.0 {
            return Ok(0.0);
        }
        Ok(used / usable * 100.0)
    }

    #[cfg(not(unix))]
    fn disk_percent(&self) -> Result<f64, ProbeError> {
        Err(ProbeError::Unavailable(format!("statvfs on {}", self.disk_path.display())))
    }
}

#[async_trait]
impl ResourceProbe for ProcResourceProbe {
    async fn sample(&self) -> Result<ResourceUsage, ProbeError> {
        let cpu = self.cpu_percent()?;
        let meminfo = read_proc("/proc/meminfo")?;
        let memory = parse_memory_percent(&meminfo).ok_or(ProbeError::Parse("/proc/meminfo"))?;
        let disk = self.disk_percent()?;
        Ok(ResourceUsage::new(cpu, memory, disk))
    }
}

fn read_proc(path: &'static str) -> Result<String, ProbeError> {
    std::fs::read_to_string(path).map_err(|source| ProbeError::Read { path, source })
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let values: Vec<u64> =
        line.split_whitespace().skip(1).map(str::parse).collect::<Result<_, _>>().ok()?;
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes { total: values.iter().sum(), idle })
}

fn parse_memory_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse::<u64>().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    if total == 0 {
        return None;
    }
    Some((1.0 - available as f64 / total as f64) * 100.0)
}

/// Probe returning whatever it was last told to, for tests and embedding.
#[derive(Debug)]
pub struct StaticProbe {
    state: Mutex<StaticState>,
}

#[derive(Debug)]
struct StaticState {
    reading: Result<ResourceUsage, String>,
    delay: Duration,
}

impl StaticProbe {
    #[must_use]
    pub fn new(usage: ResourceUsage) -> Self {
        Self { state: Mutex::new(StaticState { reading: Ok(usage), delay: Duration::ZERO }) }
    }

    /// A probe reporting an idle machine.
    #[must_use]
    pub fn idle() -> Self {
        Self::new(ResourceUsage::new(5.0, 20.0, 30.0))
    }

    pub fn set_usage(&self, usage: ResourceUsage) {
        self.state.lock().reading = Ok(usage);
    }

    /// Makes every following sample fail with `message`.
    pub fn set_failing(&self, message: impl Into<String>) {
        self.state.lock().reading = Err(message.into());
    }

    /// Delays every following sample.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }
}

#[async_trait]
impl ResourceProbe for StaticProbe {
    async fn sample(&self) -> Result<ResourceUsage, ProbeError> {
        let (reading, delay) = {
            let state = self.state.lock();
            (state.reading.clone(), state.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        reading.map_err(ProbeError::Unavailable)
    }
}

/// Anything carrying a wall-clock timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub accelerator_memory_used: Option<u64>,
}

impl SystemSample {
    #[must_use]
    pub fn from_usage(usage: ResourceUsage) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            disk_percent: usage.disk_percent,
            accelerator_memory_used: usage.accelerator_memory_used,
        }
    }
}

impl Timestamped for SystemSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSample {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub epoch: u32,
    pub step: u64,
    pub total_steps: u64,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub eta_seconds: Option<f64>,
}

impl JobSample {
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.step as f64 / self.total_steps as f64).clamp(0.0, 1.0)
    }
}

impl Timestamped for JobSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Fixed-capacity buffer evicting oldest first.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    evicted: u64,
    last_evicted_at: Option<DateTime<Utc>>,
}

impl<T: Timestamped + Clone> RingBuffer<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { items: VecDeque::with_capacity(capacity), capacity, evicted: 0, last_evicted_at: None }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            if let Some(old) = self.items.pop_front() {
                self.evicted += 1;
                self.last_evicted_at = Some(old.timestamp());
            }
        }
        self.items.push_back(item);
    }

    /// Items at or after `since`, oldest first, plus whether evicted items
    /// would have fallen inside the window.
    #[must_use]
    pub fn window(&self, since: DateTime<Utc>) -> (Vec<T>, bool) {
        let items = self.items.iter().filter(|item| item.timestamp() >= since).cloned().collect();
        let truncated = self.last_evicted_at.is_some_and(|at| at >= since);
        (items, truncated)
    }

    #[must_use]
    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn evicted(&self) -> u64 {
        self.evicted
    }
}

/// Per-job values that forget the job inserted longest ago once `capacity`
/// jobs are tracked.
#[derive(Debug, Clone)]
pub struct BoundedJobMap<V> {
    entries: HashMap<JobId, V>,
    order: VecDeque<JobId>,
    capacity: usize,
}

impl<V> BoundedJobMap<V> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    #[must_use]
    pub fn get(&self, job_id: &JobId) -> Option<&V> {
        self.entries.get(job_id)
    }

    pub fn insert(&mut self, job_id: &JobId, value: V) {
        self.make_room(job_id);
        self.entries.insert(job_id.clone(), value);
    }

    /// The job's value, created with `default` if the job is new.
    pub fn get_or_insert_with(&mut self, job_id: &JobId, default: impl FnOnce() -> V) -> &mut V {
        self.make_room(job_id);
        self.entries.entry(job_id.clone()).or_insert_with(default)
    }

    fn make_room(&mut self, job_id: &JobId) {
        if self.entries.contains_key(job_id) {
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            self.entries.remove(&oldest);
            debug!(job_id = %oldest, "Forgot oldest tracked job");
        }
        self.order.push_back(job_id.clone());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Jobs whose latest sample is kept unless configured otherwise.
pub const DEFAULT_TRACKED_JOBS: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct RateAnchor {
    at: Instant,
    step: u64,
}

pub struct MetricsCollector {
    probe: Arc<dyn ResourceProbe>,
    probe_timeout: Duration,
    system: RwLock<RingBuffer<SystemSample>>,
    jobs: RwLock<RingBuffer<JobSample>>,
    latest: RwLock<BoundedJobMap<JobSample>>,
    anchors: Mutex<HashMap<JobId, RateAnchor>>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        probe_timeout: Duration,
        system_capacity: usize,
        job_capacity: usize,
    ) -> Self {
        Self {
            probe,
            probe_timeout,
            system: RwLock::new(RingBuffer::new(system_capacity)),
            jobs: RwLock::new(RingBuffer::new(job_capacity)),
            latest: RwLock::new(BoundedJobMap::new(DEFAULT_TRACKED_JOBS)),
            anchors: Mutex::new(HashMap::new()),
        }
    }

    /// Caps how many jobs keep a latest sample.
    #[must_use]
    pub fn with_tracked_jobs(self, tracked_jobs: usize) -> Self {
        Self { latest: RwLock::new(BoundedJobMap::new(tracked_jobs)), ..self }
    }

    /// Reads current usage within the probe timeout, without recording it.
    pub async fn probe(&self) -> Result<ResourceUsage, ProbeError> {
        match tokio::time::timeout(self.probe_timeout, self.probe.sample()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.probe_timeout)),
        }
    }

    /// Probes and records a system sample. `None` when the probe fails.
    pub async fn sample_system(&self) -> Option<SystemSample> {
        match self.probe().await {
            Ok(usage) => {
                let sample = SystemSample::from_usage(usage);
                self.system.write().push(sample.clone());
                Some(sample)
            }
            Err(e) => {
                warn!(error = %e, "System metrics sample failed");
                None
            }
        }
    }

    /// Records a progress update; ETA comes from the step rate since the
    /// job's first sample in this run.
    pub fn record_job(&self, job_id: &JobId, update: &ProgressUpdate) -> JobSample {
        let now = Instant::now();
        let eta_seconds = {
            let mut anchors = self.anchors.lock();
            let anchor =
                *anchors.entry(job_id.clone()).or_insert(RateAnchor { at: now, step: update.step });
            let elapsed = now.duration_since(anchor.at).as_secs_f64();
            let done = update.step.saturating_sub(anchor.step);
            (elapsed > 0.0 && done > 0).then(|| {
                let rate = done as f64 / elapsed;
                update.total_steps.saturating_sub(update.step) as f64 / rate
            })
        };

        let sample = JobSample {
            job_id: job_id.clone(),
            timestamp: Utc::now(),
            epoch: update.epoch,
            step: update.step,
            total_steps: update.total_steps,
            train_loss: update.train_loss,
            val_loss: update.val_loss,
            tokens_per_second: update.tokens_per_second,
            eta_seconds,
        };
        self.jobs.write().push(sample.clone());
        self.latest.write().insert(job_id, sample.clone());
        sample
    }

    /// Drops the rate anchor once a run ends. The latest sample is kept.
    pub fn finish_run(&self, job_id: &JobId) {
        if self.anchors.lock().remove(job_id).is_some() {
            debug!(job_id = %job_id, "Cleared job rate anchor");
        }
    }

    #[must_use]
    pub fn latest_system(&self) -> Option<SystemSample> {
        self.system.read().last().cloned()
    }

    #[must_use]
    pub fn latest_job(&self, job_id: &JobId) -> Option<JobSample> {
        self.latest.read().get(job_id).cloned()
    }

    #[must_use]
    pub fn system_history(&self, since: DateTime<Utc>) -> (Vec<SystemSample>, bool) {
        self.system.read().window(since)
    }

    /// Job samples in the window, for one job or all.
    #[must_use]
    pub fn job_history(&self, job_id: Option<&JobId>, since: DateTime<Utc>) -> (Vec<JobSample>, bool) {
        let (mut samples, truncated) = self.jobs.read().window(since);
        if let Some(id) = job_id {
            samples.retain(|sample| &sample.job_id == id);
        }
        (samples, truncated)
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("probe_timeout", &self.probe_timeout)
            .field("system_samples", &self.system.read().len())
            .field("job_samples", &self.jobs.read().len())
            .finish_non_exhaustive()
    }
}
