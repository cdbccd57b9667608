//! Orchestrator configuration.
//!
//! Every field has a default, so an empty TOML file is a valid configuration.
//! Sections map one-to-one onto the components they tune.

use crate::error::{OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cobalt.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    pub admission: AdmissionConfig,
    pub retry: RetryConfig,
    pub checkpoint: CheckpointConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneously running jobs.
    pub max_concurrent: usize,
    /// Back-off after an admission denial.
    pub poll_interval_secs: u64,
    /// How long a single dequeue waits on an empty queue.
    pub dequeue_timeout_ms: u64,
    /// Bounded wait for a running job to acknowledge cancellation.
    pub cancel_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrent: 2, poll_interval_secs: 30, dequeue_timeout_ms: 1000, cancel_timeout_secs: 10 }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub const fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    #[must_use]
    pub const fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }
}

/// Resource ceilings, in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub cpu_ceiling: f64,
    pub memory_ceiling: f64,
    pub disk_ceiling: f64,
    pub probe_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { cpu_ceiling: 90.0, memory_ceiling: 85.0, disk_ceiling: 90.0, probe_timeout_ms: 2000 }
    }
}

impl AdmissionConfig {
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Applied to jobs submitted without an explicit limit.
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_secs: 60, max_delay_secs: 900 }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry_count` (zero-based): `min(max, base * 2^n)`.
    #[must_use]
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1_u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let secs = self.base_delay_secs.saturating_mul(factor).min(self.max_delay_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub root: PathBuf,
    /// Checkpoints kept per job.
    pub retention: usize,
    /// Loaded states kept in memory.
    pub cache_entries: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { root: PathBuf::from(".cobalt/checkpoints"), retention: 5, cache_entries: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_secs: u64,
    pub system_history: usize,
    pub job_history: usize,
    pub alert_history: usize,
    /// No step progress for this long while running raises an error alert.
    pub stagnation_window_secs: u64,
    /// Relative loss change that counts as a swing.
    pub loss_swing_threshold: f64,
    pub cpu_critical: f64,
    pub memory_critical: f64,
    pub disk_critical: f64,
    /// Capacity of the subscriber broadcast channel.
    pub event_buffer: usize,
    /// Jobs that keep a latest sample and recovery records; the oldest is forgotten first.
    pub tracked_jobs: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 10,
            system_history: 720,
            job_history: 2048,
            alert_history: 256,
            stagnation_window_secs: 1800,
            loss_swing_threshold: 0.5,
            cpu_critical: 98.0,
            memory_critical: 95.0,
            disk_critical: 97.0,
            event_buffer: 256,
            tracked_jobs: 1024,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    #[must_use]
    pub const fn stagnation_window(&self) -> Duration {
        Duration::from_secs(self.stagnation_window_secs)
    }
}

impl OrchestratorConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        debug!(path = %path.as_ref().display(), "Loaded orchestrator configuration");
        Ok(config)
    }

    /// Resolves configuration from, in order:
    /// 1. the explicit path, if given (errors propagate)
    /// 2. `./cobalt.toml`, if present
    /// 3. built-in defaults
    pub fn discover_and_load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            return Self::load_from_file(local);
        }
        Ok(Self::default())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| OrchestrationError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(OrchestrationError::Config("scheduler.max_concurrent must be at least 1".into()));
        }
        if self.scheduler.dequeue_timeout_ms == 0 {
            return Err(OrchestrationError::Config("scheduler.dequeue_timeout_ms must be positive".into()));
        }

        let admission = &self.admission;
        for (name, value) in [
            ("admission.cpu_ceiling", admission.cpu_ceiling),
            ("admission.memory_ceiling", admission.memory_ceiling),
            ("admission.disk_ceiling", admission.disk_ceiling),
        ] {
            check_percent(name, value)?;
        }

        let monitor = &self.monitor;
        for (name, critical, warning) in [
            ("monitor.cpu_critical", monitor.cpu_critical, admission.cpu_ceiling),
            ("monitor.memory_critical", monitor.memory_critical, admission.memory_ceiling),
            ("monitor.disk_critical", monitor.disk_critical, admission.disk_ceiling),
        ] {
            check_percent(name, critical)?;
            if critical < warning {
                return Err(OrchestrationError::Config(format!(
                    "{name} ({critical}) must not be below the admission ceiling ({warning})"
                )));
            }
        }

        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            return Err(OrchestrationError::Config("retry.max_delay_secs must be >= retry.base_delay_secs".into()));
        }
        if self.checkpoint.retention == 0 || self.checkpoint.cache_entries == 0 {
            return Err(OrchestrationError::Config(
                "checkpoint.retention and checkpoint.cache_entries must be at least 1".into(),
            ));
        }
        if monitor.system_history == 0
            || monitor.job_history == 0
            || monitor.alert_history == 0
            || monitor.tracked_jobs == 0
        {
            return Err(OrchestrationError::Config("monitor history capacities must be at least 1".into()));
        }
        if monitor.event_buffer == 0 || monitor.sample_interval_secs == 0 {
            return Err(OrchestrationError::Config(
                "monitor.event_buffer and monitor.sample_interval_secs must be positive".into(),
            ));
        }
        if monitor.loss_swing_threshold <= 0.0 {
            return Err(OrchestrationError::Config("monitor.loss_swing_threshold must be positive".into()));
        }
        Ok(())
    }
}

fn check_percent(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(OrchestrationError::Config(format!("{name} must be in (0, 100], got {value}")))
    }
}
