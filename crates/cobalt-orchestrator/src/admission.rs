//! Admission control.
//!
//! Checked before every dequeue. A job is only ever refused before it starts;
//! nothing is preempted once running. A failed or slow resource probe admits.

use crate::config::AdmissionConfig;
use crate::metrics::{MetricsCollector, ResourceUsage};
use crate::queue::JobQueue;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admit,
    AtCapacity { running: usize, max: usize },
    ResourcePressure { resource: &'static str, value: f64, ceiling: f64 },
}

impl AdmissionDecision {
    #[must_use]
    pub const fn is_admit(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

impl fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admit => f.write_str("admit"),
            Self::AtCapacity { running, max } => write!(f, "at capacity ({running}/{max} running)"),
            Self::ResourcePressure { resource, value, ceiling } => {
                write!(f, "{resource} at {value:.1}% exceeds ceiling {ceiling:.1}%")
            }
        }
    }
}

#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    queue: Arc<JobQueue>,
    metrics: Arc<MetricsCollector>,
}

impl AdmissionController {
    #[must_use]
    pub const fn new(config: AdmissionConfig, queue: Arc<JobQueue>, metrics: Arc<MetricsCollector>) -> Self {
        Self { config, queue, metrics }
    }

    pub async fn can_admit(&self) -> bool {
        self.check().await.is_admit()
    }

    /// Concurrency first, counting retry reservations, then a bounded
    /// resource probe.
    pub async fn check(&self) -> AdmissionDecision {
        let running = self.queue.occupied_count();
        let max = self.queue.max_concurrent();
        if running >= max {
            return AdmissionDecision::AtCapacity { running, max };
        }

        match self.metrics.probe().await {
            Ok(usage) => self.evaluate(&usage),
            Err(e) => {
                warn!(error = %e, "Resource probe failed, admitting anyway");
                AdmissionDecision::Admit
            }
        }
    }

    fn evaluate(&self, usage: &ResourceUsage) -> AdmissionDecision {
        let checks = [
            ("cpu", usage.cpu_percent, self.config.cpu_ceiling),
            ("memory", usage.memory_percent, self.config.memory_ceiling),
            ("disk", usage.disk_percent, self.config.disk_ceiling),
        ];
        for (resource, value, ceiling) in checks {
            if value > ceiling {
                debug!(resource, value, ceiling, "Admission denied");
                return AdmissionDecision::ResourcePressure { resource, value, ceiling };
            }
        }
        AdmissionDecision::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StaticProbe;
    use cobalt_training::JobId;
    use std::time::Duration;

    fn controller(max: usize) -> (AdmissionController, Arc<StaticProbe>, Arc<JobQueue>) {
        let probe = Arc::new(StaticProbe::idle());
        let metrics = Arc::new(MetricsCollector::new(probe.clone(), Duration::from_millis(200), 8, 8));
        let queue = Arc::new(JobQueue::new(max));
        (AdmissionController::new(AdmissionConfig::default(), Arc::clone(&queue), metrics), probe, queue)
    }

    #[tokio::test]
    async fn test_admits_when_idle() {
        let (admission, _, _) = controller(2);
        assert!(admission.can_admit().await);
    }

    #[tokio::test]
    async fn test_denies_at_capacity() {
        let (admission, _, queue) = controller(1);
        let _slot = queue.try_acquire_slot(&JobId::from("a")).unwrap();
        assert_eq!(admission.check().await, AdmissionDecision::AtCapacity { running: 1, max: 1 });
    }

    #[tokio::test]
    async fn test_retry_reservation_counts_toward_capacity() {
        let (admission, _, queue) = controller(1);
        let reservation = queue.reserve(&JobId::from("backing-off"));
        assert_eq!(admission.check().await, AdmissionDecision::AtCapacity { running: 1, max: 1 });
        drop(reservation);
        assert!(admission.can_admit().await);
    }

    #[tokio::test]
    async fn test_denies_each_resource_over_ceiling() {
        let (admission, probe, _) = controller(2);
        for (usage, resource) in [
            (ResourceUsage::new(95.0, 10.0, 10.0), "cpu"),
            (ResourceUsage::new(10.0, 86.0, 10.0), "memory"),
            (ResourceUsage::new(10.0, 10.0, 91.0), "disk"),
        ] {
            probe.set_usage(usage);
            match admission.check().await {
                AdmissionDecision::ResourcePressure { resource: r, .. } => assert_eq!(r, resource),
                other => panic!("expected pressure on {resource}, got {other:?}"),
            }
        }

        // exactly at the ceiling is still fine
        probe.set_usage(ResourceUsage::new(90.0, 85.0, 90.0));
        assert!(admission.can_admit().await);
    }

    #[tokio::test]
    async fn test_fails_open_on_probe_error() {
        let (admission, probe, _) = controller(2);
        probe.set_failing("no /proc");
        assert!(admission.can_admit().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_open_on_probe_timeout() {
        let (admission, probe, _) = controller(2);
        probe.set_delay(Duration::from_secs(30));
        assert!(admission.can_admit().await);
    }
}
