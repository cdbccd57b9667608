//! Monitor event broadcasting.
//!
//! Subscribers get at-most-once delivery: a lagging or disconnected receiver
//! misses events and there is no replay. Alerts are also kept in a bounded
//! history for later queries.

use crate::anomaly::{AlertEvent, Severity};
use crate::metrics::{JobSample, RingBuffer, SystemSample};
use chrono::{DateTime, Utc};
use cobalt_training::{JobId, JobStatus};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A system resource sample was taken.
    System(SystemSample),
    /// A running job reported progress.
    Job(JobSample),
    /// An alert was raised.
    Alert(AlertEvent),
    /// A job changed status.
    StatusChanged {
        /// Job ID.
        job_id: JobId,
        /// Previous status.
        from: JobStatus,
        /// New status.
        to: JobStatus,
        /// When the change was applied.
        at: DateTime<Utc>,
    },
}

/// Outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMetrics {
    /// Jobs that reached `Completed`.
    pub completed: u64,
    /// Jobs that reached `Failed`.
    pub failed: u64,
    /// Jobs cancelled before running.
    pub cancelled: u64,
    /// Running jobs that were stopped.
    pub stopped: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Alerts raised.
    pub alerts: u64,
}

/// Progress reporter for the orchestrator.
pub struct ProgressReporter {
    /// Broadcast sender for monitor events.
    broadcast_tx: broadcast::Sender<MonitorEvent>,
    /// Outcome counters.
    metrics: Mutex<ProgressMetrics>,
    /// Recent alerts.
    alerts: RwLock<RingBuffer<AlertEvent>>,
}

impl ProgressReporter {
    /// Creates a reporter with the given channel and alert-history capacities.
    #[must_use]
    pub fn new(event_buffer: usize, alert_history: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(event_buffer.max(1));
        Self {
            broadcast_tx,
            metrics: Mutex::new(ProgressMetrics::default()),
            alerts: RwLock::new(RingBuffer::new(alert_history)),
        }
    }

    /// Subscribes to monitor events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Gets the current counters.
    pub fn snapshot(&self) -> ProgressMetrics {
        *self.metrics.lock()
    }

    pub fn emit_system(&self, sample: SystemSample) {
        self.send(MonitorEvent::System(sample));
    }

    pub fn emit_job(&self, sample: JobSample) {
        self.send(MonitorEvent::Job(sample));
    }

    /// Records, logs and broadcasts an alert.
    pub fn emit_alert(&self, alert: AlertEvent) {
        let job_id = alert.job_id.as_ref().map(ToString::to_string).unwrap_or_default();
        match alert.severity {
            Severity::Warning => warn!(job_id = %job_id, details = %alert.details, "{}", alert.message),
            Severity::Error | Severity::Critical => {
                error!(job_id = %job_id, severity = %alert.severity, details = %alert.details, "{}", alert.message);
            }
        }
        self.metrics.lock().alerts += 1;
        self.alerts.write().push(alert.clone());
        self.send(MonitorEvent::Alert(alert));
    }

    /// Broadcasts a status change and bumps the matching counter.
    pub fn emit_status(&self, job_id: &JobId, from: JobStatus, to: JobStatus) {
        {
            let mut metrics = self.metrics.lock();
            match to {
                JobStatus::Completed => metrics.completed += 1,
                JobStatus::Failed => metrics.failed += 1,
                JobStatus::Cancelled => metrics.cancelled += 1,
                JobStatus::Stopped => metrics.stopped += 1,
                JobStatus::Retrying => metrics.retries += 1,
                _ => {}
            }
        }
        info!(job_id = %job_id, from = %from, to = %to, "Job status changed");
        self.send(MonitorEvent::StatusChanged { job_id: job_id.clone(), from, to, at: Utc::now() });
    }

    /// Alerts at or after `since`, optionally for one job, plus the
    /// truncation flag.
    pub fn alert_history(&self, job_id: Option<&JobId>, since: DateTime<Utc>) -> (Vec<AlertEvent>, bool) {
        let (mut alerts, truncated) = self.alerts.read().window(since);
        if let Some(id) = job_id {
            alerts.retain(|alert| alert.job_id.as_ref() == Some(id));
        }
        (alerts, truncated)
    }

    fn send(&self, event: MonitorEvent) {
        // no subscribers is fine
        if self.broadcast_tx.send(event).is_err() {
            debug!("Monitor event dropped: no subscribers");
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("subscribers", &self.broadcast_tx.receiver_count())
            .field("metrics", &self.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_changes_update_counters() {
        let reporter = ProgressReporter::new(16, 8);
        let mut rx = reporter.subscribe();
        let job = JobId::from("job-1");

        reporter.emit_status(&job, JobStatus::Running, JobStatus::Retrying);
        reporter.emit_status(&job, JobStatus::Running, JobStatus::Completed);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, MonitorEvent::StatusChanged { to: JobStatus::Retrying, .. }));
        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 0);
    }

    #[tokio::test]
    async fn test_alerts_are_kept_and_broadcast() {
        let reporter = ProgressReporter::new(16, 2);
        let mut rx = reporter.subscribe();

        for i in 0..3 {
            reporter.emit_alert(
                AlertEvent::new(Severity::Warning, format!("alert {i}")).for_job(JobId::from("a")),
            );
        }
        reporter.emit_alert(AlertEvent::new(Severity::Critical, "disk"));

        assert!(matches!(rx.recv().await.unwrap(), MonitorEvent::Alert(_)));
        let since = Utc::now() - chrono::Duration::hours(1);
        let (all, truncated) = reporter.alert_history(None, since);
        assert_eq!(all.len(), 2);
        assert!(truncated);
        let (for_a, _) = reporter.alert_history(Some(&JobId::from("a")), since);
        assert_eq!(for_a.len(), 1);
        assert_eq!(reporter.snapshot().alerts, 4);
    }

    #[test]
    fn test_send_without_subscribers_is_harmless() {
        let reporter = ProgressReporter::new(4, 4);
        reporter.emit_status(&JobId::from("x"), JobStatus::Queued, JobStatus::Cancelled);
        assert_eq!(reporter.snapshot().cancelled, 1);
    }
}
