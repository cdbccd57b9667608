//! Observational anomaly detection.
//!
//! Alerts never stop a job. Per job the detector keeps the last three
//! training losses and the time of the last step advance.

use crate::config::{AdmissionConfig, MonitorConfig};
use crate::metrics::{JobSample, SystemSample, Timestamped};
use chrono::{DateTime, Utc};
use cobalt_training::JobId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

const LOSS_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// An immutable alert record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub timestamp: DateTime<Utc>,
    pub job_id: Option<JobId>,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
}

impl AlertEvent {
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id: None,
            severity,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl Timestamped for AlertEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy)]
struct Ceiling {
    name: &'static str,
    warning: f64,
    critical: f64,
}

#[derive(Debug)]
struct JobTrack {
    losses: VecDeque<f64>,
    last_step: Option<u64>,
    last_progress: Instant,
    stagnation_reported: bool,
}

impl JobTrack {
    fn new(now: Instant) -> Self {
        Self {
            losses: VecDeque::with_capacity(LOSS_WINDOW),
            last_step: None,
            last_progress: now,
            stagnation_reported: false,
        }
    }
}

#[derive(Debug)]
pub struct AnomalyDetector {
    swing_threshold: f64,
    stagnation_window: Duration,
    ceilings: [Ceiling; 3],
    jobs: Mutex<HashMap<JobId, JobTrack>>,
}

impl AnomalyDetector {
    #[must_use]
    pub fn new(admission: &AdmissionConfig, monitor: &MonitorConfig) -> Self {
        Self {
            swing_threshold: monitor.loss_swing_threshold,
            stagnation_window: monitor.stagnation_window(),
            ceilings: [
                Ceiling { name: "cpu", warning: admission.cpu_ceiling, critical: monitor.cpu_critical },
                Ceiling {
                    name: "memory",
                    warning: admission.memory_ceiling,
                    critical: monitor.memory_critical,
                },
                Ceiling { name: "disk", warning: admission.disk_ceiling, critical: monitor.disk_critical },
            ],
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Starts (or restarts) tracking a job that has just begun running.
    pub fn track(&self, job_id: &JobId) {
        self.jobs.lock().insert(job_id.clone(), JobTrack::new(Instant::now()));
    }

    pub fn forget(&self, job_id: &JobId) {
        self.jobs.lock().remove(job_id);
    }

    /// Evaluates a progress sample; returns a warning when the last two
    /// relative loss changes both exceed the swing threshold.
    pub fn observe(&self, job_id: &JobId, sample: &JobSample) -> Option<AlertEvent> {
        let mut jobs = self.jobs.lock();
        let track = jobs.entry(job_id.clone()).or_insert_with(|| JobTrack::new(Instant::now()));

        if track.last_step.is_none_or(|last| sample.step > last) {
            track.last_step = Some(sample.step);
            track.last_progress = Instant::now();
            track.stagnation_reported = false;
        }

        let loss = sample.train_loss?;
        if track.losses.len() == LOSS_WINDOW {
            track.losses.pop_front();
        }
        track.losses.push_back(loss);
        if track.losses.len() < LOSS_WINDOW {
            return None;
        }

        let (a, b, c) = (track.losses[0], track.losses[1], track.losses[2]);
        let first = relative_change(a, b)?;
        let second = relative_change(b, c)?;
        if first <= self.swing_threshold || second <= self.swing_threshold {
            return None;
        }

        let percent = self.swing_threshold * 100.0;
        Some(
            AlertEvent::new(
                Severity::Warning,
                format!("loss fluctuating >{percent:.0}% over {LOSS_WINDOW} consecutive samples"),
            )
            .for_job(job_id.clone())
            .with_details(json!({
                "losses": [a, b, c],
                "changes": [first, second],
                "step": sample.step,
            })),
        )
    }

    /// Error alerts for running jobs without step progress for the window.
    /// Each stall is reported once.
    pub fn check_stagnation(&self, running: &[JobId], now: Instant) -> Vec<AlertEvent> {
        let mut jobs = self.jobs.lock();
        let mut alerts = Vec::new();
        for job_id in running {
            let Some(track) = jobs.get_mut(job_id) else { continue };
            let idle = now.saturating_duration_since(track.last_progress);
            if track.stagnation_reported || idle < self.stagnation_window {
                continue;
            }
            track.stagnation_reported = true;
            alerts.push(
                AlertEvent::new(
                    Severity::Error,
                    format!("no training progress for {} minutes", idle.as_secs() / 60),
                )
                .for_job(job_id.clone())
                .with_details(json!({
                    "last_step": track.last_step,
                    "idle_secs": idle.as_secs(),
                })),
            );
        }
        alerts
    }

    /// Warning above the admission ceiling, critical above the critical one.
    #[must_use]
    pub fn check_resources(&self, sample: &SystemSample) -> Vec<AlertEvent> {
        let values = [sample.cpu_percent, sample.memory_percent, sample.disk_percent];
        self.ceilings
            .iter()
            .zip(values)
            .filter_map(|(ceiling, value)| {
                let severity = if value > ceiling.critical {
                    Severity::Critical
                } else if value > ceiling.warning {
                    Severity::Warning
                } else {
                    return None;
                };
                let limit = if severity == Severity::Critical { ceiling.critical } else { ceiling.warning };
                Some(
                    AlertEvent::new(severity, format!("{} usage {value:.1}% exceeds {limit:.1}%", ceiling.name))
                        .with_details(json!({ "resource": ceiling.name, "value": value, "limit": limit })),
                )
            })
            .collect()
    }
}

fn relative_change(previous: f64, current: f64) -> Option<f64> {
    if previous == 0.0 {
        return None;
    }
    Some((current - previous).abs() / previous.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(&AdmissionConfig::default(), &MonitorConfig::default())
    }

    fn sample(step: u64, loss: f64) -> JobSample {
        JobSample {
            job_id: JobId::from("job"),
            timestamp: Utc::now(),
            epoch: 0,
            step,
            total_steps: 100,
            train_loss: Some(loss),
            val_loss: None,
            tokens_per_second: None,
            eta_seconds: None,
        }
    }

    fn feed(detector: &AnomalyDetector, losses: &[f64]) -> Vec<AlertEvent> {
        let job = JobId::from("job");
        losses
            .iter()
            .enumerate()
            .filter_map(|(i, loss)| detector.observe(&job, &sample(i as u64 + 1, *loss)))
            .collect()
    }

    #[tokio::test]
    async fn test_two_large_swings_warn() {
        let alerts = feed(&detector(), &[1.0, 0.4, 0.9]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert!(alerts[0].message.contains(">50%"));
        assert_eq!(alerts[0].job_id, Some(JobId::from("job")));
    }

    #[tokio::test]
    async fn test_steady_decrease_is_quiet() {
        assert!(feed(&detector(), &[1.0, 0.9, 0.8]).is_empty());
    }

    #[tokio::test]
    async fn test_single_swing_is_quiet() {
        assert!(feed(&detector(), &[1.0, 0.4, 0.39, 0.38]).is_empty());
    }

    #[tokio::test]
    async fn test_zero_loss_is_skipped() {
        assert!(feed(&detector(), &[0.0, 5.0, 0.1]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stagnation_reported_once_per_stall() {
        let detector = detector();
        let job = JobId::from("job");
        detector.track(&job);
        let running = vec![job.clone()];

        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        assert!(detector.check_stagnation(&running, Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        let alerts = detector.check_stagnation(&running, Instant::now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert!(detector.check_stagnation(&running, Instant::now()).is_empty());

        // progress re-arms the check
        detector.observe(&job, &sample(5, 1.0));
        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(detector.check_stagnation(&running, Instant::now()).len(), 1);
    }

    #[test]
    fn test_resource_ceilings() {
        let detector = detector();
        let mut sample = SystemSample::from_usage(crate::metrics::ResourceUsage::new(50.0, 90.0, 99.0));
        let alerts = detector.check_resources(&sample);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].details["resource"], "memory");
        assert_eq!(alerts[1].severity, Severity::Critical);

        sample.memory_percent = 10.0;
        sample.disk_percent = 10.0;
        assert!(detector.check_resources(&sample).is_empty());
    }
}
