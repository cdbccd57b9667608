//! Scheduler runtime: the loops and the job lifecycle decisions.
//!
//! All status writes go through here. Workers report outcomes via
//! [`ExecutionObserver`]; the retry path is the only place that decides
//! between re-queueing and giving up.

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::anomaly::{AlertEvent, AnomalyDetector, Severity};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, Result};
use crate::executor::{ExecutionObserver, ExecutionResult, WorkerPool};
use crate::metrics::{BoundedJobMap, JobSample, MetricsCollector, SystemSample};
use crate::progress::{ProgressMetrics, ProgressReporter};
use crate::queue::{JobQueue, QueuedTask, RunningSlot};
use crate::recovery::{
    rank_strategies, select_strategy, suggestions, CheckpointStatus, FailureAnalysis, FailureClassifier,
    FailureType, RecoveryOutcome, RecoveryRecord, RecoveryStrategy, SystemStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use cobalt_training::{
    CacheStats, CheckpointStore, Job, JobId, JobStatus, JobStore, JobUpdate, LogProgressSink, Priority,
    ProgressEvent, ProgressSink, TrainingError,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts to resolve a cancel racing with a status change.
const CANCEL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub success: bool,
    pub message: String,
}

impl EnqueueOutcome {
    fn accepted(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed before it ran; status `Cancelled`.
    Dequeued,
    /// Running job interrupted; status `Stopped`, slot released.
    Stopped,
    /// Cancellation was signalled but the worker did not finish in time.
    TimedOut,
    /// The job is in a state that cannot be cancelled.
    NotCancellable { status: JobStatus },
    NotFound,
}

impl CancelOutcome {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Dequeued | Self::Stopped | Self::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub queue_size: usize,
    pub running_count: usize,
    pub max_concurrent: usize,
    pub completed_count: u64,
    pub failed_count: u64,
    pub queued: Vec<JobId>,
    pub stats: ProgressMetrics,
    pub checkpoint_cache: CacheStatsView,
    pub latest_system: Option<SystemSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsView {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl From<CacheStats> for CacheStatsView {
    fn from(stats: CacheStats) -> Self {
        Self { hits: stats.hits, misses: stats.misses, evictions: stats.evictions, size: stats.size }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: Job,
    /// Completed fraction from the latest sample.
    pub progress: Option<f64>,
    pub metrics: Option<JobSample>,
    pub recoveries: Vec<RecoveryRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub since: DateTime<Utc>,
    pub system_metrics: Vec<SystemSample>,
    pub training_metrics: Vec<JobSample>,
    pub alerts: Vec<AlertEvent>,
    /// Older data inside the window has already been evicted.
    pub truncated: bool,
}

pub(crate) struct Runtime {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    admission: AdmissionController,
    metrics: Arc<MetricsCollector>,
    anomaly: AnomalyDetector,
    reporter: ProgressReporter,
    pool: WorkerPool,
    checkpoints: Arc<CheckpointStore>,
    classifier: Arc<dyn FailureClassifier>,
    recoveries: Mutex<BoundedJobMap<Vec<RecoveryRecord>>>,
    retry_timers: Mutex<HashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
}

pub(crate) struct RuntimeParts {
    pub config: OrchestratorConfig,
    pub store: Arc<dyn JobStore>,
    pub metrics: Arc<MetricsCollector>,
    pub pool: WorkerPool,
    pub checkpoints: Arc<CheckpointStore>,
    pub classifier: Arc<dyn FailureClassifier>,
}

impl Runtime {
    pub(crate) fn new(parts: RuntimeParts) -> Self {
        let RuntimeParts { config, store, metrics, pool, checkpoints, classifier } = parts;
        let queue = Arc::new(JobQueue::new(config.scheduler.max_concurrent));
        let admission =
            AdmissionController::new(config.admission.clone(), Arc::clone(&queue), Arc::clone(&metrics));
        let anomaly = AnomalyDetector::new(&config.admission, &config.monitor);
        let reporter = ProgressReporter::new(config.monitor.event_buffer, config.monitor.alert_history);
        let recoveries = Mutex::new(BoundedJobMap::new(config.monitor.tracked_jobs));
        Self {
            config,
            store,
            queue,
            admission,
            metrics,
            anomaly,
            reporter,
            pool,
            checkpoints,
            classifier,
            recoveries,
            retry_timers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) const fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub(crate) const fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub(crate) const fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    // ---- enqueue / cancel --------------------------------------------------

    pub(crate) async fn enqueue(&self, job_id: &JobId, priority: Option<Priority>) -> Result<EnqueueOutcome> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(TrainingError::JobNotFound(_)) => {
                return Ok(EnqueueOutcome::rejected(format!("job {job_id} not found")));
            }
            Err(e) => return Err(e.into()),
        };
        if !job.status.is_enqueueable() {
            return Ok(EnqueueOutcome::rejected(format!(
                "job {job_id} is {}; only pending or failed jobs can be queued",
                job.status
            )));
        }

        let priority = priority.unwrap_or(job.priority);
        let mut update = JobUpdate::new().queued_now().priority(priority);
        if job.status == JobStatus::Failed {
            // manual re-submission starts a fresh retry budget
            update = update.retry_count(0).clear_error();
        }
        match self.store.transition(job_id, JobStatus::Queued, update).await {
            Ok(_) => {}
            Err(TrainingError::InvalidTransition { from, .. }) => {
                return Ok(EnqueueOutcome::rejected(format!("job {job_id} changed to {from} concurrently")));
            }
            Err(e) => return Err(e.into()),
        }
        self.reporter.emit_status(job_id, job.status, JobStatus::Queued);

        if !self.queue.push(job_id.clone(), priority) {
            warn!(job_id = %job_id, "Job already present in queue");
        }
        Ok(EnqueueOutcome::accepted(format!(
            "job {job_id} queued with {priority} priority ({} pending)",
            self.queue.len()
        )))
    }

    pub(crate) async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome> {
        let mut status = None;
        for _ in 0..CANCEL_ATTEMPTS {
            if self.queue.cancel_queued(job_id) {
                return self.mark_cancelled(job_id).await;
            }

            if let Some(mut handle) = self.pool.cancel(job_id) {
                let timeout = self.config.scheduler.cancel_timeout();
                if tokio::time::timeout(timeout, handle.finished()).await.is_err() {
                    warn!(job_id = %job_id, ?timeout, "Worker did not acknowledge cancellation in time");
                    return Ok(CancelOutcome::TimedOut);
                }
                // the run may have ended on its own before seeing the cancel
                match self.store.get(job_id).await?.status {
                    JobStatus::Stopped => return Ok(CancelOutcome::Stopped),
                    JobStatus::Queued | JobStatus::Retrying | JobStatus::Running => continue,
                    other => return Ok(CancelOutcome::NotCancellable { status: other }),
                }
            }

            let job = match self.store.get(job_id).await {
                Ok(job) => job,
                Err(TrainingError::JobNotFound(_)) => return Ok(CancelOutcome::NotFound),
                Err(e) => return Err(e.into()),
            };
            status = Some(job.status);
            match job.status {
                JobStatus::Pending | JobStatus::Queued | JobStatus::Retrying => {
                    if let Some(timer) = self.retry_timers.lock().remove(job_id) {
                        timer.cancel();
                    }
                    match self.mark_cancelled(job_id).await {
                        Ok(outcome) => return Ok(outcome),
                        Err(OrchestrationError::Training(TrainingError::InvalidTransition { .. })) => {}
                        Err(e) => return Err(e),
                    }
                }
                // dequeued but the worker is not registered yet
                JobStatus::Running => tokio::task::yield_now().await,
                other => return Ok(CancelOutcome::NotCancellable { status: other }),
            }
        }
        Ok(CancelOutcome::NotCancellable { status: status.unwrap_or(JobStatus::Running) })
    }

    async fn mark_cancelled(&self, job_id: &JobId) -> Result<CancelOutcome> {
        let before = self.store.get(job_id).await?.status;
        self.store.transition(job_id, JobStatus::Cancelled, JobUpdate::new().completed_now()).await?;
        self.reporter.emit_status(job_id, before, JobStatus::Cancelled);
        Ok(CancelOutcome::Dequeued)
    }

    // ---- loops -------------------------------------------------------------

    pub(crate) async fn run_scheduler(self: Arc<Self>) {
        info!(max_concurrent = self.queue.max_concurrent(), "Scheduler loop started");
        let poll = self.config.scheduler.poll_interval();
        let dequeue_timeout = self.config.scheduler.dequeue_timeout();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.admission.check().await {
                AdmissionDecision::Admit => {}
                AdmissionDecision::AtCapacity { .. } => {
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = self.queue.slot_released() => {}
                        () = tokio::time::sleep(poll) => {}
                    }
                    continue;
                }
                decision @ AdmissionDecision::ResourcePressure { .. } => {
                    if !self.queue.is_empty() {
                        info!(reason = %decision, backoff = ?poll, "Admission denied");
                    }
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(poll) => {}
                    }
                    continue;
                }
            }

            let task = tokio::select! {
                () = self.shutdown.cancelled() => break,
                task = self.queue.pop_timeout(dequeue_timeout) => task,
            };
            let Some(task) = task else { continue };

            let Some(slot) = self.queue.try_acquire_slot(&task.job_id) else {
                debug!(job_id = %task.job_id, "No slot for dequeued job, requeueing");
                self.queue.requeue(task);
                continue;
            };
            self.launch(task, slot).await;
        }
        info!("Scheduler loop stopped");
    }

    async fn launch(self: &Arc<Self>, task: QueuedTask, slot: RunningSlot) {
        let job_id = task.job_id;
        let job = match self.store.transition(&job_id, JobStatus::Running, JobUpdate::new().started_now()).await {
            Ok(job) => job,
            Err(e) => {
                // cancelled between dequeue and start; the slot drops here
                debug!(job_id = %job_id, error = %e, "Skipping dequeued job");
                return;
            }
        };
        self.reporter.emit_status(&job_id, JobStatus::Queued, JobStatus::Running);

        let resume = job.checkpoint_path.as_deref().and_then(|path| {
            self.checkpoints.load(&job_id, Some(path)).or_else(|| {
                warn!(job_id = %job_id, path = %path.display(), "Resume checkpoint unusable, trying latest valid");
                self.checkpoints.load(&job_id, None)
            })
        });

        self.anomaly.track(&job_id);
        let observer = Arc::new(RuntimeObserver { runtime: Arc::clone(self) });
        self.pool.start(job, resume, slot, observer);
    }

    pub(crate) async fn run_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.monitor.sample_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(interval = ?self.config.monitor.sample_interval(), "Monitor loop started");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.monitor_tick().await,
            }
        }
        debug!("Monitor loop stopped");
    }

    async fn monitor_tick(&self) {
        if let Some(sample) = self.metrics.sample_system().await {
            for alert in self.anomaly.check_resources(&sample) {
                self.reporter.emit_alert(alert);
            }
            self.reporter.emit_system(sample);
        }
        for alert in self.anomaly.check_stagnation(&self.pool.active_jobs(), Instant::now()) {
            self.reporter.emit_alert(alert);
        }
    }

    /// Stops timers and running jobs. Loops observe the shutdown token.
    pub(crate) async fn stop_all(&self) {
        self.shutdown.cancel();
        let timers: Vec<CancellationToken> = self.retry_timers.lock().drain().map(|(_, t)| t).collect();
        for timer in timers {
            timer.cancel();
        }

        let timeout = self.config.scheduler.cancel_timeout();
        for mut handle in self.pool.cancel_all() {
            if tokio::time::timeout(timeout, handle.finished()).await.is_err() {
                warn!(job_id = %handle.job_id(), "Worker still running at shutdown");
            }
        }
    }

    // ---- outcomes ----------------------------------------------------------

    async fn complete(&self, job: &Job, outcome: cobalt_training::TrainingOutcome) {
        let mut update = JobUpdate::new().completed_now().clear_error();
        if let Some(path) = outcome.artifact_path {
            update = update.artifact(path);
        }
        match self.store.transition(&job.id, JobStatus::Completed, update).await {
            Ok(_) => {
                info!(job_id = %job.id, loss = ?outcome.metrics.train_loss, "Job completed");
                self.reporter.emit_status(&job.id, JobStatus::Running, JobStatus::Completed);
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record completion"),
        }
    }

    async fn stopped(&self, job: &Job) {
        match self.store.transition(&job.id, JobStatus::Stopped, JobUpdate::new().completed_now()).await {
            Ok(_) => self.reporter.emit_status(&job.id, JobStatus::Running, JobStatus::Stopped),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record stop"),
        }
    }

    async fn failed(self: &Arc<Self>, job: &Job, message: String) {
        let job = match self.store.update(&job.id, JobUpdate::new().error(message.clone())).await {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record error message");
                return;
            }
        };
        warn!(job_id = %job.id, retry_count = job.retry_count, max_retries = job.max_retries, error = %message, "Job run failed");

        if self.pool.cancel_requested(&job.id) {
            info!(job_id = %job.id, "Cancelled while its failure was recorded, not retrying");
            self.stopped(&job).await;
            return;
        }
        if !job.retries_remaining() {
            self.fail_permanently(&job, &message).await;
            return;
        }
        if let Err(e) = self.recover(&job, None).await {
            error!(job_id = %job.id, error = %e, "Recovery failed");
            self.fail_permanently(&job, &message).await;
        }
    }

    async fn fail_permanently(&self, job: &Job, message: &str) {
        let update = JobUpdate::new().completed_now().error(message);
        match self.store.transition(&job.id, JobStatus::Failed, update).await {
            Ok(_) => {
                error!(job_id = %job.id, retries = job.retry_count, error = %message, "Job failed permanently");
                self.reporter.emit_status(&job.id, job.status, JobStatus::Failed);
                self.reporter.emit_alert(
                    AlertEvent::new(Severity::Error, format!("job failed after {} retries", job.retry_count))
                        .for_job(job.id.clone())
                        .with_details(json!({ "error": message })),
                );
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record permanent failure"),
        }
    }

    // ---- recovery ----------------------------------------------------------

    fn system_status(&self) -> SystemStatus {
        SystemStatus::from_sample(
            self.metrics.latest_system().as_ref(),
            self.config.admission.memory_ceiling,
            self.config.admission.disk_ceiling,
        )
    }

    fn classify(&self, job: &Job) -> FailureType {
        self.classifier.classify(job.error_message.as_deref().unwrap_or_default())
    }

    pub(crate) async fn analyze_failure(&self, job_id: &JobId) -> Result<FailureAnalysis> {
        let job = self.store.get(job_id).await?;
        let failure_type = if job.error_message.is_some() { self.classify(&job) } else { FailureType::Unknown };
        let checkpoint = CheckpointStatus { latest_valid: self.checkpoints.latest_valid(job_id) };
        Ok(FailureAnalysis {
            failure_type,
            class: failure_type.class(),
            candidates: rank_strategies(failure_type, &job.config, self.system_status(), &checkpoint),
            suggestions: suggestions(failure_type).into_iter().map(String::from).collect(),
            retries_remaining: job.max_retries.saturating_sub(job.retry_count),
            error_message: job.error_message,
        })
    }

    /// Operator entry point; only `Failed` jobs are eligible.
    pub(crate) async fn attempt_recovery(
        self: &Arc<Self>,
        job_id: &JobId,
        strategy: Option<RecoveryStrategy>,
    ) -> Result<RecoveryOutcome> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::Failed {
            return Ok(RecoveryOutcome::rejected(format!(
                "job {job_id} is {}; only failed jobs can be recovered",
                job.status
            )));
        }
        self.recover(&job, strategy).await
    }

    /// Applies a strategy and schedules the re-queue. Does nothing once the
    /// retry budget is spent.
    async fn recover(self: &Arc<Self>, job: &Job, requested: Option<RecoveryStrategy>) -> Result<RecoveryOutcome> {
        if !job.retries_remaining() {
            return Ok(RecoveryOutcome::rejected(format!(
                "job {} exhausted its {} retries",
                job.id, job.max_retries
            )));
        }

        let failure = self.classify(job);
        let checkpoint = CheckpointStatus { latest_valid: self.checkpoints.latest_valid(&job.id) };
        let strategy =
            requested.unwrap_or_else(|| select_strategy(failure, &job.config, self.system_status(), &checkpoint));

        let mut config = job.config.clone();
        let mut resume_path = None;
        let message = match strategy {
            RecoveryStrategy::RetrySame => "retrying with unchanged configuration".to_string(),
            RecoveryStrategy::ReduceBatchSize => {
                if config.batch_size <= 1 {
                    return Ok(self.escalate(job, failure, "batch size is already 1").await);
                }
                let from = config.batch_size;
                let to = config.halve_batch_size();
                format!("batch size reduced from {from} to {to}")
            }
            RecoveryStrategy::ClearCache => {
                if let Err(e) = self.pool.trainer().release_resources().await {
                    warn!(job_id = %job.id, error = %e, "Trainer failed to release resources");
                }
                let released = self.checkpoints.clear_cache();
                format!("released trainer resources and {released} cached checkpoint states")
            }
            RecoveryStrategy::RestartFromCheckpoint => {
                let Some(meta) = checkpoint.latest_valid else {
                    return Ok(self.escalate(job, failure, "no valid checkpoint to restart from").await);
                };
                config.resume_from(meta.epoch, meta.step);
                resume_path = Some(meta.path);
                format!("restarting from checkpoint at epoch {} step {}", meta.epoch, meta.step)
            }
            RecoveryStrategy::ReconfigureParameters => {
                config.reconfigure_for_stability();
                format!(
                    "learning rate lowered to {:e}, dropout raised to {:.2}",
                    config.learning_rate, config.dropout
                )
            }
            RecoveryStrategy::ManualIntervention => {
                return Ok(self.escalate(job, failure, "no automatic recovery applies").await);
            }
        };

        let delay = self.config.retry.backoff_delay(job.retry_count);
        let attempt = job.retry_count + 1;
        let mut update = JobUpdate::new().retry_count(attempt).config(config);
        if resume_path.is_some() {
            update = update.checkpoint(resume_path);
        }
        self.store.transition(&job.id, JobStatus::Retrying, update).await?;
        self.reporter.emit_status(&job.id, job.status, JobStatus::Retrying);
        info!(
            job_id = %job.id,
            failure = %failure,
            strategy = %strategy,
            attempt,
            delay_secs = delay.as_secs(),
            "{message}"
        );

        self.recoveries.lock().get_or_insert_with(&job.id, Vec::new).push(RecoveryRecord {
            attempt,
            failure_type: failure,
            strategy,
            delay_secs: delay.as_secs(),
            at: Utc::now(),
            message: message.clone(),
        });
        self.schedule_requeue(job.id.clone(), delay);

        Ok(RecoveryOutcome {
            success: true,
            strategy: Some(strategy),
            message,
            delay_secs: Some(delay.as_secs()),
        })
    }

    /// Surfaces a job to the operator. A running job is marked failed.
    async fn escalate(&self, job: &Job, failure: FailureType, reason: &str) -> RecoveryOutcome {
        let message = format!("manual intervention required for {failure}: {reason}");
        if job.status == JobStatus::Running {
            let update = JobUpdate::new().completed_now();
            match self.store.transition(&job.id, JobStatus::Failed, update).await {
                Ok(_) => self.reporter.emit_status(&job.id, JobStatus::Running, JobStatus::Failed),
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job failed"),
            }
        }
        self.reporter.emit_alert(
            AlertEvent::new(Severity::Critical, message.clone())
                .for_job(job.id.clone())
                .with_details(json!({
                    "failure_type": failure,
                    "error": job.error_message,
                    "suggestions": suggestions(failure),
                })),
        );
        RecoveryOutcome {
            success: false,
            strategy: Some(RecoveryStrategy::ManualIntervention),
            message,
            delay_secs: None,
        }
    }

    /// Re-queues the job once `delay` has passed and its last run has
    /// released its slot. The job keeps a slot reserved until then.
    fn schedule_requeue(self: &Arc<Self>, job_id: JobId, delay: Duration) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.retry_timers.lock().insert(job_id.clone(), token.clone()) {
            previous.cancel();
        }
        let reservation = self.queue.reserve(&job_id);
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let ready = async {
                tokio::time::sleep(delay).await;
                runtime.queue.wait_until_idle(&job_id).await;
            };
            tokio::select! {
                () = token.cancelled() => {
                    debug!(job_id = %job_id, "Retry timer cancelled");
                    return;
                }
                () = ready => {}
            }
            runtime.retry_timers.lock().remove(&job_id);
            runtime.requeue_after_backoff(&job_id).await;
            drop(reservation);
        });
    }

    async fn requeue_after_backoff(&self, job_id: &JobId) {
        match self.store.transition(job_id, JobStatus::Queued, JobUpdate::new().queued_now()).await {
            Ok(job) => {
                self.reporter.emit_status(job_id, JobStatus::Retrying, JobStatus::Queued);
                if !self.queue.push(job_id.clone(), job.priority) {
                    warn!(job_id = %job_id, "Retried job already present in queue");
                }
            }
            Err(e) => debug!(job_id = %job_id, error = %e, "Job left Retrying before its backoff elapsed"),
        }
    }

    // ---- queries -----------------------------------------------------------

    pub(crate) fn status(&self) -> StatusReport {
        let stats = self.reporter.snapshot();
        StatusReport {
            queue_size: self.queue.len(),
            running_count: self.queue.running_count(),
            max_concurrent: self.queue.max_concurrent(),
            completed_count: stats.completed,
            failed_count: stats.failed,
            queued: self.queue.snapshot().into_iter().map(|task| task.job_id).collect(),
            stats,
            checkpoint_cache: self.checkpoints.cache_stats().into(),
            latest_system: self.metrics.latest_system(),
        }
    }

    pub(crate) async fn job_status(&self, job_id: &JobId) -> Result<JobReport> {
        let job = self.store.get(job_id).await?;
        let metrics = self.metrics.latest_job(job_id);
        Ok(JobReport {
            progress: metrics.as_ref().map(JobSample::fraction),
            metrics,
            recoveries: self.recoveries.lock().get(job_id).cloned().unwrap_or_default(),
            job,
        })
    }

    /// Windows reaching past the representable range cover everything kept.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn history(&self, job_id: Option<&JobId>, window_hours: f64) -> HistoryReport {
        let since = TimeDelta::try_milliseconds((window_hours.max(0.0) * 3_600_000.0) as i64)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let (system_metrics, system_truncated) = self.metrics.system_history(since);
        let (training_metrics, jobs_truncated) = self.metrics.job_history(job_id, since);
        let (alerts, alerts_truncated) = self.reporter.alert_history(job_id, since);
        HistoryReport {
            since,
            system_metrics,
            training_metrics,
            alerts,
            truncated: system_truncated || jobs_truncated || alerts_truncated,
        }
    }
}

/// Bridges worker reports back into the runtime.
struct RuntimeObserver {
    runtime: Arc<Runtime>,
}

#[async_trait]
impl ExecutionObserver for RuntimeObserver {
    fn on_progress(&self, event: ProgressEvent) {
        let runtime = &self.runtime;
        if let ProgressEvent::Step { job_id, update } = &event {
            let sample = runtime.metrics.record_job(job_id, update);
            if let Some(alert) = runtime.anomaly.observe(job_id, &sample) {
                runtime.reporter.emit_alert(alert);
            }
            runtime.reporter.emit_job(sample);
        }
        LogProgressSink.on_event(event);
    }

    async fn on_finished(&self, job: &Job, result: ExecutionResult) {
        let runtime = &self.runtime;
        runtime.metrics.finish_run(&job.id);
        runtime.anomaly.forget(&job.id);
        match result {
            ExecutionResult::Succeeded(outcome) => runtime.complete(job, outcome).await,
            ExecutionResult::Cancelled => runtime.stopped(job).await,
            ExecutionResult::Failed(message) => runtime.failed(job, message).await,
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("queue", &self.queue)
            .field("pool", &self.pool)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
