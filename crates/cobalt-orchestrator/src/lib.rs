//! Training-job orchestrator for Cobalt.
//!
//! Jobs registered in a [`JobStore`] are queued by priority, admitted against
//! a concurrency bound and host resource ceilings, and run on a
//! [`Trainer`] by the worker pool. Failures are classified and recovered
//! with bounded, backed-off retries. Every status transition is made by the
//! scheduler runtime behind the [`Orchestrator`] façade.

pub mod admission;
pub mod anomaly;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod recovery;
mod scheduler;

use cobalt_training::{
    CheckpointLayout, CheckpointStore, InMemoryJobStore, Job, JobId, JobStore, NewJob, Priority,
    SimulatedTrainer, SimulationPlan, StateCache, Trainer,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use admission::{AdmissionController, AdmissionDecision};
pub use anomaly::{AlertEvent, AnomalyDetector, Severity};
pub use config::{
    AdmissionConfig, CheckpointConfig, MonitorConfig, OrchestratorConfig, RetryConfig, SchedulerConfig,
    DEFAULT_CONFIG_FILE,
};
pub use error::{OrchestrationError, Result};
pub use executor::{ExecutionHandle, ExecutionObserver, ExecutionResult, WorkerPool};
pub use metrics::{
    JobSample, MetricsCollector, ProbeError, ProcResourceProbe, ResourceProbe, ResourceUsage, RingBuffer,
    StaticProbe, SystemSample,
};
pub use progress::{MonitorEvent, ProgressMetrics, ProgressReporter};
pub use queue::{JobQueue, QueuedTask, Reservation, RunningSlot};
pub use recovery::{
    FailureAnalysis, FailureClass, FailureClassifier, FailureType, PatternClassifier, RecoveryOutcome,
    RecoveryRecord, RecoveryStrategy, StrategyCandidate,
};
pub use scheduler::{CacheStatsView, CancelOutcome, EnqueueOutcome, HistoryReport, JobReport, StatusReport};

use scheduler::{Runtime, RuntimeParts};

/// Interval used by [`Orchestrator::wait_until_terminal`] between store reads.
const TERMINAL_POLL: Duration = Duration::from_millis(50);

/// Builder for [`Orchestrator`].
///
/// Every seam has a default: an in-memory job store, the simulated trainer,
/// the `/proc` resource probe and the regex failure classifier.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    trainer: Option<Arc<dyn Trainer>>,
    store: Option<Arc<dyn JobStore>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    checkpoints: Option<Arc<CheckpointStore>>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_trainer(mut self, trainer: Arc<dyn Trainer>) -> Self {
        self.trainer = Some(trainer);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Uses an existing checkpoint store instead of one built from
    /// `[checkpoint]`.
    #[must_use]
    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Validates the configuration and wires the components together.
    ///
    /// # Errors
    /// Returns `OrchestrationError::Config` if the configuration is invalid.
    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let checkpoints = self.checkpoints.unwrap_or_else(|| {
            Arc::new(CheckpointStore::new(
                CheckpointLayout::new(config.checkpoint.root.clone()),
                config.checkpoint.retention,
                StateCache::new(config.checkpoint.cache_entries),
            ))
        });
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(ProcResourceProbe::new(config.checkpoint.root.clone())));
        let metrics = Arc::new(MetricsCollector::new(
            probe,
            config.admission.probe_timeout(),
            config.monitor.system_history,
            config.monitor.job_history,
        )
        .with_tracked_jobs(config.monitor.tracked_jobs));
        let trainer = self
            .trainer
            .unwrap_or_else(|| Arc::new(SimulatedTrainer::new(SimulationPlan::default())));
        let pool = WorkerPool::new(trainer, Arc::clone(&checkpoints));

        let runtime = Arc::new(Runtime::new(RuntimeParts {
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryJobStore::new())),
            classifier: self.classifier.unwrap_or_else(|| Arc::new(PatternClassifier::new())),
            config,
            metrics,
            pool,
            checkpoints,
        }));
        Ok(Orchestrator { runtime, loops: Mutex::new(Vec::new()) })
    }
}

/// Orchestrator for training jobs.
pub struct Orchestrator {
    runtime: Arc<Runtime>,
    /// Scheduler and monitor loop handles while started.
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Creates an orchestrator with default seams for `config`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Spawns the scheduler and monitor loops.
    ///
    /// # Errors
    /// Returns `AlreadyRunning` if the loops are running, or `Other` once
    /// the orchestrator has been shut down.
    pub fn start(&self) -> Result<()> {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return Err(OrchestrationError::AlreadyRunning);
        }
        if self.runtime.shutdown_token().is_cancelled() {
            return Err(OrchestrationError::Other("orchestrator has been shut down".to_string()));
        }
        loops.push(tokio::spawn(Arc::clone(&self.runtime).run_scheduler()));
        loops.push(tokio::spawn(Arc::clone(&self.runtime).run_monitor()));
        info!(max_concurrent = self.runtime.config().scheduler.max_concurrent, "Orchestrator started");
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.loops.lock().is_empty() && !self.runtime.shutdown_token().is_cancelled()
    }

    /// Stops both loops, cancels running jobs and pending retry timers.
    ///
    /// Running jobs end as `Stopped`. Jobs waiting on a retry timer stay in
    /// `Retrying`.
    ///
    /// # Errors
    /// Returns `NotRunning` if the orchestrator was never started.
    pub async fn shutdown(&self) -> Result<()> {
        let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        if loops.is_empty() {
            return Err(OrchestrationError::NotRunning);
        }
        self.runtime.stop_all().await;
        for handle in loops {
            if let Err(e) = handle.await {
                debug!(error = %e, "Loop task ended abnormally");
            }
        }
        info!("Orchestrator stopped");
        Ok(())
    }

    /// Registers a new job in `Pending`.
    ///
    /// # Errors
    /// Returns an error if the job's configuration is invalid.
    pub async fn submit(&self, request: NewJob) -> Result<Job> {
        Ok(self.runtime.store().create(request).await?)
    }

    /// Queues a pending or failed job.
    ///
    /// # Arguments
    /// * `job_id` - The job to queue
    /// * `priority` - Overrides the job's stored priority when set
    ///
    /// # Returns
    /// An outcome whose `success` is `false` for unknown jobs or jobs in any
    /// other status.
    ///
    /// # Errors
    /// Returns an error if the job store fails.
    pub async fn enqueue(&self, job_id: &JobId, priority: Option<Priority>) -> Result<EnqueueOutcome> {
        self.runtime.enqueue(job_id, priority).await
    }

    /// Submits and queues in one call.
    ///
    /// # Errors
    /// Returns an error if the job cannot be created or queued.
    pub async fn submit_and_enqueue(&self, request: NewJob) -> Result<Job> {
        let job = self.submit(request).await?;
        let outcome = self.enqueue(&job.id, None).await?;
        if !outcome.success {
            return Err(OrchestrationError::NotEnqueueable { job_id: job.id, reason: outcome.message });
        }
        Ok(self.runtime.store().get(&job.id).await?)
    }

    /// Cancels a queued, retrying or running job.
    ///
    /// # Errors
    /// Returns an error if the job store fails.
    pub async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome> {
        self.runtime.cancel(job_id).await
    }

    #[must_use]
    pub fn status(&self) -> StatusReport {
        self.runtime.status()
    }

    /// Current record, progress and recovery history for one job.
    ///
    /// # Errors
    /// Returns `JobNotFound` for unknown jobs.
    pub async fn job_status(&self, job_id: &JobId) -> Result<JobReport> {
        self.runtime.job_status(job_id).await
    }

    /// Diagnoses a job's last failure without changing anything.
    ///
    /// # Errors
    /// Returns `JobNotFound` for unknown jobs.
    pub async fn analyze_failure(&self, job_id: &JobId) -> Result<FailureAnalysis> {
        self.runtime.analyze_failure(job_id).await
    }

    /// Operator-driven recovery of a failed job.
    ///
    /// # Arguments
    /// * `job_id` - A job in `Failed`
    /// * `strategy` - Forces a strategy instead of the ranked best
    ///
    /// # Errors
    /// Returns an error if the job is unknown or the store fails.
    pub async fn attempt_recovery(
        &self,
        job_id: &JobId,
        strategy: Option<RecoveryStrategy>,
    ) -> Result<RecoveryOutcome> {
        self.runtime.attempt_recovery(job_id, strategy).await
    }

    /// Samples and alerts from the last `window_hours`.
    #[must_use]
    pub fn history(&self, job_id: Option<&JobId>, window_hours: f64) -> HistoryReport {
        self.runtime.history(job_id, window_hours)
    }

    /// Subscribes to monitor events. Delivery is at most once.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.runtime.reporter().subscribe()
    }

    /// Evaluates admission once without dequeuing anything.
    pub async fn check_admission(&self) -> AdmissionDecision {
        self.runtime.admission().check().await
    }

    /// Polls the store until the job reaches a terminal status.
    ///
    /// # Errors
    /// Returns `Other` on timeout and `JobNotFound` for unknown jobs.
    pub async fn wait_until_terminal(&self, job_id: &JobId, timeout: Duration) -> Result<Job> {
        let store = Arc::clone(self.runtime.store());
        let wait = async {
            loop {
                let job = store.get(job_id).await?;
                if job.status.is_terminal() {
                    return Ok::<Job, OrchestrationError>(job);
                }
                tokio::time::sleep(TERMINAL_POLL).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            OrchestrationError::Other(format!("job {job_id} not terminal after {timeout:?}"))
        })?
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.runtime.store()
    }

    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        self.runtime.checkpoints()
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        self.runtime.config()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runtime", &self.runtime)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cobalt_training::JobStatus;
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir) -> Orchestrator {
        let mut config = OrchestratorConfig::default();
        config.checkpoint.root = dir.path().to_path_buf();
        Orchestrator::builder().config(config).with_probe(Arc::new(StaticProbe::idle())).build().unwrap()
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = OrchestratorConfig::default();
        config.scheduler.max_concurrent = 0;
        assert!(matches!(Orchestrator::new(config), Err(OrchestrationError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown_without_start() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);
        assert!(matches!(orchestrator.shutdown().await, Err(OrchestrationError::NotRunning)));

        orchestrator.start().unwrap();
        assert!(orchestrator.is_running());
        assert!(matches!(orchestrator.start(), Err(OrchestrationError::AlreadyRunning)));
        orchestrator.shutdown().await.unwrap();
        assert!(!orchestrator.is_running());
        assert!(orchestrator.start().is_err());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_and_running_states() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);

        let missing = orchestrator.enqueue(&JobId::from("nope"), None).await.unwrap();
        assert!(!missing.success);

        let job = orchestrator.submit(NewJob::new("a")).await.unwrap();
        assert!(orchestrator.enqueue(&job.id, Some(Priority::High)).await.unwrap().success);
        let again = orchestrator.enqueue(&job.id, None).await.unwrap();
        assert!(!again.success);

        let stored = orchestrator.store().get(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.priority, Priority::High);
        assert!(stored.queued_at.is_some());
        assert_eq!(orchestrator.status().queue_size, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);
        let job = orchestrator.submit_and_enqueue(NewJob::new("a")).await.unwrap();

        assert_eq!(orchestrator.cancel(&job.id).await.unwrap(), CancelOutcome::Dequeued);
        assert_eq!(orchestrator.store().get(&job.id).await.unwrap().status, JobStatus::Cancelled);
        assert_eq!(orchestrator.status().queue_size, 0);

        let second = orchestrator.cancel(&job.id).await.unwrap();
        assert_eq!(second, CancelOutcome::NotCancellable { status: JobStatus::Cancelled });
        assert!(!second.success());
        assert_eq!(orchestrator.cancel(&JobId::from("nope")).await.unwrap(), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_analyze_failure_for_job_without_error() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);
        let job = orchestrator.submit(NewJob::new("a")).await.unwrap();

        let analysis = orchestrator.analyze_failure(&job.id).await.unwrap();
        assert_eq!(analysis.failure_type, FailureType::Unknown);
        assert!(analysis.error_message.is_none());

        let outcome = orchestrator.attempt_recovery(&job.id, None).await.unwrap();
        assert!(!outcome.success);
    }
}
