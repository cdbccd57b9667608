//! Worker pool for admitted jobs.
//!
//! Each job runs in its own tokio task. The trainer future is spawned once
//! more inside that task so a panic surfaces as a `JoinError` rather than
//! tearing down the worker. The worker reports the outcome to an
//! [`ExecutionObserver`] and never writes job status itself.
//!
//! Exit order on every path: observer notified, handle removed, slot released,
//! done signal sent.

use crate::queue::RunningSlot;
use async_trait::async_trait;
use cobalt_training::{
    CheckpointState, CheckpointStore, Job, JobId, ProgressEvent, ProgressSink, RunContext, Trainer,
    TrainingError, TrainingOutcome,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Terminal result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Succeeded(TrainingOutcome),
    /// Classification-ready failure text.
    Failed(String),
    Cancelled,
}

/// Receives everything a worker reports.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    /// Called synchronously from the trainer's progress path.
    fn on_progress(&self, event: ProgressEvent);

    /// Called exactly once per started job, before the slot is released.
    async fn on_finished(&self, job: &Job, result: ExecutionResult);
}

/// Handle to a started job.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    job_id: JobId,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl ExecutionHandle {
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the worker has released its slot.
    pub async fn finished(&mut self) {
        // a dropped sender also means the worker is gone
        let _ = self.done.wait_for(|done| *done).await;
    }
}

struct ObserverSink {
    observer: Arc<dyn ExecutionObserver>,
}

impl ProgressSink for ObserverSink {
    fn on_event(&self, event: ProgressEvent) {
        self.observer.on_progress(event);
    }
}

pub struct WorkerPool {
    trainer: Arc<dyn Trainer>,
    checkpoints: Arc<CheckpointStore>,
    handles: Arc<Mutex<HashMap<JobId, ExecutionHandle>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(trainer: Arc<dyn Trainer>, checkpoints: Arc<CheckpointStore>) -> Self {
        Self { trainer, checkpoints, handles: Arc::new(Mutex::new(HashMap::new())) }
    }

    #[must_use]
    pub fn trainer(&self) -> &Arc<dyn Trainer> {
        &self.trainer
    }

    /// Starts `job` on its own task and returns immediately.
    ///
    /// `slot` is held for the lifetime of the worker and dropped exactly once.
    pub fn start(
        &self,
        job: Job,
        resume: Option<Arc<CheckpointState>>,
        slot: RunningSlot,
        observer: Arc<dyn ExecutionObserver>,
    ) -> ExecutionHandle {
        let job_id = job.id.clone();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let handle = ExecutionHandle { job_id: job_id.clone(), cancel: cancel.clone(), done: done_rx };
        self.handles.lock().insert(job_id.clone(), handle.clone());

        let trainer = Arc::clone(&self.trainer);
        let checkpoints = Arc::clone(&self.checkpoints);
        let handles = Arc::clone(&self.handles);

        tokio::spawn(async move {
            info!(job_id = %job_id, trainer = trainer.id(), resume = resume.is_some(), "Worker started");

            let run = {
                let job = job.clone();
                let cancel = cancel.clone();
                let observer = Arc::clone(&observer);
                tokio::spawn(async move {
                    let sink = ObserverSink { observer };
                    let writer = checkpoints.writer(job.id.clone());
                    trainer.prepare(&job).await?;
                    trainer
                        .run(RunContext {
                            job: &job,
                            resume: resume.as_deref(),
                            progress: &sink,
                            checkpoints: &writer,
                            cancel: &cancel,
                        })
                        .await
                })
            };
            let abort = run.abort_handle();

            let result = tokio::select! {
                joined = run => match joined {
                    Ok(Ok(outcome)) => ExecutionResult::Succeeded(outcome),
                    Ok(Err(TrainingError::Cancelled)) => ExecutionResult::Cancelled,
                    Ok(Err(e)) if cancel.is_cancelled() => {
                        debug!(job_id = %job_id, error = %e, "Run failed after cancellation");
                        ExecutionResult::Cancelled
                    }
                    Ok(Err(e)) => ExecutionResult::Failed(e.to_string()),
                    Err(join) if join.is_panic() => {
                        let message = panic_message(join.into_panic());
                        error!(job_id = %job_id, panic = %message, "Worker panicked");
                        ExecutionResult::Failed(format!("worker panicked: {message}"))
                    }
                    Err(_) => ExecutionResult::Cancelled,
                },
                () = cancel.cancelled() => {
                    abort.abort();
                    ExecutionResult::Cancelled
                }
            };

            debug!(job_id = %job_id, result = ?result, "Worker finished");
            observer.on_finished(&job, result).await;
            handles.lock().remove(&job_id);
            drop(slot);
            let _ = done_tx.send(true);
        });

        handle
    }

    /// Signals cancellation. Returns the handle to wait on, or `None` if the
    /// job is not running here.
    pub fn cancel(&self, job_id: &JobId) -> Option<ExecutionHandle> {
        let handle = self.handles.lock().get(job_id).cloned()?;
        info!(job_id = %job_id, "Cancelling running job");
        handle.cancel();
        Some(handle)
    }

    /// Signals cancellation to every running job.
    pub fn cancel_all(&self) -> Vec<ExecutionHandle> {
        let handles: Vec<ExecutionHandle> = self.handles.lock().values().cloned().collect();
        for handle in &handles {
            handle.cancel();
        }
        handles
    }

    /// Whether a cancel has been signalled to the job's worker that is still
    /// reporting its outcome.
    #[must_use]
    pub fn cancel_requested(&self, job_id: &JobId) -> bool {
        self.handles.lock().get(job_id).is_some_and(|handle| handle.cancel.is_cancelled())
    }

    #[must_use]
    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.handles.lock().contains_key(job_id)
    }

    #[must_use]
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.handles.lock().keys().cloned().collect()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("trainer", &self.trainer.id())
            .field("active", &self.handles.lock().len())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobQueue;
    use cobalt_training::{NewJob, SimulatedTrainer, SimulationPlan};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        steps: Mutex<usize>,
        results: Mutex<Vec<(JobId, ExecutionResult)>>,
    }

    #[async_trait]
    impl ExecutionObserver for Recorder {
        fn on_progress(&self, event: ProgressEvent) {
            if matches!(event, ProgressEvent::Step { .. }) {
                *self.steps.lock() += 1;
            }
        }

        async fn on_finished(&self, job: &Job, result: ExecutionResult) {
            self.results.lock().push((job.id.clone(), result));
        }
    }

    fn setup(plan: SimulationPlan) -> (WorkerPool, Arc<JobQueue>, Arc<Recorder>, TempDir) {
        let dir = TempDir::new().unwrap();
        let checkpoints = Arc::new(CheckpointStore::with_defaults(dir.path().to_path_buf()));
        let pool = WorkerPool::new(Arc::new(SimulatedTrainer::new(plan)), checkpoints);
        (pool, Arc::new(JobQueue::new(2)), Arc::new(Recorder::default()), dir)
    }

    fn job(name: &str) -> Job {
        Job::from_request(JobId::from(name), NewJob::new(name))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_reports_and_releases_slot() {
        let (pool, queue, recorder, _dir) = setup(SimulationPlan::default().with_steps_per_epoch(3));
        let job = job("a");
        let slot = queue.try_acquire_slot(&job.id).unwrap();

        let mut handle = pool.start(job, None, slot, recorder.clone());
        handle.finished().await;

        assert_eq!(queue.running_count(), 0);
        assert!(!pool.is_active(&JobId::from("a")));
        assert_eq!(*recorder.steps.lock(), 3);
        let results = recorder.results.lock();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].1, ExecutionResult::Succeeded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_and_releases_slot() {
        let plan = SimulationPlan::default().with_step_delay(Duration::from_secs(3600));
        let (pool, queue, recorder, _dir) = setup(plan);
        let job = job("a");
        let slot = queue.try_acquire_slot(&job.id).unwrap();
        let _handle = pool.start(job, None, slot, recorder.clone());
        tokio::task::yield_now().await;
        assert_eq!(queue.running_count(), 1);

        assert!(!pool.cancel_requested(&JobId::from("a")));
        let mut handle = pool.cancel(&JobId::from("a")).unwrap();
        assert!(pool.cancel_requested(&JobId::from("a")));
        tokio::time::timeout(Duration::from_secs(10), handle.finished()).await.unwrap();

        assert!(!pool.cancel_requested(&JobId::from("a")));
        assert_eq!(queue.running_count(), 0);
        assert_eq!(recorder.results.lock()[0].1, ExecutionResult::Cancelled);
        assert!(pool.cancel(&JobId::from("a")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_reported_as_failure() {
        let (pool, queue, recorder, _dir) = setup(SimulationPlan::default().with_panic_on_attempt(1));
        let job = job("a");
        let slot = queue.try_acquire_slot(&job.id).unwrap();

        let mut handle = pool.start(job, None, slot, recorder.clone());
        handle.finished().await;

        assert_eq!(queue.running_count(), 0);
        match &recorder.results.lock()[0].1 {
            ExecutionResult::Failed(message) => assert!(message.contains("panicked")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trainer_error_text_is_preserved() {
        let plan = SimulationPlan::default().with_failures(vec!["CUDA out of memory".into()]);
        let (pool, queue, recorder, _dir) = setup(plan);
        let job = job("a");
        let slot = queue.try_acquire_slot(&job.id).unwrap();

        let mut handle = pool.start(job, None, slot, recorder.clone());
        handle.finished().await;

        match &recorder.results.lock()[0].1 {
            ExecutionResult::Failed(message) => assert!(message.contains("CUDA out of memory")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
