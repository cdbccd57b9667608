//! Job store interface and an in-memory implementation.
//!
//! The store is the durable record of job identity, configuration and status.
//! Implementations must make each call atomic per job row; the orchestrator
//! relies on [`JobStore::transition`] to validate and apply a status change in
//! one step.

use crate::error::{TrainingError, TrainingResult};
use crate::job::{Job, JobId, JobStatus, NewJob, Priority, TrainingConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Field changes applied together with (or without) a status transition.
///
/// `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub priority: Option<Priority>,
    pub error_message: Option<Option<String>>,
    pub config: Option<TrainingConfig>,
    pub artifact_path: Option<PathBuf>,
    pub checkpoint_path: Option<Option<PathBuf>>,
}

impl JobUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn queued_now(mut self) -> Self {
        self.queued_at = Some(Utc::now());
        self
    }

    #[must_use]
    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Utc::now());
        self
    }

    #[must_use]
    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    #[must_use]
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    #[must_use]
    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    #[must_use]
    pub fn config(mut self, config: TrainingConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn artifact(mut self, path: PathBuf) -> Self {
        self.artifact_path = Some(path);
        self
    }

    #[must_use]
    pub fn checkpoint(mut self, path: Option<PathBuf>) -> Self {
        self.checkpoint_path = Some(path);
        self
    }

    fn apply(self, job: &mut Job) {
        if let Some(at) = self.queued_at {
            job.queued_at = Some(at);
        }
        if let Some(at) = self.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(count) = self.retry_count {
            job.retry_count = count;
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(message) = self.error_message {
            job.error_message = message;
        }
        if let Some(config) = self.config {
            job.config = config;
        }
        if let Some(path) = self.artifact_path {
            job.artifact_path = Some(path);
        }
        if let Some(path) = self.checkpoint_path {
            job.checkpoint_path = path;
        }
    }
}

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Option<Vec<JobStatus>>,
    pub priority: Option<Priority>,
}

impl JobFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_status(status: JobStatus) -> Self {
        Self { statuses: Some(vec![status]), priority: None }
    }

    #[must_use]
    pub fn matches(&self, job: &Job) -> bool {
        let status_ok = self.statuses.as_ref().is_none_or(|s| s.contains(&job.status));
        let priority_ok = self.priority.is_none_or(|p| p == job.priority);
        status_ok && priority_ok
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Registers a new job in `Pending` and assigns its id.
    async fn create(&self, request: NewJob) -> TrainingResult<Job>;

    async fn get(&self, id: &JobId) -> TrainingResult<Job>;

    /// Atomically validates `current -> to` and applies `update` with it.
    async fn transition(&self, id: &JobId, to: JobStatus, update: JobUpdate)
    -> TrainingResult<Job>;

    /// Applies field changes without touching the status.
    async fn update(&self, id: &JobId, update: JobUpdate) -> TrainingResult<Job>;

    async fn list(&self, filter: &JobFilter) -> TrainingResult<Vec<Job>>;
}

/// Process-local job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, request: NewJob) -> TrainingResult<Job> {
        request.config.validate()?;
        let job = Job::from_request(JobId::new(), request);
        self.jobs.write().insert(job.id.clone(), job.clone());
        debug!(job_id = %job.id, name = %job.name, "Registered job");
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> TrainingResult<Job> {
        self.jobs.read().get(id).cloned().ok_or_else(|| TrainingError::JobNotFound(id.clone()))
    }

    async fn transition(
        &self,
        id: &JobId,
        to: JobStatus,
        update: JobUpdate,
    ) -> TrainingResult<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id).ok_or_else(|| TrainingError::JobNotFound(id.clone()))?;
        if !job.status.can_transition_to(to) {
            return Err(TrainingError::InvalidTransition {
                job_id: id.clone(),
                from: job.status,
                to,
            });
        }
        debug!(job_id = %id, from = %job.status, to = %to, "Job transition");
        job.status = to;
        update.apply(job);
        Ok(job.clone())
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> TrainingResult<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id).ok_or_else(|| TrainingError::JobNotFound(id.clone()))?;
        update.apply(job);
        Ok(job.clone())
    }

    async fn list(&self, filter: &JobFilter) -> TrainingResult<Vec<Job>> {
        let mut jobs: Vec<Job> =
            self.jobs.read().values().filter(|job| filter.matches(job)).cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_assigns_id_and_pending_status() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new("bert-finetune")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(store.get(&job.id).await.unwrap().name, "bert-finetune");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config() {
        let store = InMemoryJobStore::new();
        let config = TrainingConfig { epochs: 0, ..TrainingConfig::default() };
        assert!(store.create(NewJob::new("bad").with_config(config)).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_validates_and_applies_fields() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new("job")).await.unwrap();

        let queued =
            store.transition(&job.id, JobStatus::Queued, JobUpdate::new().queued_now()).await.unwrap();
        assert_eq!(queued.status, JobStatus::Queued);
        assert!(queued.queued_at.is_some());

        let err = store.transition(&job.id, JobStatus::Completed, JobUpdate::new()).await;
        assert!(matches!(err, Err(TrainingError::InvalidTransition { .. })));
        assert_eq!(store.get(&job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_missing_job_is_reported() {
        let store = InMemoryJobStore::new();
        let missing = JobId::from("nope");
        assert!(matches!(store.get(&missing).await, Err(TrainingError::JobNotFound(_))));
        assert!(store.update(&missing, JobUpdate::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = InMemoryJobStore::new();
        let a = store.create(NewJob::new("a")).await.unwrap();
        store.create(NewJob::new("b").with_priority(Priority::High)).await.unwrap();
        store.transition(&a.id, JobStatus::Queued, JobUpdate::new()).await.unwrap();

        let queued = store.list(&JobFilter::with_status(JobStatus::Queued)).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.id);

        let high = store
            .list(&JobFilter { statuses: None, priority: Some(Priority::High) })
            .await
            .unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(store.list(&JobFilter::all()).await.unwrap().len(), 2);
    }
}
