use crate::job::{JobId, JobStatus};
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition { job_id: JobId, from: JobStatus, to: JobStatus },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("trainer error: {0}")]
    Trainer(String),

    #[error("training cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
