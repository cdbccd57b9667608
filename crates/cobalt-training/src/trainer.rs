use crate::checkpoint::{CheckpointState, CheckpointWriter};
use crate::error::TrainingResult;
use crate::job::Job;
use crate::progress::ProgressSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TrainingMetrics {
    pub train_loss: Option<f64>,
    pub eval_loss: Option<f64>,
    pub steps: Option<u64>,
}

/// What a successful run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingOutcome {
    /// Opaque artifact location, recorded on the job as-is.
    pub artifact_path: Option<PathBuf>,
    pub metrics: TrainingMetrics,
}

/// Everything a trainer gets for one execution.
pub struct RunContext<'a> {
    pub job: &'a Job,
    /// State to resume from, when recovery restarted from a checkpoint.
    pub resume: Option<&'a CheckpointState>,
    pub progress: &'a dyn ProgressSink,
    pub checkpoints: &'a dyn CheckpointWriter,
    /// Cooperative cancellation; the worker also drops the run future on cancel.
    pub cancel: &'a CancellationToken,
}

/// Pluggable executor for the numeric training work.
///
/// Errors should carry classification-ready text (e.g. "CUDA out of memory")
/// rather than raw backtraces.
#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    async fn prepare(&self, job: &Job) -> TrainingResult<()> {
        job.config.validate()
    }

    async fn run(&self, ctx: RunContext<'_>) -> TrainingResult<TrainingOutcome>;

    /// Frees accelerator memory and similar process resources.
    async fn release_resources(&self) -> TrainingResult<()> {
        Ok(())
    }
}
