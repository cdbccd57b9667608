use crate::job::JobId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A single progress report from a running trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub epoch: u32,
    pub step: u64,
    pub total_steps: u64,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
    pub tokens_per_second: Option<f64>,
}

impl ProgressUpdate {
    #[must_use]
    pub fn new(epoch: u32, step: u64, total_steps: u64) -> Self {
        Self { epoch, step, total_steps, train_loss: None, val_loss: None, tokens_per_second: None }
    }

    #[must_use]
    pub fn with_train_loss(mut self, loss: f64) -> Self {
        self.train_loss = Some(loss);
        self
    }

    #[must_use]
    pub fn with_val_loss(mut self, loss: f64) -> Self {
        self.val_loss = Some(loss);
        self
    }

    #[must_use]
    pub fn with_throughput(mut self, tokens_per_second: f64) -> Self {
        self.tokens_per_second = Some(tokens_per_second);
        self
    }

    /// Completed fraction in `[0, 1]`; zero when the total is unknown.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.step as f64 / self.total_steps as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { job_id: JobId },
    Message { job_id: JobId, message: String },
    Step { job_id: JobId, update: ProgressUpdate },
    Finished { job_id: JobId },
}

impl ProgressEvent {
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Started { job_id }
            | Self::Message { job_id, .. }
            | Self::Step { job_id, .. }
            | Self::Finished { job_id } => job_id,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Sink that only logs events.
#[derive(Debug, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id } => info!(job_id = %job_id, "Training started"),
            ProgressEvent::Message { job_id, message } => info!(job_id = %job_id, "{message}"),
            ProgressEvent::Step { job_id, update } => debug!(
                job_id = %job_id,
                epoch = update.epoch,
                step = update.step,
                total = update.total_steps,
                loss = ?update.train_loss,
                "Training step"
            ),
            ProgressEvent::Finished { job_id } => info!(job_id = %job_id, "Training finished"),
        }
    }
}
