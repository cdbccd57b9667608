use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Identifier for a training job, assigned by the job store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scheduling priority. Lower urgency rank is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    #[must_use]
    pub const fn urgency_rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Priority {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(TrainingError::InvalidConfig(format!("unknown priority: {other}"))),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
    Stopped,
}

impl JobStatus {
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Stopped,
    ];

    /// Checks whether `self -> to` is a legal lifecycle transition.
    ///
    /// `Failed` is terminal for automation; the only ways out are operator
    /// re-submission (`Queued`) and operator-invoked recovery (`Retrying`).
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Pending, Self::Queued | Self::Cancelled) => true,
            (Self::Queued, Self::Running | Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Retrying | Self::Failed | Self::Stopped) => {
                true
            }
            (Self::Retrying, Self::Queued | Self::Failed | Self::Cancelled) => true,
            (Self::Failed, Self::Queued | Self::Retrying) => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Stopped)
    }

    /// States from which `enqueue` is accepted.
    #[must_use]
    pub const fn is_enqueueable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Parameters forwarded to the trainer.
///
/// Only the typed fields are ever touched by the orchestrator (during
/// recovery); `extra` is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    /// Epoch to resume from (set by checkpoint recovery).
    #[serde(default)]
    pub resume_epoch: u32,
    /// Step to resume from (set by checkpoint recovery).
    #[serde(default)]
    pub resume_step: u64,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

const fn default_epochs() -> u32 {
    1
}

const fn default_batch_size() -> u32 {
    32
}

const fn default_learning_rate() -> f64 {
    2e-5
}

const fn default_dropout() -> f64 {
    0.1
}

/// Upper bound applied when recovery raises dropout.
pub const MAX_DROPOUT: f64 = 0.5;

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            dropout: default_dropout(),
            resume_epoch: 0,
            resume_step: 0,
            extra: serde_json::Map::new(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidConfig("epochs must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidConfig("learning_rate must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainingError::InvalidConfig("dropout must be in [0, 1)".to_string()));
        }
        Ok(())
    }

    /// Halves the batch size, never going below 1. Returns the new value.
    pub fn halve_batch_size(&mut self) -> u32 {
        self.batch_size = (self.batch_size / 2).max(1);
        self.batch_size
    }

    /// Halves the learning rate and raises dropout by 0.1 (capped).
    pub fn reconfigure_for_stability(&mut self) {
        self.learning_rate /= 2.0;
        self.dropout = (self.dropout + 0.1).min(MAX_DROPOUT);
    }

    pub fn resume_from(&mut self, epoch: u32, step: u64) {
        self.resume_epoch = epoch;
        self.resume_step = step;
    }
}

/// Request to register a new job with the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub config: TrainingConfig,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NewJob {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Priority::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            config: TrainingConfig::default(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: TrainingConfig) -> Self {
        self.config = config;
        self
    }
}

/// Durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config: TrainingConfig,
    pub error_message: Option<String>,
    pub artifact_path: Option<PathBuf>,
    /// Checkpoint the next run resumes from, if any.
    pub checkpoint_path: Option<PathBuf>,
}

impl Job {
    #[must_use]
    pub fn from_request(id: JobId, request: NewJob) -> Self {
        Self {
            id,
            name: request.name,
            status: JobStatus::Pending,
            priority: request.priority,
            retry_count: 0,
            max_retries: request.max_retries,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            config: request.config,
            error_message: None,
            artifact_path: None,
            checkpoint_path: None,
        }
    }

    #[must_use]
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
