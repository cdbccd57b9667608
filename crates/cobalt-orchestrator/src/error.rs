// Error types for orchestration

use cobalt_training::{JobId, TrainingError};
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Job store, checkpoint or trainer failure
    #[error(transparent)]
    Training(#[from] TrainingError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Job exists but is in the wrong state for the operation
    #[error("Job {job_id} cannot be queued: {reason}")]
    NotEnqueueable {
        /// Job ID
        job_id: JobId,
        /// Why the enqueue was refused
        reason: String,
    },

    /// Scheduler loops were already started
    #[error("Orchestrator is already running")]
    AlreadyRunning,

    /// Scheduler loops are not running
    #[error("Orchestrator is not running")]
    NotRunning,

    /// Other error
    #[error("Orchestration error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_errors_are_transparent() {
        let err: OrchestrationError = TrainingError::JobNotFound(JobId::from("job-9")).into();
        assert_eq!(err.to_string(), TrainingError::JobNotFound(JobId::from("job-9")).to_string());
    }
}
