//! Cobalt Training
//!
//! Job-level primitives shared by the orchestrator and trainers:
//! - Job records, priorities and the status state machine (`Job`, `JobStatus`)
//! - Persistence of job records (`JobStore`)
//! - Durable, verified checkpoints with a bounded state cache (`CheckpointStore`)
//! - The executor seam for the numeric work (`Trainer`)

pub mod cache;
pub mod checkpoint;
pub mod error;
pub mod job;
pub mod layout;
pub mod progress;
pub mod simulated;
pub mod store;
pub mod trainer;

pub use cache::{CacheStats, StateCache};
pub use checkpoint::{CheckpointMeta, CheckpointState, CheckpointStore, CheckpointWriter, JobCheckpointWriter};
pub use error::{TrainingError, TrainingResult};
pub use job::{Job, JobId, JobStatus, NewJob, Priority, TrainingConfig, DEFAULT_MAX_RETRIES};
pub use layout::CheckpointLayout;
pub use progress::{LogProgressSink, ProgressEvent, ProgressSink, ProgressUpdate};
pub use simulated::{SimulatedTrainer, SimulationPlan};
pub use store::{InMemoryJobStore, JobFilter, JobStore, JobUpdate};
pub use trainer::{RunContext, Trainer, TrainingMetrics, TrainingOutcome};
