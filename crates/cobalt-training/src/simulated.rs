//! Deterministic trainer that fakes a training loop.
//!
//! Used by the CLI's `run` command and by tests. Behaviour is scripted per job
//! name through [`SimulationPlan`]: loss curve, per-attempt failures, panics and
//! step pacing.

use crate::checkpoint::CheckpointWriter;
use crate::error::{TrainingError, TrainingResult};
use crate::job::{Job, JobId, TrainingConfig};
use crate::progress::{ProgressEvent, ProgressUpdate};
use crate::trainer::{RunContext, Trainer, TrainingMetrics, TrainingOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationPlan {
    /// Overrides `config.epochs` when set.
    #[serde(default)]
    pub epochs: Option<u32>,
    #[serde(default = "default_steps_per_epoch")]
    pub steps_per_epoch: u64,
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    #[serde(default = "default_initial_loss")]
    pub initial_loss: f64,
    #[serde(default = "default_decay")]
    pub decay: f64,
    /// Explicit loss per step; the last value repeats once exhausted.
    #[serde(default)]
    pub losses: Vec<f64>,
    /// Error raised on attempt `i + 1`; attempts past the list succeed.
    #[serde(default)]
    pub failures: Vec<String>,
    /// Steps completed in a failing attempt before the error is raised.
    #[serde(default = "default_fail_after_steps")]
    pub fail_after_steps: u64,
    #[serde(default = "default_true")]
    pub checkpoint_every_epoch: bool,
    /// Panic inside the run on this attempt (1-based).
    #[serde(default)]
    pub panic_on_attempt: Option<u32>,
}

const fn default_steps_per_epoch() -> u64 {
    10
}

const fn default_step_delay_ms() -> u64 {
    10
}

const fn default_initial_loss() -> f64 {
    2.0
}

const fn default_decay() -> f64 {
    0.95
}

const fn default_fail_after_steps() -> u64 {
    1
}

const fn default_true() -> bool {
    true
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            epochs: None,
            steps_per_epoch: default_steps_per_epoch(),
            step_delay_ms: default_step_delay_ms(),
            initial_loss: default_initial_loss(),
            decay: default_decay(),
            losses: Vec::new(),
            failures: Vec::new(),
            fail_after_steps: default_fail_after_steps(),
            checkpoint_every_epoch: true,
            panic_on_attempt: None,
        }
    }
}

impl SimulationPlan {
    #[must_use]
    pub fn with_failures(mut self, failures: Vec<String>) -> Self {
        self.failures = failures;
        self
    }

    #[must_use]
    pub fn with_losses(mut self, losses: Vec<f64>) -> Self {
        self.losses = losses;
        self
    }

    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_steps_per_epoch(mut self, steps: u64) -> Self {
        self.steps_per_epoch = steps.max(1);
        self
    }

    #[must_use]
    pub fn with_panic_on_attempt(mut self, attempt: u32) -> Self {
        self.panic_on_attempt = Some(attempt);
        self
    }

    fn loss_at(&self, index: u64) -> f64 {
        if let Some(last) = self.losses.last() {
            return self.losses.get(index as usize).copied().unwrap_or(*last);
        }
        self.initial_loss * self.decay.powi(index.min(i32::MAX as u64) as i32)
    }
}

struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct SimulatedTrainer {
    default_plan: SimulationPlan,
    plans: HashMap<String, SimulationPlan>,
    attempts: Mutex<HashMap<JobId, u32>>,
    observed: Mutex<HashMap<JobId, Vec<TrainingConfig>>>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    releases: AtomicUsize,
}

impl SimulatedTrainer {
    #[must_use]
    pub fn new(default_plan: SimulationPlan) -> Self {
        Self { default_plan, ..Self::default() }
    }

    /// Scripts the behaviour for jobs with the given name.
    #[must_use]
    pub fn with_plan(mut self, job_name: impl Into<String>, plan: SimulationPlan) -> Self {
        self.plans.insert(job_name.into(), plan);
        self
    }

    #[must_use]
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of times `run` was entered for a job.
    pub fn attempts(&self, job_id: &JobId) -> u32 {
        self.attempts.lock().get(job_id).copied().unwrap_or(0)
    }

    /// Configs seen on each attempt, in order.
    pub fn observed_configs(&self, job_id: &JobId) -> Vec<TrainingConfig> {
        self.observed.lock().get(job_id).cloned().unwrap_or_default()
    }

    pub fn active_runs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous runs observed.
    pub fn peak_active_runs(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn resource_releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn plan_for(&self, job: &Job) -> &SimulationPlan {
        self.plans.get(&job.name).unwrap_or(&self.default_plan)
    }

    fn begin_attempt(&self, job: &Job) -> u32 {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let entry = attempts.entry(job.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        self.observed.lock().entry(job.id.clone()).or_default().push(job.config.clone());
        attempt
    }
}

#[async_trait]
impl Trainer for SimulatedTrainer {
    fn id(&self) -> &'static str {
        "simulated"
    }

    async fn run(&self, ctx: RunContext<'_>) -> TrainingResult<TrainingOutcome> {
        let job = ctx.job;
        let plan = self.plan_for(job).clone();
        let attempt = self.begin_attempt(job);

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveGuard { active: &self.active };

        ctx.progress.on_event(ProgressEvent::Started { job_id: job.id.clone() });
        assert!(plan.panic_on_attempt != Some(attempt), "simulated trainer panic on attempt {attempt}");

        let failure = plan.failures.get(attempt as usize - 1).cloned();
        let steps_per_epoch = plan.steps_per_epoch.max(1);
        let epochs = plan.epochs.unwrap_or(job.config.epochs).max(1);
        let total_steps = u64::from(epochs) * steps_per_epoch;
        let start_step = ctx.resume.map_or(job.config.resume_step, |state| state.step);
        let delay = Duration::from_millis(plan.step_delay_ms);
        debug!(job_id = %job.id, attempt, start_step, total_steps, "Simulated run starting");

        let mut last_loss = None;
        let mut steps_this_attempt = 0;
        for step in (start_step + 1)..=total_steps {
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(TrainingError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }

            let epoch = ((step - 1) / steps_per_epoch) as u32;
            let loss = plan.loss_at(step - 1);
            last_loss = Some(loss);
            steps_this_attempt += 1;
            ctx.progress.on_event(ProgressEvent::Step {
                job_id: job.id.clone(),
                update: ProgressUpdate::new(epoch, step, total_steps)
                    .with_train_loss(loss)
                    .with_throughput(f64::from(job.config.batch_size) * 128.0),
            });

            if plan.checkpoint_every_epoch && step % steps_per_epoch == 0 {
                let payload = serde_json::to_vec(&serde_json::json!({ "step": step, "loss": loss }))?;
                ctx.checkpoints.save(epoch, step, &payload)?;
            }

            if let Some(message) = &failure {
                if steps_this_attempt >= plan.fail_after_steps {
                    return Err(TrainingError::Trainer(message.clone()));
                }
            }
        }

        if let Some(message) = failure {
            return Err(TrainingError::Trainer(message));
        }

        ctx.progress.on_event(ProgressEvent::Finished { job_id: job.id.clone() });
        Ok(TrainingOutcome {
            artifact_path: Some(PathBuf::from(format!("artifacts/{}/model.bin", job.id))),
            metrics: TrainingMetrics {
                train_loss: last_loss,
                eval_loss: None,
                steps: Some(total_steps),
            },
        })
    }

    async fn release_resources(&self) -> TrainingResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
