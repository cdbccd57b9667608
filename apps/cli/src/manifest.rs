//! Job manifest for `cobalt run`.
//!
//! ```toml
//! [simulation]            # default plan for every job
//! steps_per_epoch = 5
//!
//! [[jobs]]
//! name = "bert-base"
//! priority = "high"
//! max_retries = 2
//!
//! [jobs.config]
//! epochs = 2
//! batch_size = 32
//!
//! [jobs.simulation]       # overrides the default plan for this job
//! failures = ["CUDA out of memory"]
//! ```

use anyhow::{Context, Result, bail};
use cobalt_training::{NewJob, Priority, SimulatedTrainer, SimulationPlan, TrainingConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub simulation: SimulationPlan,
    #[serde(default)]
    pub jobs: Vec<ManifestJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestJob {
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    /// Falls back to `[retry] max_retries` from the orchestrator config.
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub config: TrainingConfig,
    pub simulation: Option<SimulationPlan>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(contents)?;
        if manifest.jobs.is_empty() {
            bail!("manifest declares no jobs");
        }
        let mut names = HashSet::new();
        for job in &manifest.jobs {
            if !names.insert(job.name.as_str()) {
                bail!("duplicate job name: {}", job.name);
            }
            job.config.validate().with_context(|| format!("job {}", job.name))?;
        }
        Ok(manifest)
    }

    /// Simulated trainer scripted with every plan in the manifest.
    pub fn trainer(&self) -> SimulatedTrainer {
        self.jobs.iter().fold(SimulatedTrainer::new(self.simulation.clone()), |trainer, job| {
            match &job.simulation {
                Some(plan) => trainer.with_plan(job.name.clone(), plan.clone()),
                None => trainer,
            }
        })
    }

    pub fn requests(&self, default_max_retries: u32) -> Vec<NewJob> {
        self.jobs
            .iter()
            .map(|job| {
                NewJob::new(job.name.clone())
                    .with_priority(job.priority)
                    .with_max_retries(job.max_retries.unwrap_or(default_max_retries))
                    .with_config(job.config.clone())
            })
            .collect()
    }
}
