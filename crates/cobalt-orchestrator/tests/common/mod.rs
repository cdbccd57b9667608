//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use cobalt_orchestrator::{Orchestrator, OrchestratorConfig, StaticProbe};
use cobalt_training::{Job, JobId, JobStatus, JobStore, SimulatedTrainer};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Generous virtual-time bound for paused-clock tests.
pub const WAIT: Duration = Duration::from_secs(3600);

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub trainer: Arc<SimulatedTrainer>,
    pub probe: Arc<StaticProbe>,
    _dir: TempDir,
}

pub fn config(dir: &TempDir, max_concurrent: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.scheduler.max_concurrent = max_concurrent;
    config.checkpoint.root = dir.path().join("checkpoints");
    config
}

pub fn harness(max_concurrent: usize, trainer: SimulatedTrainer) -> Harness {
    harness_with(trainer, |config| config.scheduler.max_concurrent = max_concurrent)
}

pub fn harness_with(trainer: SimulatedTrainer, tweak: impl FnOnce(&mut OrchestratorConfig)) -> Harness {
    build(trainer, None, tweak)
}

/// Like [`harness_with`], over a caller-supplied job store.
pub fn harness_with_store(
    trainer: SimulatedTrainer,
    store: Arc<dyn JobStore>,
    tweak: impl FnOnce(&mut OrchestratorConfig),
) -> Harness {
    build(trainer, Some(store), tweak)
}

fn build(
    trainer: SimulatedTrainer,
    store: Option<Arc<dyn JobStore>>,
    tweak: impl FnOnce(&mut OrchestratorConfig),
) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 2);
    tweak(&mut config);

    let trainer = trainer.into_shared();
    let probe = Arc::new(StaticProbe::idle());
    let mut builder = Orchestrator::builder().config(config).with_trainer(trainer.clone()).with_probe(probe.clone());
    if let Some(store) = store {
        builder = builder.with_store(store);
    }
    let orchestrator = builder.build().unwrap();
    Harness { orchestrator, trainer, probe, _dir: dir }
}

impl Harness {
    pub async fn job(&self, id: &JobId) -> Job {
        self.orchestrator.store().get(id).await.unwrap()
    }

    /// Polls until the job reaches `status`.
    pub async fn wait_for_status(&self, id: &JobId, status: JobStatus) -> Job {
        tokio::time::timeout(WAIT, async {
            loop {
                let job = self.job(id).await;
                if job.status == status {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never reached {status}"))
    }

    pub async fn wait_terminal(&self, id: &JobId) -> Job {
        self.orchestrator.wait_until_terminal(id, WAIT).await.unwrap()
    }
}
