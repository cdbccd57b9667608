//! Resuming a simulated run from checkpoints written by an earlier process.

use cobalt_training::{
    CheckpointStore, InMemoryJobStore, JobStatus, JobStore, JobUpdate, LogProgressSink, NewJob, RunContext,
    SimulatedTrainer, SimulationPlan, Trainer, TrainingConfig, TrainingError,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_resume_continues_after_last_valid_checkpoint() {
    let temp = TempDir::new().unwrap();
    let jobs = InMemoryJobStore::new();
    let config = TrainingConfig { epochs: 3, ..TrainingConfig::default() };
    let job = jobs.create(NewJob::new("resumable").with_config(config)).await.unwrap();

    let plan = SimulationPlan {
        steps_per_epoch: 4,
        fail_after_steps: 10,
        failures: vec!["NCCL error: unhandled system error".to_string()],
        ..SimulationPlan::default()
    };
    let trainer = SimulatedTrainer::default().with_plan("resumable", plan);
    let cancel = CancellationToken::new();

    {
        let store = Arc::new(CheckpointStore::with_defaults(temp.path().to_path_buf()));
        let writer = store.writer(job.id.clone());
        let err = trainer
            .run(RunContext { job: &job, resume: None, progress: &LogProgressSink, checkpoints: &writer, cancel: &cancel })
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::Trainer(_)));
        assert_eq!(store.list(&job.id).unwrap().len(), 2);
    }

    // a fresh store sees what the previous one wrote
    let store = Arc::new(CheckpointStore::with_defaults(temp.path().to_path_buf()));
    let latest = store.latest_valid(&job.id).unwrap();
    assert_eq!((latest.epoch, latest.step), (1, 8));

    // the newest blob is truncated; resume falls back to the one before it
    std::fs::write(&latest.path, b"").unwrap();
    let resume = store.load(&job.id, None).unwrap();
    assert_eq!(resume.step, 4);

    let mut resumed_config = job.config.clone();
    resumed_config.resume_from(resume.epoch, resume.step);
    let job = jobs.update(&job.id, JobUpdate::new().config(resumed_config)).await.unwrap();

    let writer = store.writer(job.id.clone());
    let outcome = trainer
        .run(RunContext {
            job: &job,
            resume: Some(resume.as_ref()),
            progress: &LogProgressSink,
            checkpoints: &writer,
            cancel: &cancel,
        })
        .await
        .unwrap();
    assert_eq!(outcome.metrics.steps, Some(12));
    assert_eq!(store.latest_valid(&job.id).unwrap().step, 12);
    assert_eq!(trainer.observed_configs(&job.id)[1].resume_step, 4);

    let job = jobs.transition(&job.id, JobStatus::Queued, JobUpdate::new().queued_now()).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
}
