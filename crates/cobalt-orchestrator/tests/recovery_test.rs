//! Retry and recovery tests under a paused clock.

mod common;

use cobalt_orchestrator::{FailureClass, FailureType, RecoveryStrategy, Severity};
use cobalt_training::{JobStatus, NewJob, SimulatedTrainer, SimulationPlan, TrainingConfig};
use common::{harness, harness_with};
use std::time::Duration;
use tokio::time::Instant;

const OOM: &str = "CUDA out of memory. Tried to allocate 2.00 GiB";

#[tokio::test(start_paused = true)]
async fn test_oom_retries_halve_batch_size_until_exhausted() {
    let plan = SimulationPlan::default().with_failures(vec![OOM.to_string(); 3]);
    let h = harness(1, SimulatedTrainer::new(SimulationPlan::default()).with_plan("oom", plan));

    let begin = Instant::now();
    h.orchestrator.start().unwrap();
    let job = h
        .orchestrator
        .submit_and_enqueue(NewJob::new("oom").with_max_retries(2))
        .await
        .unwrap();
    let job = h.wait_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.config.batch_size, 8);
    assert!(job.error_message.as_deref().unwrap().contains("out of memory"));
    assert_eq!(h.trainer.attempts(&job.id), 3);
    let batches: Vec<u32> = h.trainer.observed_configs(&job.id).iter().map(|c| c.batch_size).collect();
    assert_eq!(batches, vec![32, 16, 8]);

    // 60s then 120s of backoff
    assert!(begin.elapsed() >= Duration::from_secs(180));
    assert!(begin.elapsed() < Duration::from_secs(240));

    let report = h.orchestrator.job_status(&job.id).await.unwrap();
    let delays: Vec<u64> = report.recoveries.iter().map(|r| r.delay_secs).collect();
    assert_eq!(delays, vec![60, 120]);
    assert!(report.recoveries.iter().all(|r| r.strategy == RecoveryStrategy::ReduceBatchSize));
    assert!(report.recoveries.iter().all(|r| r.failure_type == FailureType::OutOfMemory));

    let status = h.orchestrator.status();
    assert_eq!(status.failed_count, 1);
    assert_eq!(status.stats.retries, 2);

    let history = h.orchestrator.history(Some(&job.id), 1.0);
    assert!(history.alerts.iter().any(|a| a.severity == Severity::Error));
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers_and_completes() {
    let plan = SimulationPlan::default().with_failures(vec!["Connection reset by peer".to_string()]);
    let h = harness(1, SimulatedTrainer::new(SimulationPlan::default()).with_plan("flaky", plan));

    h.orchestrator.start().unwrap();
    let job = h.orchestrator.submit_and_enqueue(NewJob::new("flaky")).await.unwrap();
    let retrying = h.wait_for_status(&job.id, JobStatus::Retrying).await;
    assert_eq!(retrying.retry_count, 1);

    let job = h.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error_message.is_none());

    let report = h.orchestrator.job_status(&job.id).await.unwrap();
    assert_eq!(report.recoveries.len(), 1);
    assert_eq!(report.recoveries[0].strategy, RecoveryStrategy::RetrySame);
    assert_eq!(report.progress, Some(1.0));
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_model_loading_failure_restarts_from_checkpoint() {
    let plan = SimulationPlan {
        steps_per_epoch: 5,
        fail_after_steps: 7,
        failures: vec!["failed to load model weights: missing key in state_dict".to_string()],
        ..SimulationPlan::default()
    };
    let h = harness(1, SimulatedTrainer::new(SimulationPlan::default()).with_plan("resume", plan));

    h.orchestrator.start().unwrap();
    let config = TrainingConfig { epochs: 3, ..TrainingConfig::default() };
    let job = h
        .orchestrator
        .submit_and_enqueue(NewJob::new("resume").with_config(config))
        .await
        .unwrap();
    let job = h.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let report = h.orchestrator.job_status(&job.id).await.unwrap();
    assert_eq!(report.recoveries[0].failure_type, FailureType::ModelLoadingError);
    assert_eq!(report.recoveries[0].strategy, RecoveryStrategy::RestartFromCheckpoint);

    let configs = h.trainer.observed_configs(&job.id);
    assert_eq!(configs.len(), 2);
    assert_eq!(configs[1].resume_step, 5);
    assert!(job.checkpoint_path.is_some());
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_configuration_failure_escalates_without_retry() {
    let plan = SimulationPlan::default().with_failures(vec!["No space left on device".to_string()]);
    let h = harness(1, SimulatedTrainer::new(SimulationPlan::default()).with_plan("full", plan));

    h.orchestrator.start().unwrap();
    let job = h.orchestrator.submit_and_enqueue(NewJob::new("full")).await.unwrap();
    let job = h.wait_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(h.trainer.attempts(&job.id), 1);
    let history = h.orchestrator.history(Some(&job.id), 1.0);
    assert!(history.alerts.iter().any(|a| a.severity == Severity::Critical));

    let analysis = h.orchestrator.analyze_failure(&job.id).await.unwrap();
    assert_eq!(analysis.failure_type, FailureType::DiskFull);
    assert_eq!(analysis.class, FailureClass::ResourceExhaustion);
    assert_eq!(analysis.candidates[0].strategy, RecoveryStrategy::ManualIntervention);
    assert!(!analysis.suggestions.is_empty());
    // analysis is read-only
    assert_eq!(h.job(&job.id).await.status, JobStatus::Failed);

    let outcome = h.orchestrator.attempt_recovery(&job.id, None).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(h.job(&job.id).await.status, JobStatus::Failed);
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_operator_recovery_and_resubmission_of_failed_job() {
    let plan = SimulationPlan::default().with_failures(vec!["No space left on device".to_string()]);
    let h = harness(1, SimulatedTrainer::new(SimulationPlan::default()).with_plan("full", plan));
    h.orchestrator.start().unwrap();

    // forced strategy after the operator freed disk
    let job = h.orchestrator.submit_and_enqueue(NewJob::new("full")).await.unwrap();
    h.wait_for_status(&job.id, JobStatus::Failed).await;
    let outcome = h.orchestrator.attempt_recovery(&job.id, Some(RecoveryStrategy::RetrySame)).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.delay_secs, Some(60));
    assert_eq!(h.job(&job.id).await.status, JobStatus::Retrying);
    assert_eq!(h.wait_terminal(&job.id).await.status, JobStatus::Completed);

    // plain re-submission resets the retry budget
    let plan_job = h.orchestrator.submit_and_enqueue(NewJob::new("full")).await.unwrap();
    let failed = h.wait_for_status(&plan_job.id, JobStatus::Failed).await;
    assert!(failed.error_message.is_some());
    assert!(h.orchestrator.enqueue(&plan_job.id, None).await.unwrap().success);
    let requeued = h.job(&plan_job.id).await;
    assert_eq!(requeued.retry_count, 0);
    assert!(requeued.error_message.is_none());
    assert_eq!(h.wait_terminal(&plan_job.id).await.status, JobStatus::Completed);
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_operator_recovery_refused_after_budget_spent() {
    let plan = SimulationPlan::default().with_failures(vec![OOM.to_string(); 2]);
    let h = harness(1, SimulatedTrainer::new(SimulationPlan::default()).with_plan("oom", plan));
    h.orchestrator.start().unwrap();

    let job = h
        .orchestrator
        .submit_and_enqueue(NewJob::new("oom").with_max_retries(1))
        .await
        .unwrap();
    assert_eq!(h.wait_terminal(&job.id).await.status, JobStatus::Failed);

    let outcome = h.orchestrator.attempt_recovery(&job.id, None).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.strategy.is_none());
    assert_eq!(h.trainer.attempts(&job.id), 2);
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_trainer_is_retried() {
    let plan = SimulationPlan::default().with_panic_on_attempt(1);
    let h = harness_with(SimulatedTrainer::new(SimulationPlan::default()).with_plan("panics", plan), |c| {
        c.scheduler.max_concurrent = 1;
        c.retry.base_delay_secs = 5;
    });
    h.orchestrator.start().unwrap();

    let job = h.orchestrator.submit_and_enqueue(NewJob::new("panics")).await.unwrap();
    let job = h.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(h.orchestrator.status().running_count, 0);
    h.orchestrator.shutdown().await.unwrap();
}
