//! Run command implementation.
//!
//! Registers every manifest job, lets the orchestrator schedule them and
//! waits until each one is terminal.

use crate::manifest::Manifest;
use anyhow::{Context, Result};
use cobalt_orchestrator::{JobReport, MonitorEvent, Orchestrator, Severity};
use cobalt_training::{JobStatus, SimulatedTrainer};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct RunOptions {
    pub manifest: PathBuf,
    pub config: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub json: bool,
}

pub async fn execute(options: RunOptions) -> Result<()> {
    let mut config = super::load_config(options.config.as_deref())?;
    if let Some(dir) = options.checkpoint_dir {
        config.checkpoint.root = dir;
    }
    let manifest = Manifest::load(&options.manifest)?;
    let default_retries = config.retry.max_retries;

    let trainer: Arc<SimulatedTrainer> = manifest.trainer().into_shared();
    let orchestrator = Orchestrator::builder()
        .config(config)
        .with_trainer(trainer)
        .build()
        .context("Failed to build orchestrator")?;

    let printer = (!options.json).then(|| spawn_event_printer(orchestrator.subscribe()));
    orchestrator.start()?;

    let mut ids = Vec::new();
    for request in manifest.requests(default_retries) {
        let name = request.name.clone();
        let job = orchestrator
            .submit_and_enqueue(request)
            .await
            .with_context(|| format!("Failed to queue job {name}"))?;
        ids.push(job.id);
    }

    let timeout = Duration::from_secs(options.timeout_secs);
    let mut reports = Vec::with_capacity(ids.len());
    for id in &ids {
        orchestrator.wait_until_terminal(id, timeout).await?;
        reports.push(orchestrator.job_status(id).await?);
    }
    orchestrator.shutdown().await?;
    if let Some(printer) = printer {
        printer.abort();
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_summary(&orchestrator, &reports);
    }
    Ok(())
}

fn spawn_event_printer(mut events: broadcast::Receiver<MonitorEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MonitorEvent::StatusChanged { job_id, to, .. }) => {
                    println!("  {} {} {}", job_id.to_string().dimmed(), "->".dimmed(), colored_status(to));
                }
                Ok(MonitorEvent::Alert(alert)) => {
                    let label = match alert.severity {
                        Severity::Warning => "warning".yellow(),
                        Severity::Error => "error".red(),
                        Severity::Critical => "critical".red().bold(),
                    };
                    println!("  {label}: {}", alert.message);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn colored_status(status: JobStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        JobStatus::Completed => text.green(),
        JobStatus::Failed => text.red(),
        JobStatus::Retrying => text.yellow(),
        JobStatus::Cancelled | JobStatus::Stopped => text.dimmed(),
        _ => text.cyan(),
    }
}

fn print_summary(orchestrator: &Orchestrator, reports: &[JobReport]) {
    println!();
    println!("{}", "Summary".bold().cyan());
    for report in reports {
        let job = &report.job;
        println!(
            "  {:<20} {:<10} retries {}/{}  batch {}",
            job.name,
            colored_status(job.status),
            job.retry_count,
            job.max_retries,
            job.config.batch_size
        );
        for record in &report.recoveries {
            println!(
                "    {} attempt {}: {} -> {} ({})",
                "recovery".dimmed(),
                record.attempt,
                record.failure_type,
                record.strategy,
                record.message
            );
        }
        if let Some(error) = &job.error_message {
            println!("    {} {}", "error:".red(), error);
        }
    }

    let status = orchestrator.status();
    println!();
    println!(
        "  completed {}  failed {}  retries {}  alerts {}",
        status.completed_count.to_string().green(),
        status.failed_count.to_string().red(),
        status.stats.retries,
        status.stats.alerts
    );
}
