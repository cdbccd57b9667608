//! Checkpoints command implementation.

use anyhow::Context;
use cobalt_training::{CheckpointStore, JobId};
use colored::Colorize;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Lists a job's checkpoints, oldest first, with an integrity flag each.
pub fn execute(job: &str, dir: Option<PathBuf>, config: Option<&Path>, json_output: bool) -> anyhow::Result<()> {
    let root = match dir {
        Some(dir) => dir,
        None => super::load_config(config)?.checkpoint.root,
    };
    let store = CheckpointStore::with_defaults(root.clone());
    let job_id = JobId::from(job);
    let metas = store
        .list(&job_id)
        .with_context(|| format!("Failed to list checkpoints under {}", root.display()))?;

    if json_output {
        let entries: Vec<_> = metas
            .iter()
            .map(|meta| {
                json!({
                    "sequence": meta.sequence,
                    "epoch": meta.epoch,
                    "step": meta.step,
                    "path": meta.path,
                    "size_bytes": meta.size_bytes,
                    "created_at": meta.created_at,
                    "valid": store.verify_integrity(&meta.path),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json!({ "job_id": job_id, "checkpoints": entries }))?);
        return Ok(());
    }

    if metas.is_empty() {
        println!("{}", format!("No checkpoints for job {job_id}").yellow());
        return Ok(());
    }

    println!("{} {}", "Checkpoints for".bold(), job_id.to_string().cyan());
    for meta in &metas {
        let status =
            if store.verify_integrity(&meta.path) { "ok".green() } else { "corrupt".red() };
        println!(
            "  #{:<4} epoch {:<3} step {:<8} {:>10} B  {}  {}",
            meta.sequence,
            meta.epoch,
            meta.step,
            meta.size_bytes,
            status,
            meta.path.display().to_string().dimmed()
        );
    }
    Ok(())
}
