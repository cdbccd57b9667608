//! Classify command implementation.

use cobalt_orchestrator::recovery::{
    CheckpointStatus, FailureClassifier, PatternClassifier, SystemStatus, rank_strategies, suggestions,
};
use cobalt_training::TrainingConfig;
use colored::Colorize;
use serde_json::json;

/// Classifies `error` and ranks strategies for a default job with no
/// checkpoints and no resource pressure.
pub fn execute(error: &str, json_output: bool) -> anyhow::Result<()> {
    let failure = PatternClassifier::new().classify(error);
    let candidates = rank_strategies(
        failure,
        &TrainingConfig::default(),
        SystemStatus::default(),
        &CheckpointStatus::default(),
    );
    let hints = suggestions(failure);

    if json_output {
        let output = json!({
            "failure_type": failure,
            "class": failure.class(),
            "candidates": candidates,
            "suggestions": hints,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{} {}", "Failure type:".bold(), failure.to_string().cyan());
    println!("{} {}", "Class:".bold(), failure.class());
    println!();
    println!("{}", "Strategies:".bold());
    for candidate in &candidates {
        println!(
            "  {:<26} {}",
            candidate.strategy.to_string().green(),
            format!("~{:.0}% success", candidate.estimated_success * 100.0).dimmed()
        );
    }
    println!();
    println!("{}", "Suggestions:".bold());
    for hint in hints {
        println!("  - {hint}");
    }
    Ok(())
}
