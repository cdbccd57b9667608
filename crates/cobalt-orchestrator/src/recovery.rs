//! Failure classification and recovery strategy selection.
//!
//! Classification is a best-effort pattern match over the error text; the
//! [`FailureClassifier`] trait keeps it replaceable. Strategy selection is a
//! fixed table per failure type, filtered by what is currently applicable.

use crate::metrics::SystemSample;
use chrono::{DateTime, Utc};
use cobalt_training::{CheckpointMeta, TrainingConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Failure categories, in classification order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    OutOfMemory,
    DiskFull,
    ModelLoadingError,
    DataLoadingError,
    DeviceError,
    NetworkError,
    PermissionError,
    ConfigurationError,
    TrainingDivergence,
    CheckpointCorruption,
    Unknown,
}

impl FailureType {
    pub const ALL: [Self; 11] = [
        Self::OutOfMemory,
        Self::DiskFull,
        Self::ModelLoadingError,
        Self::DataLoadingError,
        Self::DeviceError,
        Self::NetworkError,
        Self::PermissionError,
        Self::ConfigurationError,
        Self::TrainingDivergence,
        Self::CheckpointCorruption,
        Self::Unknown,
    ];

    #[must_use]
    pub const fn class(self) -> FailureClass {
        match self {
            Self::NetworkError | Self::DeviceError | Self::DataLoadingError => FailureClass::Transient,
            Self::OutOfMemory | Self::DiskFull => FailureClass::ResourceExhaustion,
            Self::ModelLoadingError | Self::CheckpointCorruption => FailureClass::Corruption,
            Self::ConfigurationError | Self::PermissionError => FailureClass::Configuration,
            Self::TrainingDivergence => FailureClass::Divergence,
            Self::Unknown => FailureClass::Unknown,
        }
    }

    const fn ordinal(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OutOfMemory => "out_of_memory",
            Self::DiskFull => "disk_full",
            Self::ModelLoadingError => "model_loading_error",
            Self::DataLoadingError => "data_loading_error",
            Self::DeviceError => "device_error",
            Self::NetworkError => "network_error",
            Self::PermissionError => "permission_error",
            Self::ConfigurationError => "configuration_error",
            Self::TrainingDivergence => "training_divergence",
            Self::CheckpointCorruption => "checkpoint_corruption",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Error taxonomy used to explain recovery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    ResourceExhaustion,
    Corruption,
    Configuration,
    Divergence,
    Unknown,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Corruption => "corruption",
            Self::Configuration => "configuration",
            Self::Divergence => "divergence",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetrySame,
    ReduceBatchSize,
    ClearCache,
    RestartFromCheckpoint,
    ReconfigureParameters,
    ManualIntervention,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RetrySame => "retry_same",
            Self::ReduceBatchSize => "reduce_batch_size",
            Self::ClearCache => "clear_cache",
            Self::RestartFromCheckpoint => "restart_from_checkpoint",
            Self::ReconfigureParameters => "reconfigure_parameters",
            Self::ManualIntervention => "manual_intervention",
        };
        f.write_str(s)
    }
}

impl FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "retry_same" => Ok(Self::RetrySame),
            "reduce_batch_size" => Ok(Self::ReduceBatchSize),
            "clear_cache" => Ok(Self::ClearCache),
            "restart_from_checkpoint" => Ok(Self::RestartFromCheckpoint),
            "reconfigure_parameters" => Ok(Self::ReconfigureParameters),
            "manual_intervention" => Ok(Self::ManualIntervention),
            other => Err(format!("unknown recovery strategy: {other}")),
        }
    }
}

pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &str) -> FailureType;
}

/// Case-insensitive regex rules; the first matching type in declaration
/// order wins.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    rules: Vec<(FailureType, Regex)>,
}

const DEFAULT_RULES: &[(FailureType, &str)] = &[
    (FailureType::OutOfMemory, r"out of memory|\boom\b|cuda.*memory|memoryerror|cannot allocate memory|allocation failed"),
    (FailureType::DiskFull, r"no space left|disk (is )?full|disk quota|\benospc\b"),
    (FailureType::ModelLoadingError, r"(error|failed|unable)\b.*\b(loading|load) (the )?model|model.*not found|state_dict|pretrained|missing key"),
    (FailureType::DataLoadingError, r"dataset|dataloader|data loading|load(ing)? data|unicodedecodeerror|corrupt(ed)? (sample|record)"),
    (FailureType::DeviceError, r"\bcuda\b|\bgpu\b|device-side|\bnccl\b|cudnn|\bdevice\b"),
    (FailureType::NetworkError, r"connection|timed? ?out|network|unreachable|\bdns\b|\bhttp\b|socket"),
    (FailureType::PermissionError, r"permission denied|access denied|\beacces\b|not permitted|unauthori[sz]ed|forbidden"),
    (FailureType::ConfigurationError, r"invalid (training )?config|configuration|invalid (value|argument|parameter)|keyerror|missing (required )?(field|parameter)"),
    (FailureType::TrainingDivergence, r"\bnan\b|\binf\b|diverg|exploding|loss (is )?(nan|infinite)"),
    (FailureType::CheckpointCorruption, r"checkpoint.*(corrupt|invalid|truncated|unreadable)|corrupt.*checkpoint|unexpected eof"),
];

impl PatternClassifier {
    #[must_use]
    pub fn new() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(ty, pattern)| compile(pattern).ok().map(|re| (*ty, re)))
            .collect();
        Self { rules }
    }

    /// Adds a pattern for `failure`. Rules stay ordered by failure type, so
    /// an extra pattern never outranks an earlier type.
    pub fn with_pattern(mut self, failure: FailureType, pattern: &str) -> Result<Self, regex::Error> {
        let re = compile(pattern)?;
        let at = self.rules.partition_point(|(ty, _)| ty.ordinal() <= failure.ordinal());
        self.rules.insert(at, (failure, re));
        Ok(self)
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, error: &str) -> FailureType {
        self.rules
            .iter()
            .find(|(_, re)| re.is_match(error))
            .map_or(FailureType::Unknown, |(ty, _)| *ty)
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("(?i){pattern}"))
}

/// Resource pressure at the time of selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub memory_pressure: bool,
    pub disk_pressure: bool,
}

impl SystemStatus {
    #[must_use]
    pub fn from_sample(sample: Option<&SystemSample>, memory_ceiling: f64, disk_ceiling: f64) -> Self {
        sample.map_or_else(Self::default, |s| Self {
            memory_pressure: s.memory_percent > memory_ceiling,
            disk_pressure: s.disk_percent > disk_ceiling,
        })
    }
}

/// What the recovery manager knows about a job's checkpoints and config.
#[derive(Debug, Clone, Default)]
pub struct CheckpointStatus {
    pub latest_valid: Option<CheckpointMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyCandidate {
    pub strategy: RecoveryStrategy,
    /// Position in the failure type's table; lower is preferred.
    pub tier: u8,
    pub estimated_success: f64,
}

struct TableEntry(u8, RecoveryStrategy, f64);

fn strategy_table(failure: FailureType) -> &'static [TableEntry] {
    use RecoveryStrategy::{
        ClearCache, ManualIntervention, ReconfigureParameters, ReduceBatchSize, RestartFromCheckpoint,
        RetrySame,
    };
    match failure {
        FailureType::OutOfMemory => &[TableEntry(0, ReduceBatchSize, 0.75), TableEntry(1, ClearCache, 0.5)],
        FailureType::DiskFull | FailureType::PermissionError | FailureType::ConfigurationError => {
            &[TableEntry(0, ManualIntervention, 1.0)]
        }
        FailureType::ModelLoadingError => {
            &[TableEntry(0, RestartFromCheckpoint, 0.6), TableEntry(0, RetrySame, 0.4)]
        }
        FailureType::DataLoadingError => &[TableEntry(0, RetrySame, 0.5)],
        FailureType::DeviceError => &[TableEntry(0, RetrySame, 0.55), TableEntry(0, ClearCache, 0.45)],
        FailureType::NetworkError => &[TableEntry(0, RetrySame, 0.8)],
        FailureType::TrainingDivergence => {
            &[TableEntry(0, ReconfigureParameters, 0.7), TableEntry(1, RestartFromCheckpoint, 0.5)]
        }
        FailureType::CheckpointCorruption => &[TableEntry(0, RestartFromCheckpoint, 0.6)],
        FailureType::Unknown => &[TableEntry(0, RetrySame, 0.3)],
    }
}

/// Applicable strategies for `failure`, best first. Always ends with
/// `ManualIntervention` when nothing automatic applies.
#[must_use]
pub fn rank_strategies(
    failure: FailureType,
    config: &TrainingConfig,
    system: SystemStatus,
    checkpoint: &CheckpointStatus,
) -> Vec<StrategyCandidate> {
    let mut candidates: Vec<StrategyCandidate> = strategy_table(failure)
        .iter()
        .filter(|TableEntry(_, strategy, _)| match strategy {
            RecoveryStrategy::ReduceBatchSize => config.batch_size > 1,
            RecoveryStrategy::RestartFromCheckpoint => checkpoint.latest_valid.is_some(),
            _ => true,
        })
        .map(|TableEntry(tier, strategy, score)| {
            let mut estimated_success = *score;
            if *strategy == RecoveryStrategy::ClearCache && system.memory_pressure {
                estimated_success += 0.2;
            }
            if system.disk_pressure && *strategy != RecoveryStrategy::ManualIntervention {
                estimated_success *= 0.5;
            }
            StrategyCandidate { strategy: *strategy, tier: *tier, estimated_success }
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.tier.cmp(&b.tier).then_with(|| b.estimated_success.total_cmp(&a.estimated_success))
    });
    if candidates.is_empty() {
        candidates.push(StrategyCandidate {
            strategy: RecoveryStrategy::ManualIntervention,
            tier: u8::MAX,
            estimated_success: 1.0,
        });
    }
    candidates
}

#[must_use]
pub fn select_strategy(
    failure: FailureType,
    config: &TrainingConfig,
    system: SystemStatus,
    checkpoint: &CheckpointStatus,
) -> RecoveryStrategy {
    rank_strategies(failure, config, system, checkpoint)
        .first()
        .map_or(RecoveryStrategy::ManualIntervention, |c| c.strategy)
}

#[must_use]
pub fn suggestions(failure: FailureType) -> Vec<&'static str> {
    match failure {
        FailureType::OutOfMemory => vec![
            "Reduce the batch size",
            "Enable gradient accumulation to keep the effective batch size",
            "Free accelerator memory held by other processes",
        ],
        FailureType::DiskFull => vec![
            "Free space on the checkpoint volume",
            "Lower checkpoint retention",
            "Move checkpoints to a larger volume",
        ],
        FailureType::ModelLoadingError => vec![
            "Check that the base model path or identifier exists",
            "Verify the model files are complete",
        ],
        FailureType::DataLoadingError => vec![
            "Validate the dataset format and encoding",
            "Check that the dataset path is readable",
        ],
        FailureType::DeviceError => vec![
            "Check accelerator health and driver versions",
            "Retry after releasing cached accelerator memory",
        ],
        FailureType::NetworkError => {
            vec!["Check network connectivity to remote storage", "Retry once the endpoint is reachable"]
        }
        FailureType::PermissionError => {
            vec!["Check file and directory permissions for the job's paths"]
        }
        FailureType::ConfigurationError => {
            vec!["Review the training configuration for invalid or missing values"]
        }
        FailureType::TrainingDivergence => vec![
            "Lower the learning rate",
            "Increase regularization such as dropout",
            "Enable gradient clipping",
        ],
        FailureType::CheckpointCorruption => vec![
            "Restart from an earlier valid checkpoint",
            "Check the checkpoint volume for errors",
        ],
        FailureType::Unknown => vec!["Inspect the job's error message and logs"],
    }
}

/// Read-only diagnosis of a job's last failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAnalysis {
    pub failure_type: FailureType,
    pub class: FailureClass,
    pub error_message: Option<String>,
    pub candidates: Vec<StrategyCandidate>,
    pub suggestions: Vec<String>,
    pub retries_remaining: u32,
}

/// One applied recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub attempt: u32,
    pub failure_type: FailureType,
    pub strategy: RecoveryStrategy,
    pub delay_secs: u64,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Result of `attempt_recovery`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub strategy: Option<RecoveryStrategy>,
    pub message: String,
    pub delay_secs: Option<u64>,
}

impl RecoveryOutcome {
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self { success: false, strategy: None, message: message.into(), delay_secs: None }
    }
}
