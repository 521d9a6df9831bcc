//! Experiment error type.

use sim_core::{KernelError, ScenarioFault};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(
        "scenario {index} (seed {seed}) failed at sim time {} after {:?}: {}",
        .fault.sim_time,
        .fault.elapsed,
        .fault.message
    )]
    ScenarioFailed {
        index: usize,
        seed: u64,
        fault: ScenarioFault,
    },

    #[error("dimension `{dimension}` level {level} returned {actual} meta values for {expected} headers")]
    DimensionMetaMismatch {
        dimension: String,
        level: usize,
        expected: usize,
        actual: usize,
    },

    #[error("no plugin carries data of type `{expected}`")]
    MissingPluginData { expected: &'static str },

    #[error("progress log records scenario {index} with seed {recorded}, experiment derives {expected}")]
    ProgressSeedMismatch {
        index: usize,
        recorded: u64,
        expected: u64,
    },

    #[error("invalid experiment parameters: {0}")]
    InvalidParams(String),

    #[error("no results to export")]
    EmptyExport,
}
