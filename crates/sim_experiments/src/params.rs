//! Experiment-wide settings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sim_core::{KernelSettings, ScenarioParams, SimTime};

use crate::error::ExperimentError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentParams {
    /// Every scenario seed is derived from this seed and the scenario index.
    pub master_seed: u64,
    /// Worker threads; 0 runs every scenario on the calling thread.
    pub thread_count: usize,
    /// Stop the whole experiment at the first failed scenario.
    pub halt_on_exception: bool,
    pub halt_time: Option<SimTime>,
    pub max_plans: Option<u64>,
    pub wall_clock_limit_ms: Option<u64>,
    pub record_continuity: bool,
    /// Where halted scenarios store and later pick up their continuity logs.
    pub continuity_dir: Option<PathBuf>,
    /// CSV of completed scenarios; scenarios listed there are skipped.
    pub progress_log: Option<PathBuf>,
    pub show_progress: bool,
    pub kernel: KernelSettings,
}

impl Default for ExperimentParams {
    fn default() -> Self {
        Self {
            master_seed: 0,
            thread_count: 0,
            halt_on_exception: true,
            halt_time: None,
            max_plans: None,
            wall_clock_limit_ms: None,
            record_continuity: false,
            continuity_dir: None,
            progress_log: None,
            show_progress: false,
            kernel: KernelSettings::default(),
        }
    }
}

impl ExperimentParams {
    pub fn from_json_str(json: &str) -> Result<Self, ExperimentError> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ExperimentError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.max_plans == Some(0) {
            return Err(ExperimentError::InvalidParams(
                "max_plans must be positive".to_string(),
            ));
        }
        if self.wall_clock_limit_ms == Some(0) {
            return Err(ExperimentError::InvalidParams(
                "wall_clock_limit_ms must be positive".to_string(),
            ));
        }
        if self.continuity_dir.is_some() && !self.record_continuity {
            return Err(ExperimentError::InvalidParams(
                "continuity_dir requires record_continuity".to_string(),
            ));
        }
        if self.kernel.max_dispatch_depth == 0 {
            return Err(ExperimentError::InvalidParams(
                "kernel.max_dispatch_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_master_seed(mut self, seed: u64) -> Self {
        self.master_seed = seed;
        self
    }

    pub fn with_thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    pub fn with_halt_on_exception(mut self, halt: bool) -> Self {
        self.halt_on_exception = halt;
        self
    }

    pub fn with_halt_time(mut self, halt_time: SimTime) -> Self {
        self.halt_time = Some(halt_time);
        self
    }

    pub fn with_continuity_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.record_continuity = true;
        self.continuity_dir = Some(dir.into());
        self
    }

    pub fn with_progress_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.progress_log = Some(path.into());
        self
    }

    pub fn with_progress_bar(mut self) -> Self {
        self.show_progress = true;
        self
    }

    /// Run settings of one scenario with the given derived seed.
    pub fn scenario_params(&self, seed: u64) -> ScenarioParams {
        ScenarioParams {
            seed,
            halt_time: self.halt_time,
            max_plans: self.max_plans,
            wall_clock_limit_ms: self.wall_clock_limit_ms,
            record_continuity: self.record_continuity,
            kernel: self.kernel,
        }
    }
}
