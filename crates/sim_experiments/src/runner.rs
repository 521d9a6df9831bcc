//! Experiment execution, sequential or on a rayon pool.
//!
//! Every scenario is built from its own clone of the base plugins, gets a seed
//! derived from the master seed and its index, and owns its whole kernel state,
//! so results do not depend on how many scenarios run at once or in which
//! order they finish.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{unbounded, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sim_core::{derive_seed, Plugin, RunContinuity, Scenario, ScenarioReport, ScenarioStatus};
use tracing::{debug, info, warn};

use crate::dimension::{Dimension, DimensionSpace};
use crate::error::ExperimentError;
use crate::output::{aggregate, Message, OutputConsumer, ScenarioOutput};
use crate::params::ExperimentParams;
use crate::progress::{ExperimentProgressLog, ProgressEntry};

/// Result of one executed scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub index: usize,
    pub seed: u64,
    /// One value per entry of [`ExperimentReport::meta_headers`].
    pub meta: Vec<String>,
    pub report: ScenarioReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub meta_headers: Vec<String>,
    /// Executed scenarios, ordered by index.
    pub records: Vec<ScenarioRecord>,
    /// Scenarios the progress log listed as finished.
    pub skipped: Vec<usize>,
    /// Scenarios never started because the experiment was halted.
    pub not_started: Vec<usize>,
    pub outputs: u64,
}

impl ExperimentReport {
    pub fn record(&self, index: usize) -> Option<&ScenarioRecord> {
        self.records.iter().find(|record| record.index == index)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioRecord> + '_ {
        self.records
            .iter()
            .filter(|record| record.report.status.is_failure())
    }
}

/// Base plugins, dimensions and settings of an experiment.
///
/// ```no_run
/// use sim_experiments::{Dimension, Experiment, ExperimentParams};
/// # fn plugins() -> Vec<sim_core::Plugin> { Vec::new() }
///
/// let report = plugins()
///     .into_iter()
///     .fold(Experiment::new(), Experiment::add_plugin)
///     .add_dimension(Dimension::new("empty"))
///     .with_params(ExperimentParams::default().with_thread_count(4))
///     .execute()?;
/// println!("{} scenarios", report.records.len());
/// # Ok::<(), sim_experiments::ExperimentError>(())
/// ```
#[derive(Default)]
pub struct Experiment {
    plugins: Vec<Plugin>,
    dimensions: Vec<Dimension>,
    params: ExperimentParams,
    consumer: Option<OutputConsumer>,
}

impl Experiment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn add_dimension(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    pub fn with_params(mut self, params: ExperimentParams) -> Self {
        self.params = params;
        self
    }

    /// Receives every released output, tagged with its scenario index. Called
    /// from a single aggregator thread.
    pub fn with_output_consumer<F>(mut self, consumer: F) -> Self
    where
        F: FnMut(ScenarioOutput) + Send + 'static,
    {
        self.consumer = Some(Box::new(consumer));
        self
    }

    /// Runs every scenario of the cross product that the progress log does not
    /// list as finished.
    ///
    /// With `halt_on_exception` the first failure stops the experiment and is
    /// returned as [`ExperimentError::ScenarioFailed`]; otherwise failures are
    /// recorded in the report and the remaining scenarios still run.
    pub fn execute(self) -> Result<ExperimentReport, ExperimentError> {
        let started = Instant::now();
        self.params.validate()?;
        let space = DimensionSpace::new(self.dimensions);
        let total = space.scenario_count();

        let progress = match &self.params.progress_log {
            Some(path) => Some(ExperimentProgressLog::open(path)?),
            None => None,
        };
        if let Some(dir) = &self.params.continuity_dir {
            fs::create_dir_all(dir)?;
        }

        let mut pending = Vec::with_capacity(total);
        let mut skipped = Vec::new();
        for index in 0..total {
            let seed = derive_seed(self.params.master_seed, index);
            let finished = match &progress {
                Some(log) => log.is_finished(index, seed)?,
                None => false,
            };
            if finished {
                skipped.push(index);
            } else {
                pending.push(index);
            }
        }
        if !skipped.is_empty() {
            info!(skipped = skipped.len(), "scenarios already finished; skipping");
        }
        info!(
            scenarios = total,
            pending = pending.len(),
            threads = self.params.thread_count,
            master_seed = self.params.master_seed,
            "experiment started"
        );

        let bar = progress_bar(self.params.show_progress, pending.len());
        let abort = Arc::new(AtomicBool::new(false));
        let runner = ScenarioRunner {
            space: &space,
            plugins: &self.plugins,
            params: &self.params,
            abort: &abort,
            bar: bar.as_ref(),
        };

        let consumer = self.consumer;
        let (sender, receiver) = unbounded();
        let (outcomes, (outputs, progress_failure)) = std::thread::scope(|scope| {
            let aggregator = scope.spawn(move || aggregate(receiver, consumer, progress));
            let outcomes = runner.run_all(&pending, &sender);
            drop(sender);
            match aggregator.join() {
                Ok(aggregated) => (outcomes, aggregated),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        });
        if let Some(bar) = &bar {
            bar.finish_with_message("done");
        }

        let mut records = Vec::with_capacity(pending.len());
        let mut not_started = Vec::new();
        for outcome in outcomes? {
            match outcome? {
                Outcome::Ran(record) => records.push(record),
                Outcome::NotStarted(index) => not_started.push(index),
            }
        }
        if let Some(error) = progress_failure {
            return Err(error);
        }

        let failures = records
            .iter()
            .filter(|record| record.report.status.is_failure())
            .count();
        info!(
            ran = records.len(),
            skipped = skipped.len(),
            not_started = not_started.len(),
            failures,
            outputs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "experiment finished"
        );

        if self.params.halt_on_exception {
            let failed = records.iter().find_map(|record| {
                record.report.status.fault().map(|fault| ExperimentError::ScenarioFailed {
                    index: record.index,
                    seed: record.seed,
                    fault: fault.clone(),
                })
            });
            if let Some(error) = failed {
                return Err(error);
            }
        }

        Ok(ExperimentReport {
            meta_headers: space.meta_headers(),
            records,
            skipped,
            not_started,
            outputs,
        })
    }
}

enum Outcome {
    Ran(ScenarioRecord),
    NotStarted(usize),
}

/// Shared, read-only state of a running experiment.
struct ScenarioRunner<'a> {
    space: &'a DimensionSpace,
    plugins: &'a [Plugin],
    params: &'a ExperimentParams,
    abort: &'a Arc<AtomicBool>,
    bar: Option<&'a ProgressBar>,
}

impl ScenarioRunner<'_> {
    fn run_all(
        &self,
        pending: &[usize],
        sender: &Sender<Message>,
    ) -> Result<Vec<Result<Outcome, ExperimentError>>, ExperimentError> {
        if self.params.thread_count == 0 {
            return Ok(pending
                .iter()
                .map(|&index| self.run_guarded(index, sender))
                .collect());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.params.thread_count)
            .build()?;
        Ok(pool.install(|| {
            pending
                .par_iter()
                .map(|&index| self.run_guarded(index, sender))
                .collect()
        }))
    }

    fn run_guarded(&self, index: usize, sender: &Sender<Message>) -> Result<Outcome, ExperimentError> {
        let outcome = self.run_one(index, sender);
        if let Err(error) = &outcome {
            warn!(index, %error, "scenario could not be run");
            if self.params.halt_on_exception {
                self.abort.store(true, Ordering::Relaxed);
            }
        }
        if let Some(bar) = self.bar {
            bar.inc(1);
        }
        outcome
    }

    fn run_one(&self, index: usize, sender: &Sender<Message>) -> Result<Outcome, ExperimentError> {
        if self.abort.load(Ordering::Relaxed) {
            return Ok(Outcome::NotStarted(index));
        }
        let seed = derive_seed(self.params.master_seed, index);
        let descriptor = self.space.describe(index);
        let (plugins, meta) = self.space.apply(&descriptor, self.plugins)?;

        let continuity_path = self
            .params
            .continuity_dir
            .as_deref()
            .map(|dir| continuity_path(dir, index));
        let resume = match &continuity_path {
            Some(path) if path.exists() => Some(RunContinuity::read_json(path)?),
            _ => None,
        };

        let outputs = sender.clone();
        let mut scenario = Scenario::from_plugins(self.params.scenario_params(seed), &plugins)
            .with_index(index)
            .with_abort_flag(Arc::clone(self.abort))
            .with_output_sink(move |output| {
                // The aggregator outlives every scenario.
                let _ = outputs.send(Message::Output(ScenarioOutput {
                    scenario: index,
                    output,
                }));
            });
        if let Some(log) = resume {
            debug!(index, executed = log.executed.len(), "resuming from continuity log");
            scenario = scenario.resume_from(log);
        }
        let report = scenario.run();

        if let Some(path) = &continuity_path {
            match &report.continuity {
                Some(log) if report.status.is_resumable() => log.write_json(path)?,
                _ if report.status == ScenarioStatus::Completed && path.exists() => {
                    fs::remove_file(path)?
                }
                _ => {}
            }
        }

        if let Some(fault) = report.status.fault() {
            warn!(
                index,
                seed,
                sim_time = fault.sim_time,
                kind = %fault.kind,
                message = %fault.message,
                "scenario failed"
            );
            if self.params.halt_on_exception {
                self.abort.store(true, Ordering::Relaxed);
            }
        } else if counts_as_finished(&report.status) {
            let _ = sender.send(Message::Finished(ProgressEntry {
                scenario: index,
                seed,
                status: report.status.label().to_string(),
            }));
        }

        Ok(Outcome::Ran(ScenarioRecord {
            index,
            seed,
            meta,
            report,
        }))
    }
}

/// Statuses reached through the scenario's own halting conditions. Failed,
/// aborted and wall-clock limited runs are run again on restart.
fn counts_as_finished(status: &ScenarioStatus) -> bool {
    matches!(
        status,
        ScenarioStatus::Completed
            | ScenarioStatus::Stopped
            | ScenarioStatus::HaltTimeReached
            | ScenarioStatus::PlanBudgetExhausted
    )
}

pub fn continuity_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("scenario_{index}.json"))
}

fn progress_bar(show: bool, total: usize) -> Option<ProgressBar> {
    if !show || total == 0 {
        return None;
    }
    let bar = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    Some(bar)
}
