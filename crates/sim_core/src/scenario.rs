//! Scenario: one fully configured kernel instance and the loop that drives it.
//!
//! The loop pops plans until no active plans remain or a halting condition is
//! met: an explicit stop from a component, the halt time, the plan budget, the
//! wall-clock budget or an external abort flag. A failing plan ends the
//! scenario with [`ScenarioStatus::Failed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::clock::SimTime;
use crate::context::{Context, KernelSettings, Output};
use crate::continuity::RunContinuity;
use crate::error::{ErrorKind, KernelError};
use crate::plugin::{assemble_registry, Plugin};
use crate::profiling::KernelMetrics;
use crate::registry::{ComponentId, ComponentRegistry};

/// Run settings of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioParams {
    pub seed: u64,
    /// Plans scheduled after this time are not executed.
    pub halt_time: Option<SimTime>,
    /// Maximum number of plans to execute, replayed plans excluded.
    pub max_plans: Option<u64>,
    /// Wall-clock budget in milliseconds.
    pub wall_clock_limit_ms: Option<u64>,
    /// Keep the identity of every executed plan so the run can be resumed.
    pub record_continuity: bool,
    pub kernel: KernelSettings,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            seed: 0,
            halt_time: None,
            max_plans: None,
            wall_clock_limit_ms: None,
            record_continuity: false,
            kernel: KernelSettings::default(),
        }
    }
}

impl ScenarioParams {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_halt_time(mut self, halt_time: SimTime) -> Self {
        self.halt_time = Some(halt_time);
        self
    }

    pub fn with_max_plans(mut self, max_plans: u64) -> Self {
        self.max_plans = Some(max_plans);
        self
    }

    pub fn with_wall_clock_limit_ms(mut self, limit_ms: u64) -> Self {
        self.wall_clock_limit_ms = Some(limit_ms);
        self
    }

    pub fn with_continuity(mut self) -> Self {
        self.record_continuity = true;
        self
    }

    pub fn with_kernel_settings(mut self, kernel: KernelSettings) -> Self {
        self.kernel = kernel;
        self
    }
}

/// Where and when a scenario failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioFault {
    pub kind: ErrorKind,
    pub message: String,
    pub sim_time: SimTime,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioStatus {
    /// No active plans remained.
    Completed,
    /// A component called [`Context::halt`].
    Stopped,
    HaltTimeReached,
    PlanBudgetExhausted,
    WallClockExceeded,
    /// Stopped by the abort flag.
    Aborted,
    Failed(ScenarioFault),
}

impl ScenarioStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ScenarioStatus::Completed => "completed",
            ScenarioStatus::Stopped => "stopped",
            ScenarioStatus::HaltTimeReached => "halt_time_reached",
            ScenarioStatus::PlanBudgetExhausted => "plan_budget_exhausted",
            ScenarioStatus::WallClockExceeded => "wall_clock_exceeded",
            ScenarioStatus::Aborted => "aborted",
            ScenarioStatus::Failed(_) => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ScenarioStatus::Failed(_))
    }

    /// The run stopped early with plans left and can be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            ScenarioStatus::Stopped
                | ScenarioStatus::HaltTimeReached
                | ScenarioStatus::PlanBudgetExhausted
                | ScenarioStatus::WallClockExceeded
                | ScenarioStatus::Aborted
        )
    }

    pub fn fault(&self) -> Option<&ScenarioFault> {
        match self {
            ScenarioStatus::Failed(fault) => Some(fault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub index: usize,
    pub seed: u64,
    pub status: ScenarioStatus,
    pub final_time: SimTime,
    /// Plans executed after any replay.
    pub plans_executed: u64,
    pub plans_replayed: u64,
    pub elapsed: Duration,
    pub continuity: Option<RunContinuity>,
    pub metrics: KernelMetrics,
}

pub struct Scenario {
    index: usize,
    params: ScenarioParams,
    registry: Result<ComponentRegistry, KernelError>,
    sink: Option<Box<dyn FnMut(Output)>>,
    resume: Option<RunContinuity>,
    abort: Option<Arc<AtomicBool>>,
}

impl Scenario {
    pub fn new(params: ScenarioParams, registry: ComponentRegistry) -> Self {
        Self {
            index: 0,
            params,
            registry: Ok(registry),
            sink: None,
            resume: None,
            abort: None,
        }
    }

    /// Builds the registry from `plugins`. Plugin configuration errors are
    /// reported as a failed run.
    pub fn from_plugins(params: ScenarioParams, plugins: &[Plugin]) -> Self {
        Self {
            registry: assemble_registry(plugins),
            ..Self::new(params, ComponentRegistry::new())
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Forwards released outputs to `sink` as they happen.
    pub fn with_output_sink<F>(mut self, sink: F) -> Self
    where
        F: FnMut(Output) + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Replays `continuity` before normal scheduling resumes.
    pub fn resume_from(mut self, continuity: RunContinuity) -> Self {
        self.resume = Some(continuity);
        self
    }

    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn run(self) -> ScenarioReport {
        self.run_with_context().0
    }

    /// Runs the scenario and also returns its final context for inspection.
    pub fn run_with_context(self) -> (ScenarioReport, Context) {
        let span = info_span!("scenario", index = self.index, seed = self.params.seed);
        let _guard = span.enter();
        let started = Instant::now();

        let mut context = Context::new(self.params.seed, self.params.kernel);
        if let Some(sink) = self.sink {
            context.set_output_sink(sink);
        }
        if self.params.record_continuity || self.resume.is_some() {
            context.start_trace();
        }

        let mut progress = Progress::default();
        let outcome = self.registry.and_then(|registry| {
            drive(
                &mut context,
                &self.params,
                registry,
                self.resume.as_ref(),
                self.abort.as_deref(),
                started,
                &mut progress,
            )
        });
        let elapsed = started.elapsed();

        let status = match outcome {
            Ok(status) => status,
            Err(error) => {
                warn!(
                    index = self.index,
                    seed = self.params.seed,
                    sim_time = context.now(),
                    kind = %error.kind(),
                    %error,
                    "scenario failed"
                );
                ScenarioStatus::Failed(ScenarioFault {
                    kind: error.kind(),
                    message: error.to_string(),
                    sim_time: context.now(),
                    elapsed,
                })
            }
        };

        let continuity = if self.params.record_continuity {
            Some(RunContinuity {
                scenario_index: self.index,
                seed: self.params.seed,
                executed: context.take_trace().unwrap_or_default(),
                snapshot: Some(context.snapshot()),
            })
        } else {
            None
        };

        info!(
            status = status.label(),
            final_time = context.now(),
            plans = progress.executed,
            replayed = progress.replayed,
            elapsed_ms = elapsed.as_millis() as u64,
            "scenario finished"
        );
        context.metrics().log_summary();

        let report = ScenarioReport {
            index: self.index,
            seed: self.params.seed,
            status,
            final_time: context.now(),
            plans_executed: progress.executed,
            plans_replayed: progress.replayed,
            elapsed,
            continuity,
            metrics: context.metrics().clone(),
        };
        (report, context)
    }
}

#[derive(Default)]
struct Progress {
    executed: u64,
    replayed: u64,
}

fn drive(
    context: &mut Context,
    params: &ScenarioParams,
    registry: ComponentRegistry,
    resume: Option<&RunContinuity>,
    abort: Option<&AtomicBool>,
    started: Instant,
    progress: &mut Progress,
) -> Result<ScenarioStatus, KernelError> {
    let order = match resume {
        Some(log) => {
            let order = replay(context, registry, log, params.seed)?;
            progress.replayed = log.executed.len() as u64;
            order
        }
        None => registry.resolve(context)?,
    };
    debug!(components = order.len(), "components constructed");

    let wall_clock_limit = params.wall_clock_limit_ms.map(Duration::from_millis);
    loop {
        if context.is_halted() {
            return Ok(ScenarioStatus::Stopped);
        }
        if abort.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Ok(ScenarioStatus::Aborted);
        }
        if wall_clock_limit.is_some_and(|limit| started.elapsed() >= limit) {
            return Ok(ScenarioStatus::WallClockExceeded);
        }
        if !context.has_active_plans() {
            return Ok(ScenarioStatus::Completed);
        }
        if let (Some(halt_time), Some(next)) = (params.halt_time, context.peek_next_time()) {
            if next > halt_time {
                return Ok(ScenarioStatus::HaltTimeReached);
            }
        }
        if params.max_plans.is_some_and(|limit| progress.executed >= limit) {
            return Ok(ScenarioStatus::PlanBudgetExhausted);
        }
        context.advance()?;
        progress.executed += 1;
    }
}

/// Constructs the components and re-executes the logged plans with outputs
/// suppressed, checking each plan against the log, then compares the resulting
/// queue with the recorded snapshot.
fn replay(
    context: &mut Context,
    registry: ComponentRegistry,
    log: &RunContinuity,
    seed: u64,
) -> Result<Vec<ComponentId>, KernelError> {
    if log.seed != seed {
        return Err(KernelError::ContinuitySeedMismatch {
            recorded: log.seed,
            actual: seed,
        });
    }
    context.set_replaying(true);
    let replayed = replay_prefix(context, registry, log);
    context.set_replaying(false);
    let order = replayed?;
    context.clear_halt();

    if let Some(snapshot) = &log.snapshot {
        if context.snapshot() != *snapshot {
            return Err(KernelError::ContinuitySnapshotMismatch);
        }
    }
    debug!(plans = log.executed.len(), "continuity replayed");
    Ok(order)
}

fn replay_prefix(
    context: &mut Context,
    registry: ComponentRegistry,
    log: &RunContinuity,
) -> Result<Vec<ComponentId>, KernelError> {
    let order = registry.resolve(context)?;
    for (index, expected) in log.executed.iter().enumerate() {
        let actual = context.peek_next();
        if actual.as_ref() != Some(expected) {
            return Err(KernelError::ContinuityMismatch {
                index,
                expected: expected.clone(),
                actual,
            });
        }
        context.advance()?;
    }
    Ok(order)
}
