//! Experiment runner for the simulation kernel.
//!
//! An experiment is a set of base plugins plus a list of dimensions. Each
//! dimension contributes levels that edit plugin data; the cross product of all
//! levels gives the scenarios. Every scenario runs in its own kernel context
//! with a seed derived from the master seed and its index, either sequentially
//! or on a rayon worker pool.
//!
//! # Quick Start
//!
//! ```no_run
//! use sim_experiments::{export_to_csv, Dimension, Experiment, ExperimentParams};
//! # #[derive(Clone)] struct Disease { transmission: f64 }
//! # fn disease_plugin() -> sim_core::Plugin { unimplemented!() }
//!
//! let transmission = [0.05, 0.1, 0.2].into_iter().fold(
//!     Dimension::new("transmission").with_meta_header("transmission"),
//!     |dimension, rate| {
//!         dimension.with_level(move |context| {
//!             context.data_mut::<Disease>()?.transmission = rate;
//!             Ok(vec![rate.to_string()])
//!         })
//!     },
//! );
//!
//! let report = Experiment::new()
//!     .add_plugin(disease_plugin())
//!     .add_dimension(transmission)
//!     .with_params(ExperimentParams::default().with_thread_count(4))
//!     .with_output_consumer(|output| println!("scenario {}: {:?}", output.scenario, output.output))
//!     .execute()?;
//! export_to_csv(&report, "sweep.csv")?;
//! # Ok::<(), sim_experiments::ExperimentError>(())
//! ```
//!
//! # Architecture
//!
//! - [`dimension`]: dimensions, levels and the mixed-radix scenario space
//! - [`params`]: experiment-wide settings, loadable from JSON
//! - [`runner`]: sequential and pooled execution, halting and resume
//! - [`output`]: the single-threaded output aggregator
//! - [`progress`]: CSV log of finished scenarios for restarts
//! - [`export`]: report export to JSON and CSV

pub mod dimension;
pub mod error;
pub mod export;
pub mod output;
pub mod params;
pub mod progress;
pub mod runner;

pub use dimension::{Dimension, DimensionContext, DimensionSpace, ScenarioDescriptor};
pub use error::ExperimentError;
pub use export::{export_to_csv, export_to_json};
pub use output::{OutputConsumer, ScenarioOutput};
pub use params::ExperimentParams;
pub use progress::{ExperimentProgressLog, ProgressEntry};
pub use runner::{continuity_path, Experiment, ExperimentReport, ScenarioRecord};
