//! Output aggregation.
//!
//! Scenarios run on worker threads but the caller's output consumer and the
//! progress log are single writers. Workers send everything over one channel to
//! an aggregator thread that owns both.

use crossbeam::channel::Receiver;
use sim_core::Output;
use tracing::{debug, warn};

use crate::error::ExperimentError;
use crate::progress::{ExperimentProgressLog, ProgressEntry};

/// One output released by a scenario, tagged with its scenario index.
#[derive(Debug)]
pub struct ScenarioOutput {
    pub scenario: usize,
    pub output: Output,
}

pub type OutputConsumer = Box<dyn FnMut(ScenarioOutput) + Send>;

pub(crate) enum Message {
    Output(ScenarioOutput),
    Finished(ProgressEntry),
}

/// Drains `receiver` until every sender is dropped. Returns the number of
/// outputs delivered and the first progress log write failure, if any.
pub(crate) fn aggregate(
    receiver: Receiver<Message>,
    mut consumer: Option<OutputConsumer>,
    mut progress: Option<ExperimentProgressLog>,
) -> (u64, Option<ExperimentError>) {
    let mut delivered = 0;
    let mut failure = None;
    for message in receiver {
        match message {
            Message::Output(output) => {
                delivered += 1;
                if let Some(consumer) = consumer.as_mut() {
                    consumer(output);
                }
            }
            Message::Finished(entry) => {
                let Some(log) = progress.as_mut() else {
                    continue;
                };
                if let Err(error) = log.record(entry) {
                    warn!(path = %log.path().display(), %error, "progress log write failed");
                    if failure.is_none() {
                        failure = Some(error);
                    }
                }
            }
        }
    }
    debug!(outputs = delivered, "output aggregator finished");
    (delivered, failure)
}
