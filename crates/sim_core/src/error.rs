//! Kernel error taxonomy.
//!
//! Every fallible kernel operation returns [`KernelError`]. Errors fall into four
//! classes reported by [`KernelError::kind`]: configuration errors raised while
//! resolving components and plugins, contract violations raised synchronously by
//! kernel APIs, dispatch faults aggregated by the event bus, and scenario faults
//! raised by model code during plan execution.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{PlanKey, SimTime};
use crate::continuity::TraceEntry;
use crate::entities::{AttributeId, EntityId, ValueKind};
use crate::events::SubscriptionId;
use crate::partition::PartitionId;
use crate::registry::ComponentId;

/// Error class used for reporting and for deciding how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    Contract,
    Dispatch,
    Scenario,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Contract => "contract",
            ErrorKind::Dispatch => "dispatch",
            ErrorKind::Scenario => "scenario",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{scope} `{id}` is registered more than once")]
    DuplicateComponent { scope: &'static str, id: String },

    #[error("unknown component `{0}`")]
    UnknownComponent(ComponentId),

    #[error("{scope} `{dependent}` depends on `{dependency}`, which is not registered")]
    MissingDependency {
        scope: &'static str,
        dependent: String,
        dependency: String,
    },

    #[error("cyclic {scope} dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        scope: &'static str,
        cycle: Vec<String>,
    },

    #[error("component `{id}` is not a `{expected}`")]
    ComponentTypeMismatch {
        id: ComponentId,
        expected: &'static str,
    },

    #[error("plugin `{plugin}` has no data of type `{expected}`")]
    MissingPluginData {
        plugin: String,
        expected: &'static str,
    },

    #[error("plan scheduled at {requested} is earlier than the current time {now}")]
    PastSchedule { requested: SimTime, now: SimTime },

    #[error("owner `{}` already has a pending plan with key `{key}`", display_owner(.owner))]
    DuplicatePlanKey {
        owner: Option<ComponentId>,
        key: PlanKey,
    },

    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("unknown attribute id `{0}`")]
    UnknownAttributeId(AttributeId),

    #[error("attribute `{0}` is defined more than once")]
    DuplicateAttribute(AttributeId),

    #[error("attribute `{attribute}` holds {expected} values, got {actual}")]
    IncompatibleValue {
        attribute: AttributeId,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("attribute `{0}` is immutable")]
    ImmutableAttribute(AttributeId),

    #[error("entity {entity} has no value for attribute `{attribute}` and it has no default")]
    MissingAttributeValue {
        entity: EntityId,
        attribute: AttributeId,
    },

    #[error("unknown partition `{0}`")]
    UnknownPartition(PartitionId),

    #[error("partition `{0}` is defined more than once")]
    DuplicatePartition(PartitionId),

    #[error("invalid sampling weight {weight} for label {label}")]
    InvalidSamplingWeight { label: String, weight: f64 },

    #[error("{0}")]
    Dispatch(DispatchFailure),

    #[error("event dispatch nested deeper than {limit} while publishing `{event_type}`")]
    DispatchDepthExceeded {
        limit: usize,
        event_type: &'static str,
    },

    #[error("continuity log diverged at entry {index}: expected {expected:?}, found {actual:?}")]
    ContinuityMismatch {
        index: usize,
        expected: TraceEntry,
        actual: Option<TraceEntry>,
    },

    #[error("plan queue after replay does not match the recorded snapshot")]
    ContinuitySnapshotMismatch,

    #[error("continuity log was recorded with seed {recorded}, scenario uses seed {actual}")]
    ContinuitySeedMismatch { recorded: u64, actual: u64 },

    #[error("model error: {0}")]
    Model(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// Shorthand for errors raised by model code inside plans and handlers.
    pub fn model(message: impl Into<String>) -> Self {
        KernelError::Model(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::DuplicateComponent { .. }
            | KernelError::UnknownComponent(_)
            | KernelError::MissingDependency { .. }
            | KernelError::CyclicDependency { .. }
            | KernelError::MissingPluginData { .. }
            | KernelError::DuplicateAttribute(_)
            | KernelError::DuplicatePartition(_) => ErrorKind::Configuration,
            KernelError::ComponentTypeMismatch { .. }
            | KernelError::PastSchedule { .. }
            | KernelError::DuplicatePlanKey { .. }
            | KernelError::UnknownEntity(_)
            | KernelError::UnknownAttributeId(_)
            | KernelError::IncompatibleValue { .. }
            | KernelError::ImmutableAttribute(_)
            | KernelError::MissingAttributeValue { .. }
            | KernelError::UnknownPartition(_)
            | KernelError::InvalidSamplingWeight { .. } => ErrorKind::Contract,
            KernelError::Dispatch(_) | KernelError::DispatchDepthExceeded { .. } => {
                ErrorKind::Dispatch
            }
            KernelError::ContinuityMismatch { .. }
            | KernelError::ContinuitySnapshotMismatch
            | KernelError::ContinuitySeedMismatch { .. }
            | KernelError::Model(_)
            | KernelError::Serialization(_)
            | KernelError::Io(_) => ErrorKind::Scenario,
        }
    }
}

/// One subscriber that returned an error while an event was being dispatched.
#[derive(Debug)]
pub struct SubscriberFault {
    pub subscription: SubscriptionId,
    pub owner: Option<ComponentId>,
    pub error: Box<KernelError>,
}

/// Aggregate of all subscriber faults raised while dispatching a single event.
#[derive(Debug)]
pub struct DispatchFailure {
    pub event_type: &'static str,
    pub faults: Vec<SubscriberFault>,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} subscriber(s) failed while dispatching `{}`",
            self.faults.len(),
            self.event_type
        )?;
        if let Some(first) = self.faults.first() {
            write!(
                f,
                "; first failure in {} (owner `{}`): {}",
                first.subscription,
                display_owner(&first.owner),
                first.error
            )?;
        }
        Ok(())
    }
}

pub(crate) fn display_owner(owner: &Option<ComponentId>) -> &str {
    owner.as_ref().map(ComponentId::as_str).unwrap_or("<kernel>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let cyclic = KernelError::CyclicDependency {
            scope: "component",
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(cyclic.kind(), ErrorKind::Configuration);
        assert_eq!(cyclic.to_string(), "cyclic component dependency: a -> b -> a");

        let past = KernelError::PastSchedule {
            requested: 1,
            now: 5,
        };
        assert_eq!(past.kind(), ErrorKind::Contract);
        assert_eq!(KernelError::model("boom").kind(), ErrorKind::Scenario);
    }

    #[test]
    fn dispatch_failure_mentions_first_fault() {
        let failure = DispatchFailure {
            event_type: "Ping",
            faults: vec![SubscriberFault {
                subscription: SubscriptionId::from_raw(3),
                owner: Some(ComponentId::from_static("pinger")),
                error: Box::new(KernelError::model("bad ping")),
            }],
        };
        let message = KernelError::Dispatch(failure).to_string();
        assert!(message.contains("1 subscriber(s) failed"));
        assert!(message.contains("pinger"));
        assert!(message.contains("bad ping"));
    }
}
