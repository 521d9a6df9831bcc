//! Discrete-event simulation kernel.
//!
//! A scenario owns an explicit [`Context`]: a time-ordered plan queue, a typed
//! event bus with label routing, the components built by the dependency
//! resolving registry, seeded random streams and an output sink. Entity
//! attributes, filters and live partitions are layered on top as ordinary
//! components.

pub mod clock;
pub mod context;
pub mod continuity;
pub mod entities;
pub mod error;
pub mod events;
pub mod filter;
pub mod partition;
pub mod plugin;
pub mod profiling;
pub mod random;
pub mod registry;
pub mod scenario;
#[cfg(feature = "test-helpers")]
pub mod test_helpers;

pub use clock::{Plan, PlanId, PlanKey, PlanQueue, SimTime};
pub use context::{Context, KernelSettings, Output, OutputItem};
pub use continuity::{PendingPlan, RunContinuity, SimulationSnapshot, TraceEntry};
pub use entities::{
    AttributeChangedEvent, AttributeDefinition, AttributeId, ContextEntitiesExt,
    EntityAddedEvent, EntityId, EntityRemovedEvent, EntityStore, EntityStoreConfig, Value,
    ValueKind, ENTITY_STORE,
};
pub use error::{DispatchFailure, ErrorKind, KernelError, SubscriberFault};
pub use events::{Event, EventBus, EventLabel, SubscriptionId};
pub use filter::{Comparison, Filter, FilterSensitivity};
pub use partition::{
    ContextPartitionExt, Label, Labeler, PartitionEngine, PartitionId, PartitionSampler,
    PARTITION_ENGINE,
};
pub use plugin::{assemble_registry, Plugin, PluginBuilder, PluginContext, PluginData, PluginId};
pub use profiling::KernelMetrics;
pub use random::derive_seed;
pub use registry::{ComponentId, ComponentKind, ComponentRegistry};
pub use scenario::{Scenario, ScenarioFault, ScenarioParams, ScenarioReport, ScenarioStatus};
