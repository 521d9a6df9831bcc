//! The explicit kernel context threaded through every constructor, plan and
//! event handler of one scenario.
//!
//! A [`Context`] owns the scenario's plan queue, event bus, constructed
//! components, random streams and output sink. Nothing is shared between
//! contexts, so independent scenarios can run on separate threads.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::rc::Rc;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::clock::{Plan, PlanId, PlanKey, PlanQueue, QueuedPlan, SimTime};
use crate::continuity::{SimulationSnapshot, TraceEntry};
use crate::error::{display_owner, DispatchFailure, KernelError, SubscriberFault};
use crate::events::{ErasedHandler, Event, EventBus, EventLabel, SubscriptionId};
use crate::profiling::KernelMetrics;
use crate::random::RandomStreams;
use crate::registry::{ComponentId, ComponentKind, ComponentStore};

/// Kernel limits shared by every scenario of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Maximum number of nested dispatches before publishing fails.
    pub max_dispatch_depth: usize,
    /// Subscriber faults logged individually per failed dispatch.
    pub max_dispatch_diagnostics: usize,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            max_dispatch_depth: 64,
            max_dispatch_diagnostics: 5,
        }
    }
}

/// Anything a component can release as output.
pub trait OutputItem: Any + Send + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + fmt::Debug> OutputItem for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One released output, tagged with the time and component that produced it.
#[derive(Debug)]
pub struct Output {
    pub time: SimTime,
    pub source: Option<ComponentId>,
    payload: Box<dyn OutputItem>,
}

impl Output {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.payload).as_any().downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.downcast_ref::<T>().is_some()
    }
}

enum OutputSink {
    Buffer(Vec<Output>),
    Forward(Box<dyn FnMut(Output)>),
}

pub struct Context {
    queue: PlanQueue,
    bus: EventBus,
    components: ComponentStore,
    random: RandomStreams,
    current_owner: Option<ComponentId>,
    outputs: OutputSink,
    halted: bool,
    replaying: bool,
    trace: Option<Vec<TraceEntry>>,
    metrics: KernelMetrics,
    settings: KernelSettings,
}

impl Context {
    pub fn new(seed: u64, settings: KernelSettings) -> Self {
        Self {
            queue: PlanQueue::default(),
            bus: EventBus::default(),
            components: ComponentStore::default(),
            random: RandomStreams::new(seed),
            current_owner: None,
            outputs: OutputSink::Buffer(Vec::new()),
            halted: false,
            replaying: false,
            trace: None,
            metrics: KernelMetrics::default(),
            settings,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::new(seed, KernelSettings::default())
    }

    pub fn seed(&self) -> u64 {
        self.random.seed()
    }

    pub fn settings(&self) -> &KernelSettings {
        &self.settings
    }

    pub fn now(&self) -> SimTime {
        self.queue.now()
    }

    /// Component on whose behalf the running code executes, if any.
    pub fn current_owner(&self) -> Option<&ComponentId> {
        self.current_owner.as_ref()
    }

    pub(crate) fn replace_owner(&mut self, owner: Option<ComponentId>) -> Option<ComponentId> {
        std::mem::replace(&mut self.current_owner, owner)
    }

    // Scheduling

    /// Schedules `plan` on behalf of the current owner.
    pub fn schedule_plan(&mut self, plan: Plan) -> Result<PlanId, KernelError> {
        let owner = self.current_owner.clone();
        self.queue.schedule(owner, plan)
    }

    pub fn schedule_at<F>(&mut self, time: SimTime, callback: F) -> Result<PlanId, KernelError>
    where
        F: FnOnce(&mut Context) -> Result<(), KernelError> + 'static,
    {
        self.schedule_plan(Plan::new(time, callback))
    }

    pub fn schedule_in<F>(&mut self, delay: SimTime, callback: F) -> Result<PlanId, KernelError>
    where
        F: FnOnce(&mut Context) -> Result<(), KernelError> + 'static,
    {
        let time = self.now().saturating_add(delay);
        self.schedule_plan(Plan::new(time, callback))
    }

    /// Cancels the current owner's pending plan `key`. Returns `false` if no
    /// such plan is pending.
    pub fn cancel_plan(&mut self, key: impl Into<PlanKey>) -> bool {
        let owner = self.current_owner.clone();
        self.queue.cancel(owner.as_ref(), &key.into())
    }

    pub fn cancel_plan_for(&mut self, owner: &ComponentId, key: impl Into<PlanKey>) -> bool {
        self.queue.cancel(Some(owner), &key.into())
    }

    /// Pops the next plan, moves time to it and runs it. Returns `Ok(false)`
    /// when the queue was empty.
    pub fn advance(&mut self) -> Result<bool, KernelError> {
        let Some(plan) = self.queue.pop_next() else {
            return Ok(false);
        };
        if let Some(trace) = &mut self.trace {
            trace.push(plan.trace_entry());
        }
        self.metrics.record_plan();
        let QueuedPlan {
            time,
            owner,
            callback,
            ..
        } = plan;
        trace!(time, owner = display_owner(&owner), "executing plan");
        let previous = self.replace_owner(owner);
        let result = callback(self);
        self.current_owner = previous;
        result.map(|()| true)
    }

    pub fn peek_next_time(&mut self) -> Option<SimTime> {
        self.queue.next_time()
    }

    /// Identity of the next plan to execute.
    pub fn peek_next(&mut self) -> Option<TraceEntry> {
        self.queue.peek()
    }

    pub fn has_active_plans(&self) -> bool {
        self.queue.has_active_plans()
    }

    pub fn pending_plans(&self) -> usize {
        self.queue.len()
    }

    pub fn snapshot(&self) -> SimulationSnapshot {
        self.queue.snapshot()
    }

    // Events

    /// Subscribes the current owner to events of type `E`, optionally only to
    /// instances carrying `label`.
    pub fn subscribe<E, F>(&mut self, label: Option<EventLabel>, handler: F) -> SubscriptionId
    where
        E: Event,
        F: Fn(&mut Context, &E) -> Result<(), KernelError> + 'static,
    {
        let erased: ErasedHandler = Rc::new(move |context: &mut Context, event: &dyn Any| {
            match event.downcast_ref::<E>() {
                Some(event) => handler(context, event),
                None => Ok(()),
            }
        });
        let owner = self.current_owner.clone();
        self.bus.subscribe(owner, TypeId::of::<E>(), label, erased)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// True when publishing an `E` would reach at least one subscriber
    /// (ignoring labels). Producers use this to skip building payloads.
    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.bus.has_subscribers(TypeId::of::<E>())
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Dispatches `event` synchronously to every matching subscriber.
    ///
    /// Subscribers owned by data managers run first, in construction order.
    /// The rest run in subscription order. Each runs on behalf of the component
    /// that subscribed. Events published by a handler are fully dispatched
    /// before the next handler runs. A failing subscriber does not stop the
    /// others; all failures are returned together once dispatch completes.
    pub fn publish<E: Event>(&mut self, event: E) -> Result<(), KernelError> {
        let event_type = short_type_name::<E>();
        let mut targets = self.bus.targets(TypeId::of::<E>(), &event.labels());
        if targets.is_empty() {
            return Ok(());
        }
        // Data managers first, in construction order, so derived indexes are
        // current before any other subscriber reads them. The sort is stable.
        targets.sort_by_key(|target| {
            target
                .owner
                .as_ref()
                .and_then(|owner| self.components.data_manager_position(owner))
                .map_or((1, 0), |position| (0, position))
        });
        self.metrics.record_event(event_type);

        self.bus.enter(event_type, self.settings.max_dispatch_depth)?;
        let mut faults = Vec::new();
        for target in targets {
            // Unsubscribed by an earlier handler of this dispatch.
            if !self.bus.is_subscribed(target.id) {
                continue;
            }
            let previous = self.replace_owner(target.owner.clone());
            let result = (target.handler)(self, &event);
            self.current_owner = previous;
            if let Err(error) = result {
                faults.push(SubscriberFault {
                    subscription: target.id,
                    owner: target.owner,
                    error: Box::new(error),
                });
            }
        }
        self.bus.exit();

        if faults.is_empty() {
            return Ok(());
        }
        self.metrics.record_dispatch_faults(faults.len());
        let shown = self.settings.max_dispatch_diagnostics;
        for fault in faults.iter().take(shown) {
            warn!(
                event_type,
                subscription = %fault.subscription,
                owner = display_owner(&fault.owner),
                error = %fault.error,
                "subscriber failed"
            );
        }
        if faults.len() > shown {
            warn!(
                event_type,
                suppressed = faults.len() - shown,
                "further subscriber failures not shown"
            );
        }
        Err(KernelError::Dispatch(DispatchFailure { event_type, faults }))
    }

    // Components

    pub(crate) fn insert_component(&mut self, id: ComponentId, kind: ComponentKind, value: Box<dyn Any>) {
        self.components.insert(id, kind, value);
    }

    /// A constructed component, or `UnknownComponent` if `id` was never built.
    pub fn get<T: Any>(&self, id: &ComponentId) -> Result<&T, KernelError> {
        self.components.get(id)
    }

    pub fn get_mut<T: Any>(&mut self, id: &ComponentId) -> Result<&mut T, KernelError> {
        self.components.get_mut(id)
    }

    /// First constructed component of type `T`.
    pub fn find<T: Any>(&self) -> Option<&T> {
        self.components.find::<T>().map(|(_, value)| value)
    }

    pub fn contains_component(&self, id: &ComponentId) -> bool {
        self.components.contains(id)
    }

    pub fn component_kind(&self, id: &ComponentId) -> Option<ComponentKind> {
        self.components.kind(id)
    }

    /// Component ids in construction order.
    pub fn component_ids(&self) -> &[ComponentId] {
        self.components.ids()
    }

    // Randomness

    pub fn rng(&mut self) -> &mut StdRng {
        self.random.main()
    }

    /// Named stream seeded from the scenario seed and `name`.
    pub fn rng_stream(&mut self, name: &str) -> &mut StdRng {
        self.random.stream(name)
    }

    /// Borrows a component together with a random stream (`None` for the main
    /// stream).
    pub fn component_and_rng<T: Any>(
        &mut self,
        id: &ComponentId,
        stream: Option<&str>,
    ) -> Result<(&T, &mut StdRng), KernelError> {
        let component = self.components.get::<T>(id)?;
        let rng = match stream {
            Some(name) => self.random.stream(name),
            None => self.random.main(),
        };
        Ok((component, rng))
    }

    // Outputs

    /// Hands `item` to the scenario's output sink. Outputs released while a
    /// continuity log is replayed are dropped, since they were already
    /// delivered by the original run.
    pub fn release_output<T: OutputItem>(&mut self, item: T) {
        if self.replaying {
            return;
        }
        self.metrics.record_output();
        let output = Output {
            time: self.now(),
            source: self.current_owner.clone(),
            payload: Box::new(item),
        };
        match &mut self.outputs {
            OutputSink::Buffer(buffer) => buffer.push(output),
            OutputSink::Forward(sink) => sink(output),
        }
    }

    /// Forwards future outputs to `sink` instead of buffering them.
    pub fn set_output_sink(&mut self, sink: Box<dyn FnMut(Output)>) {
        self.outputs = OutputSink::Forward(sink);
    }

    /// Drains buffered outputs. Empty when a sink is installed.
    pub fn take_outputs(&mut self) -> Vec<Output> {
        match &mut self.outputs {
            OutputSink::Buffer(buffer) => std::mem::take(buffer),
            OutputSink::Forward(_) => Vec::new(),
        }
    }

    // Lifecycle

    /// Requests the scenario loop to stop before the next plan.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub(crate) fn clear_halt(&mut self) {
        self.halted = false;
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub(crate) fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    pub(crate) fn start_trace(&mut self) {
        self.trace.get_or_insert_with(Vec::new);
    }

    pub(crate) fn take_trace(&mut self) -> Option<Vec<TraceEntry>> {
        self.trace.take()
    }

    pub fn metrics(&self) -> &KernelMetrics {
        &self.metrics
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("now", &self.now())
            .field("seed", &self.seed())
            .field("queue", &self.queue)
            .field("bus", &self.bus)
            .field("components", &self.components.ids())
            .field("halted", &self.halted)
            .finish()
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
