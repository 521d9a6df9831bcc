//! Event bus: typed publish/subscribe with label-based routing.
//!
//! Subscriptions are keyed by event type plus an optional [`EventLabel`]. An
//! event is delivered to the unlabeled subscribers of its type and to the
//! subscribers of each label it carries, so a subscriber interested in one
//! attribute or one entity is never invoked for unrelated instances.
//!
//! Dispatch itself lives on [`Context::publish`](crate::Context::publish); this
//! module owns the routing tables and the nesting depth bookkeeping.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use crate::context::Context;
use crate::entities::Value;
use crate::error::KernelError;
use crate::registry::ComponentId;

/// An immutable fact dispatched synchronously to subscribers.
pub trait Event: Any + fmt::Debug {
    /// Routing labels carried by this instance.
    fn labels(&self) -> Vec<EventLabel> {
        Vec::new()
    }
}

/// Structured routing key: a named dimension plus the value on that dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventLabel {
    pub dimension: &'static str,
    pub key: Value,
}

impl EventLabel {
    pub fn new(dimension: &'static str, key: impl Into<Value>) -> Self {
        Self {
            dimension,
            key: key.into(),
        }
    }
}

impl fmt::Display for EventLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.dimension, self.key)
    }
}

/// Handle returned by `subscribe`, ordered by subscription time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription #{}", self.0)
    }
}

pub(crate) type ErasedHandler = Rc<dyn Fn(&mut Context, &dyn Any) -> Result<(), KernelError>>;

type RouteKey = (TypeId, Option<EventLabel>);

struct Subscription {
    route: RouteKey,
    owner: Option<ComponentId>,
    handler: ErasedHandler,
}

/// A subscriber selected for one dispatch.
pub(crate) struct DispatchTarget {
    pub(crate) id: SubscriptionId,
    pub(crate) owner: Option<ComponentId>,
    pub(crate) handler: ErasedHandler,
}

#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    routes: HashMap<RouteKey, BTreeSet<SubscriptionId>>,
    type_counts: HashMap<TypeId, usize>,
    stack: Vec<&'static str>,
}

impl EventBus {
    pub(crate) fn subscribe(
        &mut self,
        owner: Option<ComponentId>,
        event_type: TypeId,
        label: Option<EventLabel>,
        handler: ErasedHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let route = (event_type, label);
        self.routes.entry(route.clone()).or_default().insert(id);
        *self.type_counts.entry(event_type).or_default() += 1;
        self.subscriptions.insert(
            id,
            Subscription {
                route,
                owner,
                handler,
            },
        );
        id
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.subscriptions.remove(&id) else {
            return false;
        };
        let event_type = subscription.route.0;
        if let Some(route) = self.routes.get_mut(&subscription.route) {
            route.remove(&id);
            if route.is_empty() {
                self.routes.remove(&subscription.route);
            }
        }
        if let Some(count) = self.type_counts.get_mut(&event_type) {
            *count -= 1;
            if *count == 0 {
                self.type_counts.remove(&event_type);
            }
        }
        true
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub fn has_subscribers(&self, event_type: TypeId) -> bool {
        self.type_counts.contains_key(&event_type)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Subscribers for an event of `event_type` carrying `labels`, in
    /// subscription order without duplicates.
    pub(crate) fn targets(&self, event_type: TypeId, labels: &[EventLabel]) -> Vec<DispatchTarget> {
        let mut selected = BTreeSet::new();
        if let Some(route) = self.routes.get(&(event_type, None)) {
            selected.extend(route.iter().copied());
        }
        for label in labels {
            if let Some(route) = self.routes.get(&(event_type, Some(label.clone()))) {
                selected.extend(route.iter().copied());
            }
        }
        selected
            .into_iter()
            .filter_map(|id| {
                self.subscriptions.get(&id).map(|subscription| DispatchTarget {
                    id,
                    owner: subscription.owner.clone(),
                    handler: Rc::clone(&subscription.handler),
                })
            })
            .collect()
    }

    /// Pushes a dispatch frame, failing once `limit` frames are open.
    pub(crate) fn enter(&mut self, event_type: &'static str, limit: usize) -> Result<(), KernelError> {
        if self.stack.len() >= limit {
            return Err(KernelError::DispatchDepthExceeded { limit, event_type });
        }
        self.stack.push(event_type);
        Ok(())
    }

    pub(crate) fn exit(&mut self) {
        self.stack.pop();
    }

    /// Number of dispatches currently in progress.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Event types of the dispatches in progress, outermost first.
    pub fn dispatch_stack(&self) -> &[&'static str] {
        &self.stack
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscriptions.len())
            .field("routes", &self.routes.len())
            .field("depth", &self.stack.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;

    impl Event for Ping {}

    fn noop() -> ErasedHandler {
        Rc::new(|_: &mut Context, _: &dyn Any| Ok(()))
    }

    #[test]
    fn targets_merge_unlabeled_and_labeled_routes_in_order() {
        let mut bus = EventBus::default();
        let ping = TypeId::of::<Ping>();
        let a = bus.subscribe(None, ping, Some(EventLabel::new("region", "north")), noop());
        let b = bus.subscribe(None, ping, None, noop());
        let _c = bus.subscribe(None, ping, Some(EventLabel::new("region", "south")), noop());

        let ids: Vec<_> = bus
            .targets(ping, &[EventLabel::new("region", "north")])
            .into_iter()
            .map(|target| target.id)
            .collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn unsubscribe_updates_type_counts() {
        let mut bus = EventBus::default();
        let ping = TypeId::of::<Ping>();
        let id = bus.subscribe(None, ping, None, noop());
        assert!(bus.has_subscribers(ping));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(!bus.has_subscribers(ping));
        assert!(bus.targets(ping, &[]).is_empty());
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut bus = EventBus::default();
        bus.enter("Ping", 2).unwrap();
        bus.enter("Ping", 2).unwrap();
        assert!(matches!(
            bus.enter("Ping", 2),
            Err(KernelError::DispatchDepthExceeded { limit: 2, .. })
        ));
        bus.exit();
        assert_eq!(bus.depth(), 1);
    }
}
