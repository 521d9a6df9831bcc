//! Component registry: declared dependencies, construction order, and the
//! store of constructed components.
//!
//! Components are registered with an id, a kind and the ids they depend on.
//! [`ComponentRegistry::resolve`] sorts the dependency graph and runs each
//! constructor exactly once, dependencies first, against the scenario's
//! [`Context`]. Constructors can look up already-built dependencies, schedule
//! plans and subscribe to events in the same pass.

use std::any::{type_name, Any};
use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::Context;
use crate::error::KernelError;

/// Stable identity of a component within a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(Cow<'static, str>);

impl ComponentId {
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for ComponentId {
    fn from(id: &'static str) -> Self {
        Self::from_static(id)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Drives behavior: schedules plans and reacts to events.
    Actor,
    /// Owns state and publishes events when it changes.
    DataManager,
    /// Answers queries derived from other components' state.
    Resolver,
}

type Constructor = Box<dyn FnOnce(&mut Context) -> Result<Box<dyn Any>, KernelError>>;

struct Registration {
    id: ComponentId,
    kind: ComponentKind,
    dependencies: Vec<ComponentId>,
    constructor: Constructor,
}

/// Pending component registrations for one scenario.
#[derive(Default)]
pub struct ComponentRegistry {
    registrations: Vec<Registration>,
    positions: HashMap<ComponentId, usize>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component. Registering the same id twice is a configuration
    /// error, reported immediately.
    pub fn register<T, F>(
        &mut self,
        kind: ComponentKind,
        id: ComponentId,
        dependencies: Vec<ComponentId>,
        constructor: F,
    ) -> Result<(), KernelError>
    where
        T: Any,
        F: FnOnce(&mut Context) -> Result<T, KernelError> + 'static,
    {
        if self.positions.contains_key(&id) {
            return Err(KernelError::DuplicateComponent {
                scope: "component",
                id: id.to_string(),
            });
        }
        self.positions.insert(id.clone(), self.registrations.len());
        self.registrations.push(Registration {
            id,
            kind,
            dependencies,
            constructor: Box::new(move |context| {
                constructor(context).map(|value| Box::new(value) as Box<dyn Any>)
            }),
        });
        Ok(())
    }

    pub fn add_actor<T, F>(
        &mut self,
        id: ComponentId,
        dependencies: Vec<ComponentId>,
        constructor: F,
    ) -> Result<(), KernelError>
    where
        T: Any,
        F: FnOnce(&mut Context) -> Result<T, KernelError> + 'static,
    {
        self.register(ComponentKind::Actor, id, dependencies, constructor)
    }

    pub fn add_data_manager<T, F>(
        &mut self,
        id: ComponentId,
        dependencies: Vec<ComponentId>,
        constructor: F,
    ) -> Result<(), KernelError>
    where
        T: Any,
        F: FnOnce(&mut Context) -> Result<T, KernelError> + 'static,
    {
        self.register(ComponentKind::DataManager, id, dependencies, constructor)
    }

    pub fn add_resolver<T, F>(
        &mut self,
        id: ComponentId,
        dependencies: Vec<ComponentId>,
        constructor: F,
    ) -> Result<(), KernelError>
    where
        T: Any,
        F: FnOnce(&mut Context) -> Result<T, KernelError> + 'static,
    {
        self.register(ComponentKind::Resolver, id, dependencies, constructor)
    }

    pub fn contains(&self, id: &ComponentId) -> bool {
        self.positions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Construction order the registry would use, without constructing anything.
    pub fn construction_order(&self) -> Result<Vec<ComponentId>, KernelError> {
        let order = dependency_order(&self.graph(), "component")?;
        Ok(order
            .into_iter()
            .map(|index| self.registrations[index].id.clone())
            .collect())
    }

    fn graph(&self) -> Vec<(ComponentId, Vec<ComponentId>)> {
        self.registrations
            .iter()
            .map(|registration| (registration.id.clone(), registration.dependencies.clone()))
            .collect()
    }

    /// Constructs every registered component into `context`, dependencies
    /// first. Returns the construction order.
    pub fn resolve(self, context: &mut Context) -> Result<Vec<ComponentId>, KernelError> {
        let order = dependency_order(&self.graph(), "component")?;

        let mut slots: Vec<Option<Registration>> =
            self.registrations.into_iter().map(Some).collect();
        let mut constructed = Vec::with_capacity(order.len());
        for index in order {
            let Some(registration) = slots[index].take() else {
                continue;
            };
            debug!(
                component = %registration.id,
                kind = ?registration.kind,
                "constructing component"
            );
            let previous = context.replace_owner(Some(registration.id.clone()));
            let built = (registration.constructor)(context);
            context.replace_owner(previous);
            context.insert_component(registration.id.clone(), registration.kind, built?);
            constructed.push(registration.id);
        }
        Ok(constructed)
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.registrations
                    .iter()
                    .map(|registration| (&registration.id, registration.kind)),
            )
            .finish()
    }
}

/// Topologically sorts `nodes` (id, dependencies). Ties between ready nodes are
/// broken by input position so the order is deterministic.
pub(crate) fn dependency_order<K>(
    nodes: &[(K, Vec<K>)],
    scope: &'static str,
) -> Result<Vec<usize>, KernelError>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    let mut positions = HashMap::with_capacity(nodes.len());
    for (index, (id, _)) in nodes.iter().enumerate() {
        if positions.insert(id.clone(), index).is_some() {
            return Err(KernelError::DuplicateComponent {
                scope,
                id: id.to_string(),
            });
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut pending: Vec<usize> = vec![0; nodes.len()];
    for (index, (id, dependencies)) in nodes.iter().enumerate() {
        for dependency in dependencies {
            let Some(&position) = positions.get(dependency) else {
                return Err(KernelError::MissingDependency {
                    scope,
                    dependent: id.to_string(),
                    dependency: dependency.to_string(),
                });
            };
            dependents[position].push(index);
            pending[index] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(index, _)| Reverse(index))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() < nodes.len() {
        let cycle = find_cycle(nodes, &positions, &pending);
        return Err(KernelError::CyclicDependency { scope, cycle });
    }
    Ok(order)
}

/// Walks dependencies from an unsorted node until a node repeats.
fn find_cycle<K>(nodes: &[(K, Vec<K>)], positions: &HashMap<K, usize>, pending: &[usize]) -> Vec<String>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    let Some(start) = pending.iter().position(|count| *count > 0) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = nodes[current]
            .1
            .iter()
            .filter_map(|dependency| positions.get(dependency).copied())
            .find(|position| pending[*position] > 0);
        let Some(next) = next else {
            break;
        };
        if let Some(repeat) = path.iter().position(|visited| *visited == next) {
            let mut cycle: Vec<String> = path[repeat..]
                .iter()
                .map(|index| nodes[*index].0.to_string())
                .collect();
            cycle.push(nodes[next].0.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.iter().map(|index| nodes[*index].0.to_string()).collect()
}

struct ComponentSlot {
    kind: ComponentKind,
    position: usize,
    value: Box<dyn Any>,
}

/// Constructed components of one scenario, in construction order.
#[derive(Default)]
pub(crate) struct ComponentStore {
    slots: HashMap<ComponentId, ComponentSlot>,
    order: Vec<ComponentId>,
}

impl ComponentStore {
    pub(crate) fn insert(&mut self, id: ComponentId, kind: ComponentKind, value: Box<dyn Any>) {
        let position = match self.slots.get(&id) {
            Some(slot) => slot.position,
            None => {
                self.order.push(id.clone());
                self.order.len() - 1
            }
        };
        self.slots.insert(id, ComponentSlot { kind, position, value });
    }

    pub(crate) fn contains(&self, id: &ComponentId) -> bool {
        self.slots.contains_key(id)
    }

    pub(crate) fn kind(&self, id: &ComponentId) -> Option<ComponentKind> {
        self.slots.get(id).map(|slot| slot.kind)
    }

    /// Construction position of a data manager, `None` for other kinds.
    pub(crate) fn data_manager_position(&self, id: &ComponentId) -> Option<usize> {
        self.slots
            .get(id)
            .filter(|slot| slot.kind == ComponentKind::DataManager)
            .map(|slot| slot.position)
    }

    pub(crate) fn get<T: Any>(&self, id: &ComponentId) -> Result<&T, KernelError> {
        let slot = self
            .slots
            .get(id)
            .ok_or_else(|| KernelError::UnknownComponent(id.clone()))?;
        slot.value
            .downcast_ref::<T>()
            .ok_or_else(|| KernelError::ComponentTypeMismatch {
                id: id.clone(),
                expected: type_name::<T>(),
            })
    }

    pub(crate) fn get_mut<T: Any>(&mut self, id: &ComponentId) -> Result<&mut T, KernelError> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| KernelError::UnknownComponent(id.clone()))?;
        slot.value
            .downcast_mut::<T>()
            .ok_or_else(|| KernelError::ComponentTypeMismatch {
                id: id.clone(),
                expected: type_name::<T>(),
            })
    }

    /// First constructed component of type `T`.
    pub(crate) fn find<T: Any>(&self) -> Option<(&ComponentId, &T)> {
        self.order.iter().find_map(|id| {
            self.slots
                .get(id)
                .and_then(|slot| slot.value.downcast_ref::<T>())
                .map(|value| (id, value))
        })
    }

    pub(crate) fn ids(&self) -> &[ComponentId] {
        &self.order
    }
}
