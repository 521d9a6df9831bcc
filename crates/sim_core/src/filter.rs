//! Boolean filter expressions over entity attributes.
//!
//! Filters are immutable trees of attribute comparisons, custom predicates and
//! AND/OR/NOT combinators. They can be evaluated directly against a
//! [`Context`] or used to define incrementally maintained partitions, in which
//! case their [`FilterSensitivity`] list tells the partition engine which
//! events may change an entity's membership.

use std::any::TypeId;
use std::cell::OnceCell;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops;
use std::rc::Rc;

use crate::context::Context;
use crate::entities::{AttributeChangedEvent, AttributeId, EntityId, EntityStore, Value, ENTITY_STORE};
use crate::error::KernelError;
use crate::events::{Event, EventLabel, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Equal => ordering == Ordering::Equal,
            Comparison::NotEqual => ordering != Ordering::Equal,
            Comparison::Less => ordering == Ordering::Less,
            Comparison::LessOrEqual => ordering != Ordering::Greater,
            Comparison::Greater => ordering == Ordering::Greater,
            Comparison::GreaterOrEqual => ordering != Ordering::Less,
        }
    }
}

/// `attribute <comparison> value`.
#[derive(Debug, Clone)]
pub struct AttributeFilter {
    attribute: AttributeId,
    comparison: Comparison,
    value: Value,
    slot: OnceCell<usize>,
}

impl AttributeFilter {
    pub fn attribute(&self) -> &AttributeId {
        &self.attribute
    }

    pub fn comparison(&self) -> Comparison {
        self.comparison
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Column of the attribute, cached after the first successful lookup.
    fn resolve_slot(&self, store: &EntityStore) -> Result<usize, KernelError> {
        if let Some(&slot) = self.slot.get() {
            // A filter cloned into another scenario may see a different layout.
            if store
                .slot_definition(slot)
                .is_some_and(|definition| definition.id == self.attribute)
            {
                return Ok(slot);
            }
            return store.slot(&self.attribute);
        }
        let slot = store.slot(&self.attribute)?;
        let _ = self.slot.set(slot);
        Ok(slot)
    }

    fn evaluate(&self, store: &EntityStore, entity: EntityId) -> Result<bool, KernelError> {
        let slot = self.resolve_slot(store)?;
        let value = store.value_at(slot, entity)?;
        Ok(self.comparison.holds(value.cmp(&self.value)))
    }
}

type Predicate = Rc<dyn Fn(&Context, EntityId) -> Result<bool, KernelError>>;

/// A named predicate. Two custom filters are equal when their ids are.
#[derive(Clone)]
pub struct CustomFilter {
    id: String,
    predicate: Predicate,
    sensitivities: Vec<FilterSensitivity>,
}

impl CustomFilter {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for CustomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomFilter")
            .field("id", &self.id)
            .field("sensitivities", &self.sensitivities.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Filter {
    True,
    False,
    Attribute(AttributeFilter),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Custom(CustomFilter),
}

impl Filter {
    pub fn attribute(
        attribute: impl Into<AttributeId>,
        comparison: Comparison,
        value: impl Into<Value>,
    ) -> Self {
        Filter::Attribute(AttributeFilter {
            attribute: attribute.into(),
            comparison,
            value: value.into(),
            slot: OnceCell::new(),
        })
    }

    pub fn equals(attribute: impl Into<AttributeId>, value: impl Into<Value>) -> Self {
        Self::attribute(attribute, Comparison::Equal, value)
    }

    /// A predicate filter. `sensitivities` must cover every event that can
    /// change the predicate's result if the filter is used in a partition.
    pub fn custom<F>(id: impl Into<String>, sensitivities: Vec<FilterSensitivity>, predicate: F) -> Self
    where
        F: Fn(&Context, EntityId) -> Result<bool, KernelError> + 'static,
    {
        Filter::Custom(CustomFilter {
            id: id.into(),
            predicate: Rc::new(predicate),
            sensitivities,
        })
    }

    /// Conjunction of `filters`. Nested conjunctions are flattened, `True`
    /// operands dropped and any `False` operand absorbs the whole expression.
    /// An empty conjunction is `True`.
    pub fn all(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut operands = Vec::new();
        for filter in filters {
            match filter {
                Filter::True => {}
                Filter::False => return Filter::False,
                Filter::And(nested) => operands.extend(nested),
                other => operands.push(other),
            }
        }
        match operands.len() {
            0 => Filter::True,
            1 => operands.pop().unwrap_or(Filter::True),
            _ => Filter::And(operands),
        }
    }

    /// Disjunction of `filters`; the dual of [`Filter::all`]. An empty
    /// disjunction is `False`.
    pub fn any(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut operands = Vec::new();
        for filter in filters {
            match filter {
                Filter::False => {}
                Filter::True => return Filter::True,
                Filter::Or(nested) => operands.extend(nested),
                other => operands.push(other),
            }
        }
        match operands.len() {
            0 => Filter::False,
            1 => operands.pop().unwrap_or(Filter::False),
            _ => Filter::Or(operands),
        }
    }

    pub fn negate(filter: Filter) -> Self {
        match filter {
            Filter::True => Filter::False,
            Filter::False => Filter::True,
            other => Filter::Not(Box::new(other)),
        }
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::all([self, other])
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::any([self, other])
    }

    /// Evaluates the filter for one entity, short-circuiting AND/OR.
    pub fn evaluate(&self, context: &Context, entity: EntityId) -> Result<bool, KernelError> {
        match self {
            Filter::True => Ok(true),
            Filter::False => Ok(false),
            Filter::Attribute(filter) => {
                let store = context.get::<EntityStore>(&ENTITY_STORE)?;
                filter.evaluate(store, entity)
            }
            Filter::And(operands) => {
                for operand in operands {
                    if !operand.evaluate(context, entity)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(operands) => {
                for operand in operands {
                    if operand.evaluate(context, entity)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Not(inner) => Ok(!inner.evaluate(context, entity)?),
            Filter::Custom(custom) => (custom.predicate)(context, entity),
        }
    }

    /// Resolves and caches every attribute lookup, failing with
    /// `UnknownAttributeId` or `IncompatibleValue` before first use.
    pub fn validate(&self, context: &Context) -> Result<(), KernelError> {
        match self {
            Filter::True | Filter::False | Filter::Custom(_) => Ok(()),
            Filter::Attribute(filter) => {
                let store = context.get::<EntityStore>(&ENTITY_STORE)?;
                let slot = filter.resolve_slot(store)?;
                let expected = store
                    .slot_definition(slot)
                    .map(|definition| definition.kind)
                    .ok_or_else(|| KernelError::UnknownAttributeId(filter.attribute.clone()))?;
                if expected != filter.value.kind() {
                    return Err(KernelError::IncompatibleValue {
                        attribute: filter.attribute.clone(),
                        expected,
                        actual: filter.value.kind(),
                    });
                }
                Ok(())
            }
            Filter::And(operands) | Filter::Or(operands) => {
                operands.iter().try_for_each(|operand| operand.validate(context))
            }
            Filter::Not(inner) => inner.validate(context),
        }
    }

    /// Events that may change the result of this filter, without duplicates.
    pub fn sensitivities(&self) -> Vec<FilterSensitivity> {
        let mut collected = Vec::new();
        self.collect_sensitivities(&mut collected);
        collected
    }

    fn collect_sensitivities(&self, collected: &mut Vec<FilterSensitivity>) {
        match self {
            Filter::True | Filter::False => {}
            Filter::Attribute(filter) => {
                push_unique(collected, FilterSensitivity::for_attribute(&filter.attribute))
            }
            Filter::And(operands) | Filter::Or(operands) => {
                for operand in operands {
                    operand.collect_sensitivities(collected);
                }
            }
            Filter::Not(inner) => inner.collect_sensitivities(collected),
            Filter::Custom(custom) => {
                for sensitivity in &custom.sensitivities {
                    push_unique(collected, sensitivity.clone());
                }
            }
        }
    }
}

pub(crate) fn push_unique(collected: &mut Vec<FilterSensitivity>, sensitivity: FilterSensitivity) {
    if !collected.iter().any(|existing| existing.same_as(&sensitivity)) {
        collected.push(sensitivity);
    }
}

impl ops::Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        Filter::negate(self)
    }
}

fn multiset_eq(left: &[Filter], right: &[Filter]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut used = vec![false; right.len()];
    left.iter().all(|candidate| {
        match right
            .iter()
            .enumerate()
            .position(|(index, other)| !used[index] && other == candidate)
        {
            Some(index) => {
                used[index] = true;
                true
            }
            None => false,
        }
    })
}

/// Structural equality, commutative for AND and OR operands.
impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Filter::True, Filter::True) | (Filter::False, Filter::False) => true,
            (Filter::Attribute(a), Filter::Attribute(b)) => {
                a.attribute == b.attribute && a.comparison == b.comparison && a.value == b.value
            }
            (Filter::And(a), Filter::And(b)) | (Filter::Or(a), Filter::Or(b)) => multiset_eq(a, b),
            (Filter::Not(a), Filter::Not(b)) => a == b,
            (Filter::Custom(a), Filter::Custom(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl Eq for Filter {}

impl Hash for Filter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Filter::True | Filter::False => {}
            Filter::Attribute(filter) => {
                filter.attribute.hash(state);
                filter.comparison.hash(state);
                filter.value.hash(state);
            }
            Filter::And(operands) | Filter::Or(operands) => {
                // Order-independent combination of the operand hashes.
                let combined = operands.iter().fold(0u64, |sum, operand| {
                    let mut hasher = DefaultHasher::new();
                    operand.hash(&mut hasher);
                    sum.wrapping_add(hasher.finish())
                });
                operands.len().hash(state);
                combined.hash(state);
            }
            Filter::Not(inner) => inner.hash(state),
            Filter::Custom(custom) => custom.id.hash(state),
        }
    }
}

type AffectedHandler = Rc<dyn Fn(&mut Context, Vec<EntityId>) -> Result<(), KernelError>>;
type Binder = Rc<dyn Fn(&mut Context, Option<EventLabel>, AffectedHandler) -> SubscriptionId>;

/// Declares that events of one type may change the filter membership (or the
/// label) of the entities the event maps to.
#[derive(Clone)]
pub struct FilterSensitivity {
    event_type: TypeId,
    event_name: &'static str,
    label: Option<EventLabel>,
    origin: Option<AttributeId>,
    binder: Binder,
}

impl FilterSensitivity {
    /// Sensitivity to every `E`; `affected` maps an event to the entities to
    /// re-evaluate (possibly none).
    pub fn new<E, F>(affected: F) -> Self
    where
        E: Event,
        F: Fn(&Context, &E) -> Vec<EntityId> + 'static,
    {
        let affected = Rc::new(affected);
        let binder: Binder = Rc::new(
            move |context: &mut Context, label: Option<EventLabel>, on_affected: AffectedHandler| {
                let affected = Rc::clone(&affected);
                context.subscribe::<E, _>(label, move |context, event| {
                    let entities = affected(context, event);
                    if entities.is_empty() {
                        return Ok(());
                    }
                    on_affected(context, entities)
                })
            },
        );
        Self {
            event_type: TypeId::of::<E>(),
            event_name: std::any::type_name::<E>(),
            label: None,
            origin: None,
            binder,
        }
    }

    /// Restricts the sensitivity to events carrying `label`.
    pub fn with_label(mut self, label: EventLabel) -> Self {
        self.label = Some(label);
        self
    }

    /// Changes of `attribute` affect the changed entity.
    pub fn for_attribute(attribute: &AttributeId) -> Self {
        let mut sensitivity = Self::new::<AttributeChangedEvent, _>(|_, event| vec![event.entity])
            .with_label(AttributeChangedEvent::attribute_label(attribute));
        sensitivity.origin = Some(attribute.clone());
        sensitivity
    }

    pub fn event_name(&self) -> &'static str {
        self.event_name
    }

    pub fn label(&self) -> Option<&EventLabel> {
        self.label.as_ref()
    }

    fn same_as(&self, other: &Self) -> bool {
        self.event_type == other.event_type
            && self.label == other.label
            && match (&self.origin, &other.origin) {
                (Some(a), Some(b)) => a == b,
                _ => Rc::ptr_eq(&self.binder, &other.binder),
            }
    }

    /// Subscribes on behalf of the current owner; `on_affected` receives the
    /// entities each matching event maps to.
    pub(crate) fn bind<F>(&self, context: &mut Context, on_affected: F) -> SubscriptionId
    where
        F: Fn(&mut Context, Vec<EntityId>) -> Result<(), KernelError> + 'static,
    {
        (self.binder)(context, self.label.clone(), Rc::new(on_affected))
    }
}

impl fmt::Debug for FilterSensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterSensitivity")
            .field("event", &self.event_name)
            .field("label", &self.label)
            .finish()
    }
}
