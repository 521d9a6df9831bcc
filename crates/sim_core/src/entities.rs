//! Entity store: opaque entity ids with typed, optionally time-tracked
//! attributes.
//!
//! The store is an ordinary data manager registered under [`ENTITY_STORE`].
//! Mutations go through [`ContextEntitiesExt`] so that the change events
//! partitions depend on are published, and only when somebody listens.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::SimTime;
use crate::context::Context;
use crate::error::KernelError;
use crate::events::{Event, EventLabel};
use crate::registry::{ComponentId, ComponentRegistry};

pub const ENTITY_STORE: ComponentId = ComponentId::from_static("entity_store");

/// Attribute value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Text(_) => 3,
        }
    }
}

// Floats compare by total order so values can key maps and partitions.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Bool(value) => value.hash(state),
            Value::Int(value) => value.hash(state),
            Value::Float(value) => value.to_bits().hash(state),
            Value::Text(value) => value.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeId(Cow<'static, str>);

impl AttributeId {
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

impl From<&'static str> for AttributeId {
    fn from(id: &'static str) -> Self {
        Self::from_static(id)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declared attribute: id, value kind, default value, mutability and whether
/// the time of the last change is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub id: AttributeId,
    pub kind: ValueKind,
    pub default: Option<Value>,
    pub mutable: bool,
    pub track_time: bool,
}

impl AttributeDefinition {
    pub fn new(id: impl Into<AttributeId>, kind: ValueKind) -> Self {
        Self {
            id: id.into(),
            kind,
            default: None,
            mutable: true,
            track_time: false,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    pub fn track_time(mut self) -> Self {
        self.track_time = true;
        self
    }

    fn check(&self, value: &Value) -> Result<(), KernelError> {
        if value.kind() == self.kind {
            Ok(())
        } else {
            Err(KernelError::IncompatibleValue {
                attribute: self.id.clone(),
                expected: self.kind,
                actual: value.kind(),
            })
        }
    }
}

/// Attribute definitions the store starts with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityStoreConfig {
    pub attributes: Vec<AttributeDefinition>,
}

impl EntityStoreConfig {
    pub fn with_attribute(mut self, definition: AttributeDefinition) -> Self {
        self.attributes.push(definition);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityAddedEvent {
    pub entity: EntityId,
}

impl Event for EntityAddedEvent {}

/// Published after the entity is gone; its attributes can no longer be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRemovedEvent {
    pub entity: EntityId,
}

impl Event for EntityRemovedEvent {}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChangedEvent {
    pub entity: EntityId,
    pub attribute: AttributeId,
    pub previous: Value,
    pub current: Value,
}

impl AttributeChangedEvent {
    pub const ATTRIBUTE: &'static str = "attribute";
    pub const ENTITY: &'static str = "entity";

    /// Routing label selecting changes of one attribute.
    pub fn attribute_label(attribute: &AttributeId) -> EventLabel {
        EventLabel::new(Self::ATTRIBUTE, attribute.as_str())
    }

    /// Routing label selecting changes to one entity.
    pub fn entity_label(entity: EntityId) -> EventLabel {
        EventLabel::new(Self::ENTITY, Value::Int(entity.0 as i64))
    }
}

impl Event for AttributeChangedEvent {
    fn labels(&self) -> Vec<EventLabel> {
        vec![
            Self::attribute_label(&self.attribute),
            Self::entity_label(self.entity),
        ]
    }
}

struct Column {
    definition: AttributeDefinition,
    values: Vec<Option<Value>>,
    changed_at: Vec<Option<SimTime>>,
}

/// Columnar attribute storage indexed by entity id.
#[derive(Default)]
pub struct EntityStore {
    columns: Vec<Column>,
    slots: HashMap<AttributeId, usize>,
    alive: Vec<bool>,
    population: usize,
}

impl EntityStore {
    pub fn new(config: &EntityStoreConfig) -> Result<Self, KernelError> {
        let mut store = Self::default();
        for definition in &config.attributes {
            store.define(definition.clone())?;
        }
        Ok(store)
    }

    /// Adds an attribute column; existing entities read its default.
    pub fn define(&mut self, definition: AttributeDefinition) -> Result<usize, KernelError> {
        if self.slots.contains_key(&definition.id) {
            return Err(KernelError::DuplicateAttribute(definition.id));
        }
        if let Some(default) = &definition.default {
            definition.check(default)?;
        }
        let slot = self.columns.len();
        self.slots.insert(definition.id.clone(), slot);
        self.columns.push(Column {
            definition,
            values: vec![None; self.alive.len()],
            changed_at: vec![None; self.alive.len()],
        });
        Ok(slot)
    }

    /// Column index of `attribute`.
    pub fn slot(&self, attribute: &AttributeId) -> Result<usize, KernelError> {
        self.slots
            .get(attribute)
            .copied()
            .ok_or_else(|| KernelError::UnknownAttributeId(attribute.clone()))
    }

    pub fn definition(&self, attribute: &AttributeId) -> Result<&AttributeDefinition, KernelError> {
        Ok(&self.columns[self.slot(attribute)?].definition)
    }

    pub(crate) fn slot_definition(&self, slot: usize) -> Option<&AttributeDefinition> {
        self.columns.get(slot).map(|column| &column.definition)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &AttributeDefinition> + '_ {
        self.columns.iter().map(|column| &column.definition)
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.alive.get(entity.index()).copied().unwrap_or(false)
    }

    pub fn population(&self) -> usize {
        self.population
    }

    /// Live entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, alive)| **alive)
            .map(|(index, _)| EntityId(index as u64))
    }

    fn ensure_alive(&self, entity: EntityId) -> Result<(), KernelError> {
        if self.contains(entity) {
            Ok(())
        } else {
            Err(KernelError::UnknownEntity(entity))
        }
    }

    /// Value at column `slot`, falling back to the attribute default.
    pub fn value_at(&self, slot: usize, entity: EntityId) -> Result<&Value, KernelError> {
        self.ensure_alive(entity)?;
        let column = &self.columns[slot];
        column.values[entity.index()]
            .as_ref()
            .or(column.definition.default.as_ref())
            .ok_or_else(|| KernelError::MissingAttributeValue {
                entity,
                attribute: column.definition.id.clone(),
            })
    }

    pub fn value(&self, entity: EntityId, attribute: &AttributeId) -> Result<&Value, KernelError> {
        self.value_at(self.slot(attribute)?, entity)
    }

    /// Time of the last change, or of the entity's addition if it never
    /// changed. `None` for attributes that do not track time.
    pub fn change_time(
        &self,
        entity: EntityId,
        attribute: &AttributeId,
    ) -> Result<Option<SimTime>, KernelError> {
        let slot = self.slot(attribute)?;
        self.ensure_alive(entity)?;
        Ok(self.columns[slot].changed_at[entity.index()])
    }

    fn insert(
        &mut self,
        values: Vec<(AttributeId, Value)>,
        now: SimTime,
    ) -> Result<EntityId, KernelError> {
        let mut row: Vec<Option<Value>> = vec![None; self.columns.len()];
        for (attribute, value) in values {
            let slot = self.slot(&attribute)?;
            self.columns[slot].definition.check(&value)?;
            row[slot] = Some(value);
        }
        let entity = EntityId(self.alive.len() as u64);
        for (column, value) in self.columns.iter().zip(&row) {
            if value.is_none() && column.definition.default.is_none() {
                return Err(KernelError::MissingAttributeValue {
                    entity,
                    attribute: column.definition.id.clone(),
                });
            }
        }
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.values.push(value);
            column
                .changed_at
                .push(column.definition.track_time.then_some(now));
        }
        self.alive.push(true);
        self.population += 1;
        Ok(entity)
    }

    fn remove(&mut self, entity: EntityId) -> Result<(), KernelError> {
        self.ensure_alive(entity)?;
        self.alive[entity.index()] = false;
        for column in &mut self.columns {
            column.values[entity.index()] = None;
        }
        self.population -= 1;
        Ok(())
    }

    /// Stores `value` and returns the previous one.
    fn update(
        &mut self,
        entity: EntityId,
        attribute: &AttributeId,
        value: Value,
        now: SimTime,
    ) -> Result<Value, KernelError> {
        let slot = self.slot(attribute)?;
        let definition = &self.columns[slot].definition;
        if !definition.mutable {
            return Err(KernelError::ImmutableAttribute(attribute.clone()));
        }
        definition.check(&value)?;
        let previous = self.value_at(slot, entity)?.clone();
        let column = &mut self.columns[slot];
        column.values[entity.index()] = Some(value);
        if column.definition.track_time {
            column.changed_at[entity.index()] = Some(now);
        }
        Ok(previous)
    }
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("attributes", &self.columns.len())
            .field("population", &self.population)
            .finish()
    }
}

/// Registers the entity store as a dependency-free data manager.
pub fn register_entity_store(
    registry: &mut ComponentRegistry,
    config: EntityStoreConfig,
) -> Result<(), KernelError> {
    registry.add_data_manager(ENTITY_STORE, Vec::new(), move |_| {
        let store = EntityStore::new(&config)?;
        debug!(attributes = config.attributes.len(), "entity store ready");
        Ok(store)
    })
}

/// Entity operations on a [`Context`] that hosts an [`EntityStore`].
pub trait ContextEntitiesExt {
    fn entity_store(&self) -> Result<&EntityStore, KernelError>;
    fn define_attribute(&mut self, definition: AttributeDefinition) -> Result<(), KernelError>;
    fn add_entity<I>(&mut self, values: I) -> Result<EntityId, KernelError>
    where
        I: IntoIterator<Item = (AttributeId, Value)>;
    fn remove_entity(&mut self, entity: EntityId) -> Result<(), KernelError>;
    fn set_attribute(
        &mut self,
        entity: EntityId,
        attribute: &AttributeId,
        value: impl Into<Value>,
    ) -> Result<(), KernelError>;
    fn attribute_value(&self, entity: EntityId, attribute: &AttributeId) -> Result<Value, KernelError>;
    fn attribute_change_time(
        &self,
        entity: EntityId,
        attribute: &AttributeId,
    ) -> Result<Option<SimTime>, KernelError>;
    fn population(&self) -> Result<usize, KernelError>;
    fn entity_exists(&self, entity: EntityId) -> bool;
}

impl ContextEntitiesExt for Context {
    fn entity_store(&self) -> Result<&EntityStore, KernelError> {
        self.get::<EntityStore>(&ENTITY_STORE)
    }

    fn define_attribute(&mut self, definition: AttributeDefinition) -> Result<(), KernelError> {
        self.get_mut::<EntityStore>(&ENTITY_STORE)?
            .define(definition)
            .map(|_| ())
    }

    fn add_entity<I>(&mut self, values: I) -> Result<EntityId, KernelError>
    where
        I: IntoIterator<Item = (AttributeId, Value)>,
    {
        let now = self.now();
        let entity = self
            .get_mut::<EntityStore>(&ENTITY_STORE)?
            .insert(values.into_iter().collect(), now)?;
        if self.has_subscribers::<EntityAddedEvent>() {
            self.publish(EntityAddedEvent { entity })?;
        }
        Ok(entity)
    }

    fn remove_entity(&mut self, entity: EntityId) -> Result<(), KernelError> {
        self.get_mut::<EntityStore>(&ENTITY_STORE)?.remove(entity)?;
        if self.has_subscribers::<EntityRemovedEvent>() {
            self.publish(EntityRemovedEvent { entity })?;
        }
        Ok(())
    }

    fn set_attribute(
        &mut self,
        entity: EntityId,
        attribute: &AttributeId,
        value: impl Into<Value>,
    ) -> Result<(), KernelError> {
        let now = self.now();
        let current = value.into();
        let previous = self.get_mut::<EntityStore>(&ENTITY_STORE)?.update(
            entity,
            attribute,
            current.clone(),
            now,
        )?;
        if self.has_subscribers::<AttributeChangedEvent>() {
            self.publish(AttributeChangedEvent {
                entity,
                attribute: attribute.clone(),
                previous,
                current,
            })?;
        }
        Ok(())
    }

    fn attribute_value(&self, entity: EntityId, attribute: &AttributeId) -> Result<Value, KernelError> {
        self.entity_store()?.value(entity, attribute).cloned()
    }

    fn attribute_change_time(
        &self,
        entity: EntityId,
        attribute: &AttributeId,
    ) -> Result<Option<SimTime>, KernelError> {
        self.entity_store()?.change_time(entity, attribute)
    }

    fn population(&self) -> Result<usize, KernelError> {
        Ok(self.entity_store()?.population())
    }

    fn entity_exists(&self, entity: EntityId) -> bool {
        self.entity_store()
            .map(|store| store.contains(entity))
            .unwrap_or(false)
    }
}
