//! Partition engine: live label → entity set indexes over filtered entities.
//!
//! Defining a partition seeds its index with one pass over the population.
//! After that the index subscribes to the events its filter and labeler are
//! sensitive to and re-evaluates only the entities those events map to.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::Context;
use crate::entities::{
    AttributeId, EntityAddedEvent, EntityId, EntityRemovedEvent, EntityStore, Value, ENTITY_STORE,
};
use crate::error::KernelError;
use crate::events::SubscriptionId;
use crate::filter::{push_unique, Filter, FilterSensitivity};
use crate::registry::{ComponentId, ComponentRegistry};

pub const PARTITION_ENGINE: ComponentId = ComponentId::from_static("partition_engine");

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(Cow<'static, str>);

impl PartitionId {
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

impl From<&'static str> for PartitionId {
    fn from(id: &'static str) -> Self {
        Self::from_static(id)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bucket key of a partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label(Vec<Value>);

impl Label {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (position, value) in self.0.iter().enumerate() {
            if position > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

type LabelFn = Rc<dyn Fn(&Context, EntityId) -> Result<Label, KernelError>>;

/// Assigns each member entity its bucket label.
#[derive(Clone)]
pub struct Labeler {
    id: String,
    func: LabelFn,
    sensitivities: Vec<FilterSensitivity>,
    attributes: Vec<AttributeId>,
}

impl Labeler {
    /// `sensitivities` must cover every event that can change a label.
    pub fn new<F>(id: impl Into<String>, sensitivities: Vec<FilterSensitivity>, func: F) -> Self
    where
        F: Fn(&Context, EntityId) -> Result<Label, KernelError> + 'static,
    {
        Self {
            id: id.into(),
            func: Rc::new(func),
            sensitivities,
            attributes: Vec::new(),
        }
    }

    /// Puts every member in the single empty label.
    pub fn unlabeled() -> Self {
        Self::new("unlabeled", Vec::new(), |_, _| Ok(Label::default()))
    }

    pub fn by_attribute(attribute: impl Into<AttributeId>) -> Self {
        Self::by_attributes([attribute.into()])
    }

    /// Labels by the tuple of the given attribute values.
    pub fn by_attributes(attributes: impl IntoIterator<Item = AttributeId>) -> Self {
        let attributes: Vec<AttributeId> = attributes.into_iter().collect();
        let id = format!(
            "attributes:{}",
            attributes
                .iter()
                .map(AttributeId::as_str)
                .collect::<Vec<_>>()
                .join(",")
        );
        let sensitivities = attributes
            .iter()
            .map(FilterSensitivity::for_attribute)
            .collect();
        let read = attributes.clone();
        let mut labeler = Self::new(id, sensitivities, move |context, entity| {
            let store = context.get::<EntityStore>(&ENTITY_STORE)?;
            read.iter()
                .map(|attribute| store.value(entity, attribute).cloned())
                .collect::<Result<Vec<_>, _>>()
                .map(Label)
        });
        labeler.attributes = attributes;
        labeler
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Checks that every attribute the labeler reads is defined, so an
    /// unknown id fails at definition instead of on the first entity added.
    pub fn validate(&self, context: &Context) -> Result<(), KernelError> {
        let store = context.get::<EntityStore>(&ENTITY_STORE)?;
        self.attributes
            .iter()
            .try_for_each(|attribute| store.slot(attribute).map(|_| ()))
    }

    pub fn label(&self, context: &Context, entity: EntityId) -> Result<Label, KernelError> {
        (self.func)(context, entity)
    }
}

impl fmt::Debug for Labeler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Labeler").field("id", &self.id).finish()
    }
}

/// Entity ids with O(1) insert, remove and indexed access.
#[derive(Debug, Default, Clone)]
struct EntitySet {
    items: Vec<EntityId>,
    positions: HashMap<EntityId, usize>,
}

impl EntitySet {
    fn insert(&mut self, entity: EntityId) {
        if !self.positions.contains_key(&entity) {
            self.positions.insert(entity, self.items.len());
            self.items.push(entity);
        }
    }

    fn remove(&mut self, entity: EntityId) {
        let Some(position) = self.positions.remove(&entity) else {
            return;
        };
        self.items.swap_remove(position);
        if let Some(moved) = self.items.get(position) {
            self.positions.insert(*moved, position);
        }
    }

    fn contains(&self, entity: EntityId) -> bool {
        self.positions.contains_key(&entity)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn position(&self, entity: EntityId) -> Option<usize> {
        self.positions.get(&entity).copied()
    }

    /// Members other than `excluded`.
    fn candidates(&self, excluded: Option<EntityId>) -> usize {
        let skipped = excluded.is_some_and(|entity| self.contains(entity));
        self.len() - usize::from(skipped)
    }

    /// The `n`-th member, counting past `excluded`.
    fn nth_candidate(&self, n: usize, excluded: Option<EntityId>) -> Option<EntityId> {
        let skip = excluded.and_then(|entity| self.position(entity));
        let index = match skip {
            Some(position) if n >= position => n + 1,
            _ => n,
        };
        self.items.get(index).copied()
    }

    fn pick(&self, excluded: Option<EntityId>, rng: &mut StdRng) -> Option<EntityId> {
        let count = self.candidates(excluded);
        if count == 0 {
            return None;
        }
        self.nth_candidate(rng.gen_range(0..count), excluded)
    }
}

struct PartitionIndex {
    filter: Filter,
    labeler: Labeler,
    buckets: BTreeMap<Label, EntitySet>,
    membership: HashMap<EntityId, Label>,
    subscriptions: Vec<SubscriptionId>,
    names: usize,
}

impl PartitionIndex {
    fn new(filter: Filter, labeler: Labeler) -> Self {
        Self {
            filter,
            labeler,
            buckets: BTreeMap::new(),
            membership: HashMap::new(),
            subscriptions: Vec::new(),
            names: 1,
        }
    }

    /// Label the entity belongs under, or `None` if it is excluded.
    fn classify(&self, context: &Context, entity: EntityId) -> Result<Option<Label>, KernelError> {
        let store = context.get::<EntityStore>(&ENTITY_STORE)?;
        if !store.contains(entity) || !self.filter.evaluate(context, entity)? {
            return Ok(None);
        }
        self.labeler.label(context, entity).map(Some)
    }

    fn place(&mut self, entity: EntityId, label: Option<Label>) {
        if self.membership.get(&entity) == label.as_ref() {
            return;
        }
        if let Some(previous) = self.membership.remove(&entity) {
            if let Some(bucket) = self.buckets.get_mut(&previous) {
                bucket.remove(entity);
                if bucket.is_empty() {
                    self.buckets.remove(&previous);
                }
            }
        }
        if let Some(label) = label {
            self.buckets.entry(label.clone()).or_default().insert(entity);
            self.membership.insert(entity, label);
        }
    }

    fn size(&self) -> usize {
        self.membership.len()
    }
}

/// How [`ContextPartitionExt::sample_entity`] draws a member.
#[derive(Clone, Default)]
pub struct PartitionSampler {
    label: Option<Label>,
    excluded: Option<EntityId>,
    label_weights: Option<Rc<dyn Fn(&Label) -> f64>>,
    stream: Option<String>,
}

impl PartitionSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw only from `label`'s bucket.
    pub fn with_label(mut self, label: Label) -> Self {
        self.label = Some(label);
        self
    }

    pub fn excluding(mut self, entity: EntityId) -> Self {
        self.excluded = Some(entity);
        self
    }

    /// Pick a bucket with probability proportional to `weight(label)`, then a
    /// member uniformly. Ignored when a label is fixed.
    pub fn with_label_weights<F>(mut self, weight: F) -> Self
    where
        F: Fn(&Label) -> f64 + 'static,
    {
        self.label_weights = Some(Rc::new(weight));
        self
    }

    /// Use the named random stream instead of the main one.
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }
}

impl fmt::Debug for PartitionSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionSampler")
            .field("label", &self.label)
            .field("excluded", &self.excluded)
            .field("weighted", &self.label_weights.is_some())
            .field("stream", &self.stream)
            .finish()
    }
}

/// All partitions of one scenario. Slots of removed partitions stay empty so
/// that bound sensitivities never address a different index.
#[derive(Default)]
pub struct PartitionEngine {
    indexes: Vec<Option<PartitionIndex>>,
    names: HashMap<PartitionId, usize>,
}

impl PartitionEngine {
    fn index(&self, id: &PartitionId) -> Result<&PartitionIndex, KernelError> {
        self.names
            .get(id)
            .and_then(|slot| self.indexes.get(*slot))
            .and_then(Option::as_ref)
            .ok_or_else(|| KernelError::UnknownPartition(id.clone()))
    }

    fn live_slots(&self) -> Vec<usize> {
        self.indexes
            .iter()
            .enumerate()
            .filter(|(_, index)| index.is_some())
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Defined partition names, sorted.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.names.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of distinct indexes; aliases share one.
    pub fn index_count(&self) -> usize {
        self.indexes.iter().filter(|index| index.is_some()).count()
    }

    fn sample(
        &self,
        id: &PartitionId,
        sampler: &PartitionSampler,
        rng: &mut StdRng,
    ) -> Result<Option<EntityId>, KernelError> {
        let index = self.index(id)?;
        let excluded = sampler.excluded;

        if let Some(label) = &sampler.label {
            return Ok(index
                .buckets
                .get(label)
                .and_then(|bucket| bucket.pick(excluded, rng)));
        }

        let Some(weight_of) = &sampler.label_weights else {
            let total: usize = index
                .buckets
                .values()
                .map(|bucket| bucket.candidates(excluded))
                .sum();
            if total == 0 {
                return Ok(None);
            }
            let mut draw = rng.gen_range(0..total);
            for bucket in index.buckets.values() {
                let count = bucket.candidates(excluded);
                if draw < count {
                    return Ok(bucket.nth_candidate(draw, excluded));
                }
                draw -= count;
            }
            return Ok(None);
        };

        let mut weighted = Vec::new();
        let mut total = 0.0;
        for (label, bucket) in &index.buckets {
            if bucket.candidates(excluded) == 0 {
                continue;
            }
            let weight = weight_of(label);
            if !weight.is_finite() || weight < 0.0 {
                return Err(KernelError::InvalidSamplingWeight {
                    label: label.to_string(),
                    weight,
                });
            }
            if weight > 0.0 {
                weighted.push((bucket, weight));
                total += weight;
            }
        }
        if weighted.is_empty() {
            return Ok(None);
        }
        let mut draw = rng.gen::<f64>() * total;
        for (bucket, weight) in &weighted {
            if draw < *weight {
                return Ok(bucket.pick(excluded, rng));
            }
            draw -= weight;
        }
        // Rounding can leave `draw` just past the last weight.
        Ok(weighted
            .last()
            .and_then(|(bucket, _)| bucket.pick(excluded, rng)))
    }
}

impl fmt::Debug for PartitionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionEngine")
            .field("partitions", &self.partition_ids())
            .field("indexes", &self.index_count())
            .finish()
    }
}

/// Re-evaluates `entities` against the index in `slot` and moves them between
/// buckets.
fn refresh(context: &mut Context, slot: usize, entities: Vec<EntityId>) -> Result<(), KernelError> {
    let placements = {
        let engine = context.get::<PartitionEngine>(&PARTITION_ENGINE)?;
        let Some(index) = engine.indexes.get(slot).and_then(Option::as_ref) else {
            return Ok(());
        };
        let mut placements = Vec::with_capacity(entities.len());
        for entity in entities {
            placements.push((entity, index.classify(context, entity)?));
        }
        placements
    };
    let engine = context.get_mut::<PartitionEngine>(&PARTITION_ENGINE)?;
    if let Some(index) = engine.indexes.get_mut(slot).and_then(Option::as_mut) {
        for (entity, label) in placements {
            index.place(entity, label);
        }
    }
    Ok(())
}

/// Registers the partition engine as a data manager depending on the entity
/// store. It tracks entity additions and removals for every partition.
pub fn register_partition_engine(registry: &mut ComponentRegistry) -> Result<(), KernelError> {
    registry.add_data_manager(PARTITION_ENGINE, vec![ENTITY_STORE], |context| {
        context.subscribe::<EntityAddedEvent, _>(None, |context, event| {
            let slots = context.get::<PartitionEngine>(&PARTITION_ENGINE)?.live_slots();
            for slot in slots {
                refresh(context, slot, vec![event.entity])?;
            }
            Ok(())
        });
        context.subscribe::<EntityRemovedEvent, _>(None, |context, event| {
            let engine = context.get_mut::<PartitionEngine>(&PARTITION_ENGINE)?;
            for index in engine.indexes.iter_mut().flatten() {
                index.place(event.entity, None);
            }
            Ok(())
        });
        Ok(PartitionEngine::default())
    })
}

/// Partition and filter queries on a [`Context`] hosting a [`PartitionEngine`].
pub trait ContextPartitionExt {
    /// Defines a live partition of the entities passing `filter`, bucketed by
    /// `labeler`. A partition with an equal filter and the same labeler id
    /// shares the existing index.
    fn define_partition(
        &mut self,
        id: impl Into<PartitionId>,
        filter: Filter,
        labeler: Labeler,
    ) -> Result<PartitionId, KernelError>;
    fn remove_partition(&mut self, id: &PartitionId) -> Result<(), KernelError>;
    /// Members of `label`, sorted by id.
    fn entities_in_label(&self, id: &PartitionId, label: &Label) -> Result<Vec<EntityId>, KernelError>;
    /// Members of the whole partition, or of one label.
    fn partition_count(&self, id: &PartitionId, label: Option<&Label>) -> Result<usize, KernelError>;
    /// Non-empty labels, sorted.
    fn partition_labels(&self, id: &PartitionId) -> Result<Vec<Label>, KernelError>;
    fn partition_contains(&self, id: &PartitionId, entity: EntityId) -> Result<bool, KernelError>;
    fn partition_label_of(&self, id: &PartitionId, entity: EntityId) -> Result<Option<Label>, KernelError>;
    /// Direct, non-indexed evaluation of `filter` for one entity.
    fn entity_satisfies(&self, filter: &Filter, entity: EntityId) -> Result<bool, KernelError>;
    /// Full scan of the population, sorted by id.
    fn entities_matching(&self, filter: &Filter) -> Result<Vec<EntityId>, KernelError>;
    fn sample_entity(
        &mut self,
        id: &PartitionId,
        sampler: &PartitionSampler,
    ) -> Result<Option<EntityId>, KernelError>;
}

impl ContextPartitionExt for Context {
    fn define_partition(
        &mut self,
        id: impl Into<PartitionId>,
        filter: Filter,
        labeler: Labeler,
    ) -> Result<PartitionId, KernelError> {
        let id = id.into();
        let engine = self.get::<PartitionEngine>(&PARTITION_ENGINE)?;
        if engine.names.contains_key(&id) {
            return Err(KernelError::DuplicatePartition(id));
        }
        filter.validate(self)?;
        labeler.validate(self)?;

        let alias = engine.indexes.iter().position(|index| {
            index.as_ref().is_some_and(|index| {
                index.filter == filter && index.labeler.id() == labeler.id()
            })
        });
        if let Some(slot) = alias {
            let engine = self.get_mut::<PartitionEngine>(&PARTITION_ENGINE)?;
            if let Some(index) = engine.indexes[slot].as_mut() {
                index.names += 1;
            }
            engine.names.insert(id.clone(), slot);
            debug!(partition = %id, slot, "partition aliases an existing index");
            return Ok(id);
        }

        let mut index = PartitionIndex::new(filter, labeler);
        let population: Vec<EntityId> = self
            .get::<EntityStore>(&ENTITY_STORE)?
            .entities()
            .collect();
        for entity in population {
            let label = index.classify(self, entity)?;
            index.place(entity, label);
        }

        let mut sensitivities = Vec::new();
        for sensitivity in index
            .filter
            .sensitivities()
            .into_iter()
            .chain(index.labeler.sensitivities.iter().cloned())
        {
            push_unique(&mut sensitivities, sensitivity);
        }

        let slot = self.get::<PartitionEngine>(&PARTITION_ENGINE)?.indexes.len();
        let previous = self.replace_owner(Some(PARTITION_ENGINE));
        for sensitivity in &sensitivities {
            let subscription = sensitivity.bind(self, move |context, entities| {
                refresh(context, slot, entities)
            });
            index.subscriptions.push(subscription);
        }
        self.replace_owner(previous);

        debug!(
            partition = %id,
            members = index.size(),
            labels = index.buckets.len(),
            sensitivities = sensitivities.len(),
            "partition defined"
        );
        let engine = self.get_mut::<PartitionEngine>(&PARTITION_ENGINE)?;
        engine.indexes.push(Some(index));
        engine.names.insert(id.clone(), slot);
        Ok(id)
    }

    fn remove_partition(&mut self, id: &PartitionId) -> Result<(), KernelError> {
        let engine = self.get_mut::<PartitionEngine>(&PARTITION_ENGINE)?;
        let slot = engine
            .names
            .remove(id)
            .ok_or_else(|| KernelError::UnknownPartition(id.clone()))?;
        let Some(index) = engine.indexes[slot].as_mut() else {
            return Ok(());
        };
        index.names -= 1;
        if index.names > 0 {
            return Ok(());
        }
        let subscriptions = engine.indexes[slot]
            .take()
            .map(|index| index.subscriptions)
            .unwrap_or_default();
        for subscription in subscriptions {
            self.unsubscribe(subscription);
        }
        Ok(())
    }

    fn entities_in_label(&self, id: &PartitionId, label: &Label) -> Result<Vec<EntityId>, KernelError> {
        let index = self.get::<PartitionEngine>(&PARTITION_ENGINE)?.index(id)?;
        let mut members = index
            .buckets
            .get(label)
            .map(|bucket| bucket.items.clone())
            .unwrap_or_default();
        members.sort_unstable();
        Ok(members)
    }

    fn partition_count(&self, id: &PartitionId, label: Option<&Label>) -> Result<usize, KernelError> {
        let index = self.get::<PartitionEngine>(&PARTITION_ENGINE)?.index(id)?;
        Ok(match label {
            Some(label) => index.buckets.get(label).map_or(0, EntitySet::len),
            None => index.size(),
        })
    }

    fn partition_labels(&self, id: &PartitionId) -> Result<Vec<Label>, KernelError> {
        let index = self.get::<PartitionEngine>(&PARTITION_ENGINE)?.index(id)?;
        Ok(index.buckets.keys().cloned().collect())
    }

    fn partition_contains(&self, id: &PartitionId, entity: EntityId) -> Result<bool, KernelError> {
        let index = self.get::<PartitionEngine>(&PARTITION_ENGINE)?.index(id)?;
        Ok(index.membership.contains_key(&entity))
    }

    fn partition_label_of(&self, id: &PartitionId, entity: EntityId) -> Result<Option<Label>, KernelError> {
        let index = self.get::<PartitionEngine>(&PARTITION_ENGINE)?.index(id)?;
        Ok(index.membership.get(&entity).cloned())
    }

    fn entity_satisfies(&self, filter: &Filter, entity: EntityId) -> Result<bool, KernelError> {
        if !self.get::<EntityStore>(&ENTITY_STORE)?.contains(entity) {
            return Err(KernelError::UnknownEntity(entity));
        }
        filter.evaluate(self, entity)
    }

    fn entities_matching(&self, filter: &Filter) -> Result<Vec<EntityId>, KernelError> {
        let store = self.get::<EntityStore>(&ENTITY_STORE)?;
        let mut matching = Vec::new();
        for entity in store.entities() {
            if filter.evaluate(self, entity)? {
                matching.push(entity);
            }
        }
        Ok(matching)
    }

    fn sample_entity(
        &mut self,
        id: &PartitionId,
        sampler: &PartitionSampler,
    ) -> Result<Option<EntityId>, KernelError> {
        let (engine, rng) =
            self.component_and_rng::<PartitionEngine>(&PARTITION_ENGINE, sampler.stream.as_deref())?;
        engine.sample(id, sampler, rng)
    }
}
