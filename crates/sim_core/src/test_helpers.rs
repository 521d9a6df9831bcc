//! Test helpers for common test setup and utilities.
//!
//! Provides a seeded context hosting the entity store and partition engine with
//! a small set of person-like attributes, plus population builders, so tests
//! and benches share one fixture.

use rand::Rng;

use crate::context::Context;
use crate::entities::{
    register_entity_store, AttributeDefinition, AttributeId, ContextEntitiesExt, EntityId,
    EntityStoreConfig, Value, ValueKind,
};
use crate::error::KernelError;
use crate::partition::register_partition_engine;
use crate::registry::ComponentRegistry;

pub const REGION: AttributeId = AttributeId::from_static("region");
pub const AGE: AttributeId = AttributeId::from_static("age");
pub const VACCINATED: AttributeId = AttributeId::from_static("vaccinated");
pub const HEALTH: AttributeId = AttributeId::from_static("health");

pub const REGIONS: [&str; 3] = ["north", "south", "east"];
pub const HEALTH_STATES: [&str; 3] = ["susceptible", "infected", "recovered"];

/// Attribute definitions used by [`test_context`].
pub fn test_entity_config() -> EntityStoreConfig {
    EntityStoreConfig::default()
        .with_attribute(AttributeDefinition::new(REGION, ValueKind::Text))
        .with_attribute(AttributeDefinition::new(AGE, ValueKind::Int).with_default(0))
        .with_attribute(AttributeDefinition::new(VACCINATED, ValueKind::Bool).with_default(false))
        .with_attribute(
            AttributeDefinition::new(HEALTH, ValueKind::Text)
                .with_default("susceptible")
                .track_time(),
        )
}

/// Registry with the entity store and partition engine.
pub fn test_registry() -> Result<ComponentRegistry, KernelError> {
    let mut registry = ComponentRegistry::new();
    register_entity_store(&mut registry, test_entity_config())?;
    register_partition_engine(&mut registry)?;
    Ok(registry)
}

/// A context with the standard test components constructed.
///
/// # Panics
///
/// Panics if the fixture registry fails to resolve (should never happen).
pub fn test_context(seed: u64) -> Context {
    let mut context = Context::with_seed(seed);
    test_registry()
        .and_then(|registry| registry.resolve(&mut context))
        .expect("test registry should resolve");
    context
}

/// Adds one entity with the given attributes.
pub fn add_person(
    context: &mut Context,
    region: &str,
    age: i64,
    vaccinated: bool,
) -> Result<EntityId, KernelError> {
    context.add_entity([
        (REGION, Value::from(region)),
        (AGE, Value::Int(age)),
        (VACCINATED, Value::Bool(vaccinated)),
    ])
}

/// Adds `count` entities with attributes drawn from the context's `population`
/// random stream.
pub fn populate(context: &mut Context, count: usize) -> Result<Vec<EntityId>, KernelError> {
    let mut entities = Vec::with_capacity(count);
    for _ in 0..count {
        let rng = context.rng_stream("population");
        let region = REGIONS[rng.gen_range(0..REGIONS.len())];
        let age = rng.gen_range(0..90);
        let vaccinated = rng.gen_bool(0.4);
        entities.push(add_person(context, region, age, vaccinated)?);
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ENTITY_STORE;
    use crate::partition::PARTITION_ENGINE;

    #[test]
    fn fixture_builds_store_and_engine() {
        let context = test_context(1);
        assert_eq!(context.component_ids(), &[ENTITY_STORE, PARTITION_ENGINE]);
    }

    #[test]
    fn populate_is_deterministic_per_seed() {
        let mut a = test_context(9);
        let mut b = test_context(9);
        populate(&mut a, 20).unwrap();
        populate(&mut b, 20).unwrap();
        for raw in 0..20 {
            let entity = EntityId::from_raw(raw);
            assert_eq!(
                a.attribute_value(entity, &REGION).unwrap(),
                b.attribute_value(entity, &REGION).unwrap()
            );
        }
        assert_eq!(a.population().unwrap(), 20);
    }
}
