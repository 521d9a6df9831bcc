#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use sim_core::test_helpers::{populate, test_registry, HEALTH, REGION};
use sim_core::{
    ComponentId, ComponentRegistry, Context, ContextEntitiesExt, ContextPartitionExt, EntityId,
    Filter, KernelError, Labeler, PartitionId, PartitionSampler, Plan, SimTime, Value,
    ENTITY_STORE, PARTITION_ENGINE,
};

pub const EPIDEMIC: ComponentId = ComponentId::from_static("epidemic");
pub const SUSCEPTIBLE: PartitionId = PartitionId::from_static("susceptible_by_region");

/// Knobs of the small contact model used across integration tests.
#[derive(Debug, Clone, Copy)]
pub struct EpidemicConfig {
    pub population: usize,
    pub initial_infections: usize,
    pub contacts_per_tick: usize,
    pub recovery_delay: SimTime,
    pub horizon: SimTime,
}

impl Default for EpidemicConfig {
    fn default() -> Self {
        Self {
            population: 60,
            initial_infections: 2,
            contacts_per_tick: 2,
            recovery_delay: 4,
            horizon: 12,
        }
    }
}

/// Output released for every new infection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Infection {
    pub entity: EntityId,
    pub time: SimTime,
}

/// Entity store, partition engine and an actor that spreads infection through
/// the susceptible partition once per tick until `horizon`.
pub fn epidemic_registry(config: EpidemicConfig) -> ComponentRegistry {
    let mut registry = test_registry().expect("fixture registry");
    registry
        .add_actor(EPIDEMIC, vec![ENTITY_STORE, PARTITION_ENGINE], move |context| {
            populate(context, config.population)?;
            context.define_partition(
                SUSCEPTIBLE,
                Filter::equals(HEALTH, "susceptible"),
                Labeler::by_attribute(REGION),
            )?;
            for _ in 0..config.initial_infections {
                infect_random(context, config)?;
            }
            schedule_tick(context, 1, config)
        })
        .expect("epidemic actor registers once");
    registry
}

fn schedule_tick(context: &mut Context, time: SimTime, config: EpidemicConfig) -> Result<(), KernelError> {
    if time > config.horizon {
        return Ok(());
    }
    context.schedule_at(time, move |context| {
        for _ in 0..config.contacts_per_tick {
            infect_random(context, config)?;
        }
        schedule_tick(context, time + 1, config)
    })?;
    Ok(())
}

fn infect_random(context: &mut Context, config: EpidemicConfig) -> Result<(), KernelError> {
    let sampler = PartitionSampler::new().with_stream("contacts");
    let Some(entity) = context.sample_entity(&SUSCEPTIBLE, &sampler)? else {
        return Ok(());
    };
    context.set_attribute(entity, &HEALTH, "infected")?;
    context.release_output(Infection {
        entity,
        time: context.now(),
    });
    let recover_at = context.now() + config.recovery_delay;
    context.schedule_plan(
        Plan::new(recover_at, move |context| {
            context.set_attribute(entity, &HEALTH, "recovered")
        })
        .with_key(format!("recover-{}", entity.raw())),
    )?;
    Ok(())
}

/// Health of every live entity, in id order.
pub fn health_states(context: &Context) -> Vec<(EntityId, Value)> {
    let store = context.entity_store().expect("entity store");
    store
        .entities()
        .map(|entity| {
            let health = store.value(entity, &HEALTH).expect("health").clone();
            (entity, health)
        })
        .collect()
}

/// Shared log for closures that record what they observe.
pub fn shared_log<T>() -> Rc<RefCell<Vec<T>>> {
    Rc::new(RefCell::new(Vec::new()))
}
