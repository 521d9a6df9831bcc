#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use sim_core::entities::register_entity_store;
use sim_core::partition::register_partition_engine;
use sim_core::test_helpers::{populate, test_entity_config, HEALTH};
use sim_core::{
    ComponentId, Context, ContextEntitiesExt, ContextPartitionExt, EntityId, EntityStoreConfig,
    Filter, KernelError, Labeler, PartitionId, PartitionSampler, Plan, Plugin, SimTime,
    ENTITY_STORE, PARTITION_ENGINE,
};
use sim_experiments::{Dimension, ScenarioOutput};

pub const OUTBREAK: ComponentId = ComponentId::from_static("outbreak");
pub const SUSCEPTIBLE: PartitionId = PartitionId::from_static("susceptible");

/// Plugin data of the outbreak model.
#[derive(Debug, Clone, Copy)]
pub struct Outbreak {
    pub population: usize,
    pub initial_infections: usize,
    pub contacts_per_tick: usize,
    pub recovery_delay: SimTime,
    pub horizon: SimTime,
    /// The tick at this time returns a model error.
    pub fail_at: Option<SimTime>,
}

impl Default for Outbreak {
    fn default() -> Self {
        Self {
            population: 40,
            initial_infections: 1,
            contacts_per_tick: 1,
            recovery_delay: 3,
            horizon: 10,
            fail_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Infection {
    pub entity: EntityId,
    pub time: SimTime,
}

/// Entity store and partition engine.
pub fn population_plugin() -> Plugin {
    Plugin::builder("population")
        .with_data(test_entity_config())
        .with_initializer(|plugin| {
            let config = plugin.data::<EntityStoreConfig>()?.clone();
            register_entity_store(plugin.registry(), config)?;
            register_partition_engine(plugin.registry())
        })
        .build()
}

/// Infects one susceptible entity per contact and tick until `horizon`.
pub fn outbreak_plugin() -> Plugin {
    Plugin::builder("outbreak")
        .depends_on("population")
        .with_data(Outbreak::default())
        .with_initializer(|plugin| {
            let outbreak = *plugin.data::<Outbreak>()?;
            plugin.add_actor(OUTBREAK, vec![ENTITY_STORE, PARTITION_ENGINE], move |context| {
                populate(context, outbreak.population)?;
                context.define_partition(
                    SUSCEPTIBLE,
                    Filter::equals(HEALTH, "susceptible"),
                    Labeler::unlabeled(),
                )?;
                for _ in 0..outbreak.initial_infections {
                    infect_random(context, outbreak)?;
                }
                schedule_tick(context, 1, outbreak)
            })
        })
        .build()
}

pub fn plugins() -> Vec<Plugin> {
    vec![population_plugin(), outbreak_plugin()]
}

fn schedule_tick(context: &mut Context, time: SimTime, outbreak: Outbreak) -> Result<(), KernelError> {
    if time > outbreak.horizon {
        return Ok(());
    }
    context.schedule_at(time, move |context| {
        if outbreak.fail_at == Some(time) {
            return Err(KernelError::model("outbreak model diverged"));
        }
        for _ in 0..outbreak.contacts_per_tick {
            infect_random(context, outbreak)?;
        }
        schedule_tick(context, time + 1, outbreak)
    })?;
    Ok(())
}

fn infect_random(context: &mut Context, outbreak: Outbreak) -> Result<(), KernelError> {
    let sampler = PartitionSampler::new().with_stream("contacts");
    let Some(entity) = context.sample_entity(&SUSCEPTIBLE, &sampler)? else {
        return Ok(());
    };
    context.set_attribute(entity, &HEALTH, "infected")?;
    context.release_output(Infection {
        entity,
        time: context.now(),
    });
    context.schedule_plan(
        Plan::new(context.now() + outbreak.recovery_delay, move |context| {
            context.set_attribute(entity, &HEALTH, "recovered")
        })
        .with_key(format!("recover-{}", entity.raw())),
    )?;
    Ok(())
}

/// Levels setting `contacts_per_tick`.
pub fn contacts(values: &'static [usize]) -> Dimension {
    values.iter().fold(
        Dimension::new("contacts").with_meta_header("contacts_per_tick"),
        |dimension, value| {
            dimension.with_level(move |context| {
                context.data_mut::<Outbreak>()?.contacts_per_tick = *value;
                Ok(vec![value.to_string()])
            })
        },
    )
}

/// Levels setting `fail_at`.
pub fn failure(values: &'static [Option<SimTime>]) -> Dimension {
    values.iter().fold(
        Dimension::new("failure").with_meta_header("fail_at"),
        |dimension, value| {
            dimension.with_level(move |context| {
                context.data_mut::<Outbreak>()?.fail_at = *value;
                Ok(vec![value.map(|time| time.to_string()).unwrap_or_default()])
            })
        },
    )
}

pub type Collected = Arc<Mutex<BTreeMap<usize, Vec<Infection>>>>;

/// Consumer that groups infections by scenario, in arrival order.
pub fn collector() -> (Collected, impl FnMut(ScenarioOutput) + Send + 'static) {
    let collected: Collected = Arc::new(Mutex::new(BTreeMap::new()));
    let sink = Arc::clone(&collected);
    let consumer = move |output: ScenarioOutput| {
        if let Some(infection) = output.output.downcast_ref::<Infection>() {
            sink.lock()
                .unwrap()
                .entry(output.scenario)
                .or_default()
                .push(*infection);
        }
    };
    (collected, consumer)
}

pub fn take(collected: &Collected) -> BTreeMap<usize, Vec<Infection>> {
    std::mem::take(&mut *collected.lock().unwrap())
}
