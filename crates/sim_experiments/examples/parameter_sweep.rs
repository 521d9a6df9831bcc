//! Example: sweep transmission chance and contact rate of an SIR model.
//!
//! This example demonstrates how to:
//! 1. Describe a model as plugins with configurable data
//! 2. Vary that data through dimensions
//! 3. Run the cross product on a worker pool
//! 4. Consume outputs as they are released
//! 5. Export the results to CSV and JSON
//!
//! Run with: cargo run -p sim_experiments --example parameter_sweep

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use sim_core::entities::register_entity_store;
use sim_core::partition::register_partition_engine;
use sim_core::test_helpers::{populate, test_entity_config, HEALTH};
use sim_core::{
    ComponentId, Context, ContextEntitiesExt, ContextPartitionExt, EntityId, Filter, KernelError,
    Labeler, PartitionId, PartitionSampler, Plan, Plugin, SimTime, ENTITY_STORE, PARTITION_ENGINE,
};
use sim_experiments::{export_to_csv, export_to_json, Dimension, Experiment, ExperimentParams};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SIR: ComponentId = ComponentId::from_static("sir_model");
const SUSCEPTIBLE: PartitionId = PartitionId::from_static("susceptible");
const INFECTED: PartitionId = PartitionId::from_static("infected");

#[derive(Debug, Clone, Copy)]
struct Disease {
    population: usize,
    initial_cases: usize,
    contacts_per_case: usize,
    infection_chance: f64,
    recovery_days: SimTime,
    days: SimTime,
}

impl Default for Disease {
    fn default() -> Self {
        Self {
            population: 1_000,
            initial_cases: 5,
            contacts_per_case: 2,
            infection_chance: 0.2,
            recovery_days: 7,
            days: 90,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Prevalence {
    day: SimTime,
    infected: usize,
}

fn infect(context: &mut Context, entity: EntityId, disease: Disease) -> Result<(), KernelError> {
    context.set_attribute(entity, &HEALTH, "infected")?;
    let recover_at = context.now() + disease.recovery_days;
    context.schedule_plan(Plan::new(recover_at, move |context| {
        context.set_attribute(entity, &HEALTH, "recovered")
    }))?;
    Ok(())
}

fn day(context: &mut Context, today: SimTime, disease: Disease) -> Result<(), KernelError> {
    let infected = context.partition_count(&INFECTED, None)?;
    let sampler = PartitionSampler::new().with_stream("contacts");
    for _ in 0..infected * disease.contacts_per_case {
        let Some(contact) = context.sample_entity(&SUSCEPTIBLE, &sampler)? else {
            break;
        };
        if context
            .rng_stream("transmission")
            .gen_bool(disease.infection_chance)
        {
            infect(context, contact, disease)?;
        }
    }

    let infected = context.partition_count(&INFECTED, None)?;
    context.release_output(Prevalence {
        day: today,
        infected,
    });
    if infected > 0 && today < disease.days {
        context.schedule_at(today + 1, move |context| day(context, today + 1, disease))?;
    }
    Ok(())
}

fn population_plugin() -> Plugin {
    Plugin::builder("population")
        .with_data(test_entity_config())
        .with_initializer(|plugin| {
            let config = plugin.data::<sim_core::EntityStoreConfig>()?.clone();
            register_entity_store(plugin.registry(), config)?;
            register_partition_engine(plugin.registry())
        })
        .build()
}

fn disease_plugin() -> Plugin {
    Plugin::builder("disease")
        .depends_on("population")
        .with_data(Disease::default())
        .with_initializer(|plugin| {
            let disease = *plugin.data::<Disease>()?;
            plugin.add_actor(SIR, vec![ENTITY_STORE, PARTITION_ENGINE], move |context| {
                populate(context, disease.population)?;
                context.define_partition(
                    SUSCEPTIBLE,
                    Filter::equals(HEALTH, "susceptible"),
                    Labeler::unlabeled(),
                )?;
                context.define_partition(
                    INFECTED,
                    Filter::equals(HEALTH, "infected"),
                    Labeler::unlabeled(),
                )?;
                let seeding = PartitionSampler::new().with_stream("seeding");
                for _ in 0..disease.initial_cases {
                    if let Some(entity) = context.sample_entity(&SUSCEPTIBLE, &seeding)? {
                        infect(context, entity, disease)?;
                    }
                }
                context.schedule_at(1, move |context| day(context, 1, disease))?;
                Ok(())
            })
        })
        .build()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sim_experiments=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let transmission = [0.1, 0.2, 0.3].into_iter().fold(
        Dimension::new("transmission").with_meta_header("infection_chance"),
        |dimension, chance| {
            dimension.with_level(move |context| {
                context.data_mut::<Disease>()?.infection_chance = chance;
                Ok(vec![chance.to_string()])
            })
        },
    );
    let contacts = [1, 2, 4].into_iter().fold(
        Dimension::new("contacts").with_meta_header("contacts_per_case"),
        |dimension, contacts| {
            dimension.with_level(move |context| {
                context.data_mut::<Disease>()?.contacts_per_case = contacts;
                Ok(vec![contacts.to_string()])
            })
        },
    );

    let peaks: Arc<Mutex<BTreeMap<usize, Prevalence>>> = Arc::default();
    let sink = Arc::clone(&peaks);

    println!("Running parameter sweep...");
    let report = Experiment::new()
        .add_plugin(population_plugin())
        .add_plugin(disease_plugin())
        .add_dimension(transmission)
        .add_dimension(contacts)
        .with_params(
            ExperimentParams::default()
                .with_master_seed(2024)
                .with_thread_count(4)
                .with_progress_bar(),
        )
        .with_output_consumer(move |output| {
            let Some(prevalence) = output.output.downcast_ref::<Prevalence>() else {
                return;
            };
            if let Ok(mut peaks) = sink.lock() {
                let peak = peaks.entry(output.scenario).or_insert(*prevalence);
                if prevalence.infected > peak.infected {
                    *peak = *prevalence;
                }
            }
        })
        .execute()?;
    println!("Completed {} scenarios", report.records.len());

    println!("\n=== Peak prevalence ===");
    let peaks = peaks.lock().map_err(|_| "peak table poisoned")?;
    for record in &report.records {
        let Some(peak) = peaks.get(&record.index) else {
            continue;
        };
        println!(
            "{:>2} {:<28} peak {:>4} infected on day {:>3} ({})",
            record.index,
            report
                .meta_headers
                .iter()
                .zip(&record.meta)
                .map(|(header, value)| format!("{header}={value}"))
                .collect::<Vec<_>>()
                .join(" "),
            peak.infected,
            peak.day,
            record.report.status.label()
        );
    }

    export_to_csv(&report, "sweep_results.csv")?;
    export_to_json(&report, "sweep_results.json")?;
    println!("\nResults exported to sweep_results.csv and sweep_results.json");
    Ok(())
}
