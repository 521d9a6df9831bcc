//! Run a small susceptible/infected/recovered model and print the epidemic curve.
//!
//! Run with: cargo run -p sim_core --example scenario_run
//! Set `RUST_LOG=sim_core=debug` to see component construction and partitions.

use rand::Rng;
use sim_core::test_helpers::{populate, test_registry, HEALTH, REGION};
use sim_core::{
    ComponentId, Context, ContextEntitiesExt, ContextPartitionExt, EntityId, Filter, KernelError,
    Label, Labeler, PartitionId, PartitionSampler, Plan, Scenario, ScenarioParams, SimTime,
    ENTITY_STORE, PARTITION_ENGINE,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const POPULATION: usize = 2_000;
const INITIAL_CASES: usize = 5;
const CONTACTS_PER_CASE: usize = 2;
const INFECTION_CHANCE: f64 = 0.3;
const RECOVERY_DAYS: SimTime = 7;
const DAYS: SimTime = 120;

const SIR: ComponentId = ComponentId::from_static("sir_model");
const SUSCEPTIBLE: PartitionId = PartitionId::from_static("susceptible");
const INFECTED: PartitionId = PartitionId::from_static("infected_by_region");

#[derive(Debug, Clone, Copy)]
struct DailyCount {
    day: SimTime,
    susceptible: usize,
    infected: usize,
}

fn infect(context: &mut Context, entity: EntityId) -> Result<(), KernelError> {
    context.set_attribute(entity, &HEALTH, "infected")?;
    let recover_at = context.now() + RECOVERY_DAYS;
    context.schedule_plan(Plan::new(recover_at, move |context| {
        context.set_attribute(entity, &HEALTH, "recovered")
    }))?;
    Ok(())
}

fn daily_contacts(context: &mut Context, day: SimTime) -> Result<(), KernelError> {
    let infected = context.partition_count(&INFECTED, None)?;
    let susceptible_sampler = PartitionSampler::new().with_stream("contacts");
    for _ in 0..infected * CONTACTS_PER_CASE {
        let Some(contact) = context.sample_entity(&SUSCEPTIBLE, &susceptible_sampler)? else {
            break;
        };
        if context.rng_stream("transmission").gen_bool(INFECTION_CHANCE) {
            infect(context, contact)?;
        }
    }

    let count = DailyCount {
        day,
        susceptible: context.partition_count(&SUSCEPTIBLE, None)?,
        infected: context.partition_count(&INFECTED, None)?,
    };
    context.release_output(count);
    if infected > 0 && day < DAYS {
        context.schedule_at(day + 1, move |context| daily_contacts(context, day + 1))?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sim_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut registry = test_registry().expect("base components");
    registry
        .add_actor(SIR, vec![ENTITY_STORE, PARTITION_ENGINE], |context| {
            populate(context, POPULATION)?;
            context.define_partition(
                SUSCEPTIBLE,
                Filter::equals(HEALTH, "susceptible"),
                Labeler::unlabeled(),
            )?;
            context.define_partition(
                INFECTED,
                Filter::equals(HEALTH, "infected"),
                Labeler::by_attribute(REGION),
            )?;
            let seeds = PartitionSampler::new().with_stream("seeding");
            for _ in 0..INITIAL_CASES {
                if let Some(entity) = context.sample_entity(&SUSCEPTIBLE, &seeds)? {
                    infect(context, entity)?;
                }
            }
            context.schedule_at(1, |context| daily_contacts(context, 1))?;
            Ok(())
        })
        .expect("sir model registers once");

    let params = ScenarioParams::default().with_seed(123);
    let (report, mut context) = Scenario::new(params, registry).run_with_context();

    println!(
        "--- SIR run ({} people, {} initial cases, seed 123) ---",
        POPULATION, INITIAL_CASES
    );
    println!("Status: {}", report.status.label());
    println!("Plans executed: {}", report.plans_executed);
    println!("Final day: {}", report.final_time);

    let curve: Vec<DailyCount> = context
        .take_outputs()
        .iter()
        .filter_map(|output| output.downcast_ref::<DailyCount>().copied())
        .collect();
    if let Some(peak) = curve.iter().max_by_key(|count| count.infected) {
        println!("Peak: {} infected on day {}", peak.infected, peak.day);
    }
    for count in curve.iter().step_by(7) {
        println!(
            "  day {:>3}  susceptible={:>5}  infected={:>5}",
            count.day, count.susceptible, count.infected
        );
    }

    if let Ok(labels) = context.partition_labels(&INFECTED) {
        for label in labels {
            let members = context.partition_count(&INFECTED, Some(&label)).unwrap_or(0);
            println!("Still infected in {}: {}", region_name(&label), members);
        }
    }
}

fn region_name(label: &Label) -> String {
    label
        .values()
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}
