mod support;

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use proptest::prelude::*;
use sim_core::test_helpers::{
    add_person, populate, test_context, AGE, HEALTH, HEALTH_STATES, REGION, REGIONS, VACCINATED,
};
use sim_core::{
    Comparison, ContextEntitiesExt, ContextPartitionExt, EntityId, Filter, FilterSensitivity,
    KernelError, Label, Labeler, PartitionEngine, PartitionId, PartitionSampler, Value,
    PARTITION_ENGINE,
};

const BY_REGION: PartitionId = PartitionId::from_static("by_region");

fn adults() -> Filter {
    Filter::attribute(AGE, Comparison::GreaterOrEqual, 18)
}

fn hash_of(filter: &Filter) -> u64 {
    let mut hasher = DefaultHasher::new();
    filter.hash(&mut hasher);
    hasher.finish()
}

#[test]
fn seeded_partition_matches_population_scan() {
    let mut context = test_context(3);
    populate(&mut context, 50).unwrap();
    context
        .define_partition(BY_REGION, adults(), Labeler::by_attribute(REGION))
        .unwrap();

    let matching = context.entities_matching(&adults()).unwrap();
    assert_eq!(context.partition_count(&BY_REGION, None).unwrap(), matching.len());
    for region in REGIONS {
        let label = Label::single(region);
        let expected: Vec<EntityId> = matching
            .iter()
            .copied()
            .filter(|entity| context.attribute_value(*entity, &REGION).unwrap() == Value::from(region))
            .collect();
        assert_eq!(context.entities_in_label(&BY_REGION, &label).unwrap(), expected);
    }
}

#[test]
fn attribute_changes_move_entities_between_labels() {
    let mut context = test_context(0);
    context
        .define_partition(BY_REGION, adults(), Labeler::by_attribute(REGION))
        .unwrap();
    let person = add_person(&mut context, "north", 30, false).unwrap();
    let child = add_person(&mut context, "north", 10, false).unwrap();

    assert_eq!(
        context.partition_label_of(&BY_REGION, person).unwrap(),
        Some(Label::single("north"))
    );
    assert!(!context.partition_contains(&BY_REGION, child).unwrap());

    context.set_attribute(person, &REGION, "south").unwrap();
    context.set_attribute(child, &AGE, 18).unwrap();
    assert_eq!(
        context.partition_labels(&BY_REGION).unwrap(),
        vec![Label::single("north"), Label::single("south")]
    );
    assert_eq!(
        context.entities_in_label(&BY_REGION, &Label::single("north")).unwrap(),
        vec![child]
    );

    context.set_attribute(person, &AGE, 12).unwrap();
    assert_eq!(
        context.partition_labels(&BY_REGION).unwrap(),
        vec![Label::single("north")]
    );

    context.remove_entity(child).unwrap();
    assert_eq!(context.partition_count(&BY_REGION, None).unwrap(), 0);
    assert!(context.partition_labels(&BY_REGION).unwrap().is_empty());
}

#[test]
fn equal_filters_with_same_labeler_share_one_index() {
    let mut context = test_context(0);
    populate(&mut context, 10).unwrap();
    let vaccinated_adults = Filter::equals(VACCINATED, true).and(adults());
    let adults_vaccinated = adults().and(Filter::equals(VACCINATED, true));
    assert_eq!(vaccinated_adults, adults_vaccinated);

    context
        .define_partition("first", vaccinated_adults, Labeler::by_attribute(REGION))
        .unwrap();
    context
        .define_partition("second", adults_vaccinated.clone(), Labeler::by_attribute(REGION))
        .unwrap();
    context
        .define_partition("unlabeled", adults_vaccinated, Labeler::unlabeled())
        .unwrap();

    let engine = context.get::<PartitionEngine>(&PARTITION_ENGINE).unwrap();
    assert_eq!(engine.index_count(), 2);
    assert_eq!(engine.partition_ids().len(), 3);

    // Removing one alias keeps the shared index alive for the other.
    context.remove_partition(&PartitionId::from("first")).unwrap();
    let person = add_person(&mut context, "east", 40, true).unwrap();
    assert!(context
        .partition_contains(&PartitionId::from("second"), person)
        .unwrap());
    assert!(matches!(
        context.partition_count(&PartitionId::from("first"), None),
        Err(KernelError::UnknownPartition(_))
    ));
}

#[test]
fn removed_partition_stops_listening() {
    let mut context = test_context(0);
    context
        .define_partition(BY_REGION, adults(), Labeler::by_attribute(REGION))
        .unwrap();
    let subscriptions = context.event_bus().subscription_count();
    context.remove_partition(&BY_REGION).unwrap();
    assert!(context.event_bus().subscription_count() < subscriptions);
    assert!(matches!(
        context.remove_partition(&BY_REGION),
        Err(KernelError::UnknownPartition(_))
    ));

    // The id can be reused.
    context
        .define_partition(BY_REGION, Filter::True, Labeler::unlabeled())
        .unwrap();
}

#[test]
fn duplicate_partition_name_is_rejected() {
    let mut context = test_context(0);
    context
        .define_partition(BY_REGION, Filter::True, Labeler::unlabeled())
        .unwrap();
    assert!(matches!(
        context.define_partition(BY_REGION, adults(), Labeler::unlabeled()),
        Err(KernelError::DuplicatePartition(_))
    ));
}

#[test]
fn unknown_attribute_in_filter_fails_at_definition() {
    let mut context = test_context(0);
    let filter = Filter::equals("shoe_size", 42);
    assert!(matches!(
        context.define_partition(BY_REGION, filter, Labeler::unlabeled()),
        Err(KernelError::UnknownAttributeId(_))
    ));
}

#[test]
fn unknown_labeler_attribute_fails_before_any_entity_exists() {
    let mut context = test_context(0);
    assert!(matches!(
        context.define_partition(BY_REGION, Filter::True, Labeler::by_attribute("shoe_size")),
        Err(KernelError::UnknownAttributeId(_))
    ));
    assert!(context
        .get::<PartitionEngine>(&PARTITION_ENGINE)
        .unwrap()
        .partition_ids()
        .is_empty());

    add_person(&mut context, "north", 30, false).unwrap();
    assert_eq!(context.population().unwrap(), 1);
}

#[test]
fn earlier_subscribers_see_refreshed_partitions() {
    let mut context = test_context(0);
    let person = add_person(&mut context, "north", 30, false).unwrap();
    let seen = support::shared_log();

    let recorded = std::rc::Rc::clone(&seen);
    context.subscribe(None, move |context, event: &sim_core::AttributeChangedEvent| {
        let north = context.entities_in_label(&BY_REGION, &Label::single("north"))?;
        let south = context.entities_in_label(&BY_REGION, &Label::single("south"))?;
        recorded.borrow_mut().push((event.entity, north, south));
        Ok(())
    });
    context
        .define_partition(BY_REGION, Filter::True, Labeler::by_attribute(REGION))
        .unwrap();

    context.set_attribute(person, &REGION, "south").unwrap();
    assert_eq!(
        *seen.borrow(),
        vec![(person, Vec::<EntityId>::new(), vec![person])]
    );
}

#[test]
fn custom_filter_follows_declared_sensitivities() {
    let mut context = test_context(0);
    let senior_or_vaccinated = Filter::custom(
        "senior_or_vaccinated",
        vec![
            FilterSensitivity::for_attribute(&AGE),
            FilterSensitivity::for_attribute(&VACCINATED),
        ],
        |context, entity| {
            let age = context.attribute_value(entity, &AGE)?;
            let vaccinated = context.attribute_value(entity, &VACCINATED)?;
            Ok(age.as_int().unwrap_or(0) >= 65 || vaccinated.as_bool().unwrap_or(false))
        },
    );
    context
        .define_partition("protected", senior_or_vaccinated, Labeler::unlabeled())
        .unwrap();
    let id = PartitionId::from("protected");
    let person = add_person(&mut context, "north", 40, false).unwrap();
    assert!(!context.partition_contains(&id, person).unwrap());

    context.set_attribute(person, &VACCINATED, true).unwrap();
    assert!(context.partition_contains(&id, person).unwrap());
    context.set_attribute(person, &VACCINATED, false).unwrap();
    context.set_attribute(person, &AGE, 70).unwrap();
    assert!(context.partition_contains(&id, person).unwrap());
}

#[test]
fn sampling_respects_label_and_exclusion() {
    let mut context = test_context(11);
    context
        .define_partition(BY_REGION, Filter::True, Labeler::by_attribute(REGION))
        .unwrap();
    let a = add_person(&mut context, "north", 20, false).unwrap();
    let b = add_person(&mut context, "north", 21, false).unwrap();
    add_person(&mut context, "south", 22, false).unwrap();

    let only_b = PartitionSampler::new()
        .with_label(Label::single("north"))
        .excluding(a);
    for _ in 0..20 {
        assert_eq!(context.sample_entity(&BY_REGION, &only_b).unwrap(), Some(b));
    }

    let lone = PartitionSampler::new()
        .with_label(Label::single("north"))
        .excluding(a);
    context.remove_entity(b).unwrap();
    assert_eq!(context.sample_entity(&BY_REGION, &lone).unwrap(), None);

    let missing = PartitionSampler::new().with_label(Label::single("west"));
    assert_eq!(context.sample_entity(&BY_REGION, &missing).unwrap(), None);
}

#[test]
fn label_weights_steer_sampling() {
    let mut context = test_context(5);
    context
        .define_partition(BY_REGION, Filter::True, Labeler::by_attribute(REGION))
        .unwrap();
    populate(&mut context, 60).unwrap();

    let south_only = PartitionSampler::new().with_label_weights(|label| {
        if label == &Label::single("south") {
            1.0
        } else {
            0.0
        }
    });
    for _ in 0..30 {
        let entity = context
            .sample_entity(&BY_REGION, &south_only)
            .unwrap()
            .expect("south has members");
        assert_eq!(
            context.attribute_value(entity, &REGION).unwrap(),
            Value::from("south")
        );
    }

    let negative = PartitionSampler::new().with_label_weights(|_| -1.0);
    assert!(matches!(
        context.sample_entity(&BY_REGION, &negative),
        Err(KernelError::InvalidSamplingWeight { .. })
    ));
}

#[test]
fn sampling_is_reproducible_per_seed() {
    let draws = |seed| {
        let mut context = test_context(seed);
        populate(&mut context, 40).unwrap();
        context
            .define_partition(BY_REGION, adults(), Labeler::by_attribute(REGION))
            .unwrap();
        let sampler = PartitionSampler::new().with_stream("contacts");
        (0..10)
            .map(|_| context.sample_entity(&BY_REGION, &sampler).unwrap())
            .collect::<Vec<_>>()
    };
    assert_eq!(draws(21), draws(21));
}

#[test]
fn uniform_sampling_covers_every_label() {
    let mut context = test_context(8);
    context
        .define_partition(BY_REGION, Filter::True, Labeler::by_attribute(REGION))
        .unwrap();
    for region in REGIONS {
        for age in 0..5 {
            add_person(&mut context, region, age, false).unwrap();
        }
    }
    let mut seen: HashMap<Value, usize> = HashMap::new();
    for _ in 0..300 {
        let entity = context
            .sample_entity(&BY_REGION, &PartitionSampler::new())
            .unwrap()
            .unwrap();
        *seen
            .entry(context.attribute_value(entity, &REGION).unwrap())
            .or_default() += 1;
    }
    assert_eq!(seen.len(), REGIONS.len());
}

#[test]
fn double_negation_keeps_membership() {
    let mut context = test_context(2);
    populate(&mut context, 30).unwrap();
    let plain = adults();
    let doubled = !!adults();
    assert_eq!(
        context.entities_matching(&plain).unwrap(),
        context.entities_matching(&doubled).unwrap()
    );
    assert_eq!(!Filter::True, Filter::False);
}

#[derive(Debug, Clone)]
enum Change {
    Health(usize, usize),
    Region(usize, usize),
    Age(usize, i64),
    Add(usize, i64),
    Remove(usize),
}

fn change() -> impl Strategy<Value = Change> {
    prop_oneof![
        (0usize..64, 0..HEALTH_STATES.len()).prop_map(|(e, h)| Change::Health(e, h)),
        (0usize..64, 0..REGIONS.len()).prop_map(|(e, r)| Change::Region(e, r)),
        (0usize..64, 0i64..90).prop_map(|(e, a)| Change::Age(e, a)),
        (0..REGIONS.len(), 0i64..90).prop_map(|(r, a)| Change::Add(r, a)),
        (0usize..64).prop_map(Change::Remove),
    ]
}

fn attribute_filter() -> impl Strategy<Value = Filter> {
    let leaf = prop_oneof![
        (0..HEALTH_STATES.len()).prop_map(|h| Filter::equals(HEALTH, HEALTH_STATES[h])),
        (0..REGIONS.len()).prop_map(|r| Filter::equals(REGION, REGIONS[r])),
        (0i64..90).prop_map(|a| Filter::attribute(AGE, Comparison::Less, a)),
        any::<bool>().prop_map(|v| Filter::equals(VACCINATED, v)),
    ];
    leaf.prop_recursive(3, 12, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::all),
            prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::any),
            inner.prop_map(Filter::negate),
        ]
    })
}

fn live_entities(context: &sim_core::Context) -> Vec<EntityId> {
    context.entity_store().unwrap().entities().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn incremental_index_matches_rescan(
        filter in attribute_filter(),
        changes in prop::collection::vec(change(), 0..40),
    ) {
        let mut context = test_context(17);
        populate(&mut context, 12).unwrap();
        context
            .define_partition(BY_REGION, filter.clone(), Labeler::by_attribute(REGION))
            .unwrap();

        for change in changes {
            let live = live_entities(&context);
            let pick = |index: usize| (!live.is_empty()).then(|| live[index % live.len()]);
            match change {
                Change::Health(e, h) => if let Some(entity) = pick(e) {
                    context.set_attribute(entity, &HEALTH, HEALTH_STATES[h]).unwrap();
                },
                Change::Region(e, r) => if let Some(entity) = pick(e) {
                    context.set_attribute(entity, &REGION, REGIONS[r]).unwrap();
                },
                Change::Age(e, a) => if let Some(entity) = pick(e) {
                    context.set_attribute(entity, &AGE, a).unwrap();
                },
                Change::Add(r, a) => {
                    add_person(&mut context, REGIONS[r], a, a % 2 == 0).unwrap();
                }
                Change::Remove(e) => if let Some(entity) = pick(e) {
                    context.remove_entity(entity).unwrap();
                },
            }
        }

        let mut expected: BTreeMap<Label, Vec<EntityId>> = BTreeMap::new();
        for entity in context.entities_matching(&filter).unwrap() {
            let region = context.attribute_value(entity, &REGION).unwrap();
            expected.entry(Label::new(vec![region])).or_default().push(entity);
        }
        prop_assert_eq!(
            context.partition_labels(&BY_REGION).unwrap(),
            expected.keys().cloned().collect::<Vec<_>>()
        );
        for (label, members) in &expected {
            prop_assert_eq!(&context.entities_in_label(&BY_REGION, label).unwrap(), members);
        }
    }

    #[test]
    fn conjunction_and_disjunction_are_commutative(a in attribute_filter(), b in attribute_filter()) {
        let left = a.clone().and(b.clone());
        let right = b.clone().and(a.clone());
        prop_assert_eq!(&left, &right);
        prop_assert_eq!(hash_of(&left), hash_of(&right));

        let left = a.clone().or(b.clone());
        let right = b.or(a);
        prop_assert_eq!(&left, &right);
        prop_assert_eq!(hash_of(&left), hash_of(&right));
    }

    #[test]
    fn double_negation_evaluates_identically(filter in attribute_filter()) {
        let mut context = test_context(4);
        populate(&mut context, 20).unwrap();
        let doubled = Filter::negate(Filter::negate(filter.clone()));
        for entity in live_entities(&context) {
            prop_assert_eq!(
                context.entity_satisfies(&filter, entity).unwrap(),
                context.entity_satisfies(&doubled, entity).unwrap()
            );
        }
    }
}
