mod support;

use std::rc::Rc;

use sim_core::{
    assemble_registry, ComponentId, ComponentKind, ComponentRegistry, Context, KernelError,
    Plugin,
};
use support::shared_log;

const CLOCK: ComponentId = ComponentId::from_static("clock");
const LEDGER: ComponentId = ComponentId::from_static("ledger");
const AUDITOR: ComponentId = ComponentId::from_static("auditor");

#[derive(Debug)]
struct Ledger {
    opened_at: u64,
    entries: Vec<String>,
}

#[derive(Debug)]
struct Auditor {
    seen_entries: usize,
}

#[test]
fn constructors_run_after_their_dependencies() {
    let order = shared_log();
    let mut registry = ComponentRegistry::new();

    // Registered in reverse dependency order on purpose.
    let log = Rc::clone(&order);
    registry
        .add_actor(AUDITOR, vec![LEDGER], move |context| {
            log.borrow_mut().push(AUDITOR);
            let ledger = context.get::<Ledger>(&LEDGER)?;
            Ok(Auditor {
                seen_entries: ledger.entries.len(),
            })
        })
        .unwrap();
    let log = Rc::clone(&order);
    registry
        .add_data_manager(LEDGER, vec![CLOCK], move |context| {
            log.borrow_mut().push(LEDGER);
            Ok(Ledger {
                opened_at: *context.get::<u64>(&CLOCK)?,
                entries: vec!["opening balance".to_string()],
            })
        })
        .unwrap();
    let log = Rc::clone(&order);
    registry
        .add_resolver(CLOCK, Vec::new(), move |_| {
            log.borrow_mut().push(CLOCK);
            Ok(7u64)
        })
        .unwrap();

    assert_eq!(
        registry.construction_order().unwrap(),
        vec![CLOCK, LEDGER, AUDITOR]
    );
    let mut context = Context::with_seed(0);
    let built = registry.resolve(&mut context).unwrap();

    assert_eq!(built, vec![CLOCK, LEDGER, AUDITOR]);
    assert_eq!(*order.borrow(), built);
    assert_eq!(context.get::<Ledger>(&LEDGER).unwrap().opened_at, 7);
    assert_eq!(context.get::<Auditor>(&AUDITOR).unwrap().seen_entries, 1);
    assert_eq!(context.component_kind(&LEDGER), Some(ComponentKind::DataManager));
    assert_eq!(context.component_kind(&CLOCK), Some(ComponentKind::Resolver));
}

#[test]
fn independent_components_keep_registration_order() {
    let mut registry = ComponentRegistry::new();
    for id in ["c", "a", "b"] {
        registry
            .add_data_manager(ComponentId::from_static(id), Vec::new(), |_| Ok(()))
            .unwrap();
    }
    let order: Vec<String> = registry
        .construction_order()
        .unwrap()
        .iter()
        .map(|id| id.to_string())
        .collect();
    assert_eq!(order, vec!["c", "a", "b"]);
}

#[test]
fn cycle_is_reported_with_its_members() {
    let mut registry = ComponentRegistry::new();
    registry.add_actor(AUDITOR, vec![LEDGER], |_| Ok(())).unwrap();
    registry.add_actor(LEDGER, vec![CLOCK], |_| Ok(())).unwrap();
    registry.add_actor(CLOCK, vec![LEDGER], |_| Ok(())).unwrap();

    let err = registry.resolve(&mut Context::with_seed(0)).unwrap_err();
    let KernelError::CyclicDependency { scope, cycle } = &err else {
        panic!("expected a cycle, got {err:?}");
    };
    assert_eq!(*scope, "component");
    assert!(cycle.contains(&"ledger".to_string()));
    assert!(cycle.contains(&"clock".to_string()));
    assert!(!cycle.contains(&"auditor".to_string()));
    assert_eq!(cycle.first(), cycle.last());
    assert!(err.to_string().contains("->"));
}

#[test]
fn missing_dependency_names_both_sides() {
    let mut registry = ComponentRegistry::new();
    registry.add_actor(AUDITOR, vec![LEDGER], |_| Ok(())).unwrap();
    let err = registry.construction_order().unwrap_err();
    assert!(matches!(
        err,
        KernelError::MissingDependency { ref dependent, ref dependency, .. }
            if dependent == "auditor" && dependency == "ledger"
    ));
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut registry = ComponentRegistry::new();
    registry.add_actor(CLOCK, Vec::new(), |_| Ok(())).unwrap();
    let err = registry
        .add_data_manager(CLOCK, Vec::new(), |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, KernelError::DuplicateComponent { scope: "component", .. }));
    assert_eq!(registry.len(), 1);
}

#[test]
fn lookups_report_unknown_ids_and_wrong_types() {
    let mut registry = ComponentRegistry::new();
    registry.add_resolver(CLOCK, Vec::new(), |_| Ok(7u64)).unwrap();
    let mut context = Context::with_seed(0);
    registry.resolve(&mut context).unwrap();

    assert!(matches!(
        context.get::<u64>(&LEDGER),
        Err(KernelError::UnknownComponent(_))
    ));
    assert!(matches!(
        context.get::<String>(&CLOCK),
        Err(KernelError::ComponentTypeMismatch { .. })
    ));
    assert_eq!(context.find::<u64>(), Some(&7));
}

#[test]
fn failing_constructor_aborts_resolution() {
    let mut registry = ComponentRegistry::new();
    registry
        .add_resolver(CLOCK, Vec::new(), |_| -> Result<(), KernelError> {
            Err(KernelError::model("clock unavailable"))
        })
        .unwrap();
    registry.add_actor(LEDGER, vec![CLOCK], |_| Ok(())).unwrap();

    let mut context = Context::with_seed(0);
    let err = registry.resolve(&mut context).unwrap_err();
    assert!(matches!(err, KernelError::Model(_)));
    assert!(!context.contains_component(&LEDGER));
}

#[derive(Debug, Clone, PartialEq)]
struct LedgerSettings {
    opening_entries: usize,
}

fn ledger_plugin() -> Plugin {
    Plugin::builder("ledger")
        .depends_on("clock")
        .with_data(LedgerSettings { opening_entries: 2 })
        .with_initializer(|plugin| {
            let settings = plugin.data::<LedgerSettings>()?.clone();
            plugin.add_data_manager(LEDGER, vec![CLOCK], move |context| {
                Ok(Ledger {
                    opened_at: *context.get::<u64>(&CLOCK)?,
                    entries: vec![String::from("entry"); settings.opening_entries],
                })
            })
        })
        .build()
}

fn clock_plugin() -> Plugin {
    Plugin::builder("clock")
        .with_initializer(|plugin| plugin.add_resolver(CLOCK, Vec::new(), |_| Ok(3u64)))
        .build()
}

#[test]
fn plugins_contribute_components_in_dependency_order() {
    let mut ledger = ledger_plugin();
    ledger.data_mut::<LedgerSettings>().unwrap().opening_entries = 4;

    let registry = assemble_registry(&[ledger, clock_plugin()]).unwrap();
    let mut context = Context::with_seed(0);
    registry.resolve(&mut context).unwrap();

    let built = context.get::<Ledger>(&LEDGER).unwrap();
    assert_eq!(built.opened_at, 3);
    assert_eq!(built.entries.len(), 4);
}

#[test]
fn plugin_without_expected_data_fails_assembly() {
    let bare = Plugin::builder("ledger")
        .with_initializer(|plugin| plugin.data::<LedgerSettings>().map(|_| ()))
        .build();
    assert!(matches!(
        assemble_registry(&[bare]),
        Err(KernelError::MissingPluginData { .. })
    ));
}

#[test]
fn plugin_dependency_on_unknown_plugin_is_rejected() {
    let err = assemble_registry(&[ledger_plugin()]).unwrap_err();
    assert!(matches!(
        err,
        KernelError::MissingDependency { scope: "plugin", .. }
    ));
}
