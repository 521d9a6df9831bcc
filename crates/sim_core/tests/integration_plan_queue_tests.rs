mod support;

use std::rc::Rc;

use proptest::prelude::*;
use sim_core::{ComponentId, ComponentRegistry, Context, KernelError, Plan, PlanKey, PlanQueue};
use support::shared_log;

#[test]
fn equal_times_run_in_arrival_order() {
    let mut context = Context::with_seed(0);
    let log = shared_log();
    for (owner, time) in [("a", 3), ("b", 1), ("c", 1), ("d", 2)] {
        let log = Rc::clone(&log);
        context
            .schedule_at(time, move |_| {
                log.borrow_mut().push(owner);
                Ok(())
            })
            .unwrap();
    }
    while context.advance().unwrap() {}
    assert_eq!(*log.borrow(), vec!["b", "c", "d", "a"]);
}

#[test]
fn plans_scheduled_from_callbacks_at_now_run_after_current_time_peers() {
    let mut context = Context::with_seed(0);
    let log = shared_log();
    let inner = Rc::clone(&log);
    context
        .schedule_at(5, move |context| {
            inner.borrow_mut().push("first");
            let nested = Rc::clone(&inner);
            context.schedule_in(0, move |_| {
                nested.borrow_mut().push("nested");
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
    let peer = Rc::clone(&log);
    context
        .schedule_at(5, move |_| {
            peer.borrow_mut().push("peer");
            Ok(())
        })
        .unwrap();

    while context.advance().unwrap() {}
    assert_eq!(*log.borrow(), vec!["first", "peer", "nested"]);
}

#[test]
fn scheduling_in_the_past_is_a_contract_error() {
    let mut context = Context::with_seed(0);
    context
        .schedule_at(10, |context| match context.schedule_at(4, |_| Ok(())) {
            Err(KernelError::PastSchedule { requested: 4, now: 10 }) => Ok(()),
            other => Err(KernelError::model(format!("unexpected: {other:?}"))),
        })
        .unwrap();
    assert!(context.advance().unwrap());
}

#[test]
fn canceled_plan_never_runs_and_late_cancel_is_noop() {
    let mut context = Context::with_seed(0);
    let owner = ComponentId::from_static("owner");
    let log = shared_log();

    let mut registry = ComponentRegistry::new();
    let recorded = Rc::clone(&log);
    registry
        .add_actor(owner.clone(), Vec::new(), move |context| {
            for (key, time) in [("keep", 1), ("drop", 2)] {
                let log = Rc::clone(&recorded);
                context.schedule_plan(
                    Plan::new(time, move |_| {
                        log.borrow_mut().push(key);
                        Ok(())
                    })
                    .with_key(key),
                )?;
            }
            Ok(())
        })
        .unwrap();
    registry.resolve(&mut context).unwrap();

    assert!(context.advance().unwrap());
    assert!(!context.cancel_plan_for(&owner, "keep"));
    assert!(!context.cancel_plan("drop"), "top level has no owner");
    assert!(context.cancel_plan_for(&owner, "drop"));
    assert!(!context.advance().unwrap());
    assert_eq!(*log.borrow(), vec!["keep"]);
}

#[test]
fn duplicate_key_for_same_owner_is_rejected_until_executed() {
    let mut queue = PlanQueue::default();
    queue.schedule(None, Plan::new(1, |_| Ok(())).with_key("tick")).unwrap();
    let err = queue
        .schedule(None, Plan::new(2, |_| Ok(())).with_key("tick"))
        .unwrap_err();
    assert!(matches!(err, KernelError::DuplicatePlanKey { .. }));
    let other = ComponentId::from_static("other");
    queue
        .schedule(Some(other), Plan::new(2, |_| Ok(())).with_key("tick"))
        .unwrap();
}

#[test]
fn advance_on_empty_queue_reports_nothing_ran() {
    let mut context = Context::with_seed(0);
    assert!(!context.advance().unwrap());
    assert_eq!(context.now(), 0);
}

#[test]
fn passive_plans_do_not_keep_queue_active() {
    let mut queue = PlanQueue::default();
    queue.schedule(None, Plan::new(4, |_| Ok(())).passive()).unwrap();
    assert!(!queue.has_active_plans());
    assert_eq!(queue.len(), 1);
    assert!(!queue.cancel(None, &PlanKey::from("missing")));
}

proptest! {
    #[test]
    fn execution_order_is_time_then_arrival(times in prop::collection::vec(0u64..20, 1..60)) {
        let mut context = Context::with_seed(0);
        let log = shared_log();
        for (arrival, time) in times.iter().copied().enumerate() {
            let log = Rc::clone(&log);
            context.schedule_at(time, move |context| {
                log.borrow_mut().push((context.now(), arrival));
                Ok(())
            }).unwrap();
        }
        while context.advance().unwrap() {}

        let executed = log.borrow();
        prop_assert_eq!(executed.len(), times.len());
        for pair in executed.windows(2) {
            prop_assert!(pair[0] < pair[1], "{:?} ran before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn canceled_plans_leave_the_queue(
        times in prop::collection::vec(0u64..10, 1..40),
        cancel_mask in prop::collection::vec(any::<bool>(), 40),
    ) {
        let mut queue = PlanQueue::default();
        let owner = ComponentId::from_static("owner");
        for (index, time) in times.iter().copied().enumerate() {
            queue.schedule(
                Some(owner.clone()),
                Plan::new(time, |_| Ok(())).with_key(format!("plan-{index}")),
            ).unwrap();
        }
        let mut expected = 0;
        for index in 0..times.len() {
            if cancel_mask[index] {
                let key = PlanKey::new(format!("plan-{index}"));
                prop_assert!(queue.cancel(Some(&owner), &key));
            } else {
                expected += 1;
            }
        }
        prop_assert_eq!(queue.len(), expected);
        let snapshot = queue.snapshot();
        prop_assert!(snapshot
            .pending
            .iter()
            .all(|plan| !cancel_mask[plan.arrival as usize]));
    }
}
