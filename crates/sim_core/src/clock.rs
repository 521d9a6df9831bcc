//! Plan queue: the time-ordered store of scheduled callbacks.
//!
//! Plans execute in non-decreasing time order; plans scheduled for the same time
//! run in arrival order. Replays of a scenario depend on this tie-break, so it is
//! part of the queue's contract rather than a property of the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::continuity::{PendingPlan, SimulationSnapshot, TraceEntry};
use crate::error::KernelError;
use crate::registry::ComponentId;

/// Simulation time in integral ticks.
pub type SimTime = u64;

/// Callback executed when a plan comes due.
pub type PlanCallback = Box<dyn FnOnce(&mut Context) -> Result<(), KernelError>>;

/// Key identifying a cancelable plan, unique per owner while the plan is pending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanKey(String);

impl PlanKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlanKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PlanKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work to run at `time`.
///
/// Plans are active by default: the simulation keeps running while active plans
/// remain. Passive plans run only if the simulation is still going when they
/// come due.
pub struct Plan {
    time: SimTime,
    key: Option<PlanKey>,
    active: bool,
    callback: PlanCallback,
}

impl Plan {
    pub fn new<F>(time: SimTime, callback: F) -> Self
    where
        F: FnOnce(&mut Context) -> Result<(), KernelError> + 'static,
    {
        Self {
            time,
            key: None,
            active: true,
            callback: Box::new(callback),
        }
    }

    /// Makes the plan cancelable under `key`.
    pub fn with_key(mut self, key: impl Into<PlanKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn passive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    pub fn key(&self) -> Option<&PlanKey> {
        self.key.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("time", &self.time)
            .field("key", &self.key)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Opaque handle returned by [`PlanQueue::schedule`]; the plan's arrival sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanId(u64);

impl PlanId {
    pub fn arrival(self) -> u64 {
        self.0
    }
}

pub(crate) struct QueuedPlan {
    pub(crate) time: SimTime,
    pub(crate) arrival: u64,
    pub(crate) owner: Option<ComponentId>,
    pub(crate) key: Option<PlanKey>,
    pub(crate) active: bool,
    pub(crate) callback: PlanCallback,
}

impl QueuedPlan {
    pub(crate) fn trace_entry(&self) -> TraceEntry {
        TraceEntry {
            time: self.time,
            arrival: self.arrival,
            owner: self.owner.clone(),
        }
    }
}

impl PartialEq for QueuedPlan {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.arrival == other.arrival
    }
}

impl Eq for QueuedPlan {}

impl Ord for QueuedPlan {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by (time, arrival).
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

impl PartialOrd for QueuedPlan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyedEntry {
    arrival: u64,
    active: bool,
}

/// Min-heap of plans keyed by (time, arrival) plus the simulation time cursor.
#[derive(Default)]
pub struct PlanQueue {
    now: SimTime,
    next_arrival: u64,
    heap: BinaryHeap<QueuedPlan>,
    keyed: HashMap<(Option<ComponentId>, PlanKey), KeyedEntry>,
    canceled: HashSet<u64>,
    active_pending: usize,
}

impl PlanQueue {
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Adds a plan on behalf of `owner`. Rejects plans in the past and duplicate
    /// keys for the same owner.
    pub fn schedule(
        &mut self,
        owner: Option<ComponentId>,
        plan: Plan,
    ) -> Result<PlanId, KernelError> {
        if plan.time < self.now {
            return Err(KernelError::PastSchedule {
                requested: plan.time,
                now: self.now,
            });
        }

        let arrival = self.next_arrival;
        if let Some(key) = &plan.key {
            let slot = (owner.clone(), key.clone());
            if self.keyed.contains_key(&slot) {
                return Err(KernelError::DuplicatePlanKey {
                    owner,
                    key: key.clone(),
                });
            }
            self.keyed.insert(
                slot,
                KeyedEntry {
                    arrival,
                    active: plan.active,
                },
            );
        }

        self.next_arrival += 1;
        if plan.active {
            self.active_pending += 1;
        }
        self.heap.push(QueuedPlan {
            time: plan.time,
            arrival,
            owner,
            key: plan.key,
            active: plan.active,
            callback: plan.callback,
        });
        Ok(PlanId(arrival))
    }

    /// Cancels the pending plan `key` of `owner`. Returns `false` when no such
    /// plan is pending, including plans that already executed.
    pub fn cancel(&mut self, owner: Option<&ComponentId>, key: &PlanKey) -> bool {
        let slot = (owner.cloned(), key.clone());
        match self.keyed.remove(&slot) {
            Some(entry) => {
                self.canceled.insert(entry.arrival);
                if entry.active {
                    self.active_pending -= 1;
                }
                true
            }
            None => false,
        }
    }

    fn purge_canceled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if !self.canceled.remove(&top.arrival) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Identity of the next plan to run, without removing it.
    pub fn peek(&mut self) -> Option<TraceEntry> {
        self.purge_canceled();
        self.heap.peek().map(QueuedPlan::trace_entry)
    }

    pub fn next_time(&mut self) -> Option<SimTime> {
        self.purge_canceled();
        self.heap.peek().map(|plan| plan.time)
    }

    /// Removes the next plan and moves the time cursor to its scheduled time.
    pub(crate) fn pop_next(&mut self) -> Option<QueuedPlan> {
        self.purge_canceled();
        let plan = self.heap.pop()?;
        self.now = plan.time;
        if plan.active {
            self.active_pending -= 1;
        }
        if let Some(key) = &plan.key {
            self.keyed.remove(&(plan.owner.clone(), key.clone()));
        }
        Some(plan)
    }

    pub fn len(&self) -> usize {
        self.heap.len() - self.canceled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_active_plans(&self) -> bool {
        self.active_pending > 0
    }

    pub fn snapshot(&self) -> SimulationSnapshot {
        let mut pending: Vec<PendingPlan> = self
            .heap
            .iter()
            .filter(|plan| !self.canceled.contains(&plan.arrival))
            .map(|plan| PendingPlan {
                time: plan.time,
                arrival: plan.arrival,
                owner: plan.owner.clone(),
                key: plan.key.clone(),
                active: plan.active,
            })
            .collect();
        pending.sort_by_key(|plan| (plan.time, plan.arrival));
        SimulationSnapshot {
            now: self.now,
            next_arrival: self.next_arrival,
            pending,
        }
    }
}

impl fmt::Debug for PlanQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanQueue")
            .field("now", &self.now)
            .field("pending", &self.len())
            .field("active_pending", &self.active_pending)
            .finish()
    }
}
