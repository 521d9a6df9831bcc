//! Continuity log and plan queue snapshot used to resume halted scenarios.
//!
//! A scenario that records continuity keeps the identity of every plan it
//! executes. Resuming rebuilds the scenario from the same seed and re-executes
//! the logged plans in order, checking each one against the log, before normal
//! scheduling continues.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clock::{PlanKey, SimTime};
use crate::error::KernelError;
use crate::registry::ComponentId;

/// Identity of one executed plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceEntry {
    pub time: SimTime,
    pub arrival: u64,
    pub owner: Option<ComponentId>,
}

/// A plan still waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPlan {
    pub time: SimTime,
    pub arrival: u64,
    pub owner: Option<ComponentId>,
    pub key: Option<PlanKey>,
    pub active: bool,
}

/// Current time, pending plans (in execution order) and the arrival counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub now: SimTime,
    pub next_arrival: u64,
    pub pending: Vec<PendingPlan>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContinuity {
    pub scenario_index: usize,
    pub seed: u64,
    pub executed: Vec<TraceEntry>,
    /// Queue state when the run stopped; `None` while the run is still going.
    pub snapshot: Option<SimulationSnapshot>,
}

impl RunContinuity {
    pub fn new(scenario_index: usize, seed: u64) -> Self {
        Self {
            scenario_index,
            seed,
            ..Self::default()
        }
    }

    /// True when the recorded run left no plans behind.
    pub fn all_plans_complete(&self) -> bool {
        self.snapshot
            .as_ref()
            .map_or(true, |snapshot| snapshot.pending.is_empty())
    }

    pub fn halt_time(&self) -> Option<SimTime> {
        self.snapshot.as_ref().map(|snapshot| snapshot.now)
    }

    /// FNV-1a digest of the executed trace; equal traces give equal digests.
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        let mut feed = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(PRIME);
            }
        };
        for entry in &self.executed {
            feed(&entry.time.to_le_bytes());
            feed(&entry.arrival.to_le_bytes());
            if let Some(owner) = &entry.owner {
                feed(owner.as_str().as_bytes());
            }
            feed(&[0xff]);
        }
        hash
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), KernelError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn read_json(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(time: SimTime, arrival: u64) -> TraceEntry {
        TraceEntry {
            time,
            arrival,
            owner: Some(ComponentId::from_static("actor")),
        }
    }

    #[test]
    fn all_plans_complete_reflects_pending_plans() {
        let mut log = RunContinuity::new(0, 7);
        assert!(log.all_plans_complete());

        log.snapshot = Some(SimulationSnapshot {
            now: 5,
            next_arrival: 3,
            pending: vec![PendingPlan {
                time: 8,
                arrival: 2,
                owner: None,
                key: None,
                active: true,
            }],
        });
        assert!(!log.all_plans_complete());
        assert_eq!(log.halt_time(), Some(5));
    }

    #[test]
    fn fingerprint_tracks_trace_contents() {
        let mut a = RunContinuity::new(0, 1);
        a.executed = vec![entry(1, 0), entry(2, 1)];
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.executed[1].arrival = 5;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario_0.json");

        let mut log = RunContinuity::new(3, 99);
        log.executed = vec![entry(0, 0), entry(4, 1)];
        log.snapshot = Some(SimulationSnapshot::default());
        log.write_json(&path).unwrap();

        assert_eq!(RunContinuity::read_json(&path).unwrap(), log);
    }
}
