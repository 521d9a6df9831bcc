//! Kernel counters: plans executed, events published per type, dispatch faults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Plan and event processing counters for one scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMetrics {
    /// Plans executed, replayed ones included.
    pub plans_executed: u64,
    /// Events published that reached at least one subscriber.
    pub events_published: u64,
    /// Events published per event type name.
    pub events_by_type: BTreeMap<String, u64>,
    /// Subscriber failures captured during dispatch.
    pub dispatch_faults: u64,
    /// Outputs released by components.
    pub outputs_released: u64,
}

impl KernelMetrics {
    pub fn record_plan(&mut self) {
        self.plans_executed += 1;
    }

    pub fn record_event(&mut self, event_type: &str) {
        self.events_published += 1;
        *self
            .events_by_type
            .entry(event_type.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_dispatch_faults(&mut self, count: usize) {
        self.dispatch_faults += count as u64;
    }

    pub fn record_output(&mut self) {
        self.outputs_released += 1;
    }

    pub fn log_summary(&self) {
        info!(
            plans = self.plans_executed,
            events = self.events_published,
            faults = self.dispatch_faults,
            outputs = self.outputs_released,
            "kernel summary"
        );
        let mut entries: Vec<_> = self.events_by_type.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1));
        for (event_type, count) in entries {
            info!(event_type = %event_type, count, "events by type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_events_per_type() {
        let mut metrics = KernelMetrics::default();
        metrics.record_event("Ping");
        metrics.record_event("Ping");
        metrics.record_event("Pong");
        metrics.record_plan();
        assert_eq!(metrics.events_published, 3);
        assert_eq!(metrics.events_by_type["Ping"], 2);
        assert_eq!(metrics.plans_executed, 1);
    }
}
