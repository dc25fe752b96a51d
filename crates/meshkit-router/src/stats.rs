//! Per-node call statistics.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bucket bounds in microseconds; the final slot counts
/// everything beyond the last bound.
const BUCKET_BOUNDS: [u64; 8] = [
    1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000,
];

/// A fixed log-scale latency histogram.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    pub counts: [u64; 9],
}

impl Histogram {
    pub fn observe(&mut self, micros: u64) {
        let slot = BUCKET_BOUNDS
            .iter()
            .position(|bound| micros <= *bound)
            .unwrap_or(BUCKET_BOUNDS.len());
        self.counts[slot] += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// The accumulating record for one node.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeStats {
    pub service: String,
    pub node_id: String,
    pub calls: u64,
    pub errors: u64,
    pub latency_micros: u64,
    pub methods: HashMap<String, Histogram>,
}

impl NodeStats {
    pub(crate) fn new(service: &str, node_id: &str) -> Self {
        Self {
            service: service.to_string(),
            node_id: node_id.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, method: &str, duration: Duration, errored: bool) {
        let micros = duration.as_micros() as u64;
        self.calls += 1;
        if errored {
            self.errors += 1;
        }
        self.latency_micros += micros;
        self.methods.entry(method.to_string()).or_default().observe(micros);
    }

    pub(crate) fn mark_error(&mut self) {
        self.errors += 1;
    }

    /// Nothing to publish since the last reset.
    pub(crate) fn is_idle(&self) -> bool {
        self.calls == 0 && self.errors == 0
    }

    pub(crate) fn reset(&mut self) {
        self.calls = 0;
        self.errors = 0;
        self.latency_micros = 0;
        self.methods.clear();
    }

    pub(crate) fn to_message(&self, timestamp: i64) -> StatsMessage {
        StatsMessage {
            service: self.service.clone(),
            node_id: self.node_id.clone(),
            timestamp,
            calls: self.calls,
            errors: self.errors,
            latency_micros: self.latency_micros,
            methods: self.methods.clone(),
        }
    }
}

/// The shape published on the stats topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsMessage {
    pub service: String,
    pub node_id: String,
    /// Unix seconds at snapshot time.
    pub timestamp: i64,
    pub calls: u64,
    pub errors: u64,
    pub latency_micros: u64,
    #[serde(default)]
    pub methods: HashMap<String, Histogram>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_slots_by_bound() {
        let mut h = Histogram::default();
        h.observe(500);        // <= 1ms
        h.observe(1_000);      // boundary sits in the 1ms slot
        h.observe(7_000);      // <= 10ms
        h.observe(9_000_000);  // overflow

        assert_eq!(h.counts[0], 2);
        assert_eq!(h.counts[2], 1);
        assert_eq!(h.counts[8], 1);
        assert_eq!(h.total(), 4);
    }

    #[test]
    fn record_accumulates_and_reset_zeroes() {
        let mut stats = NodeStats::new("greeter", "n1");
        stats.record("Greeter.Hello", Duration::from_millis(3), false);
        stats.record("Greeter.Hello", Duration::from_millis(7), true);
        stats.mark_error();

        assert_eq!(stats.calls, 2);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.latency_micros, 10_000);
        assert_eq!(stats.methods["Greeter.Hello"].total(), 2);
        assert!(!stats.is_idle());

        stats.reset();
        assert_eq!(stats.calls, 0);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.latency_micros, 0);
        assert!(stats.methods.is_empty());
        assert!(stats.is_idle());
    }
}
