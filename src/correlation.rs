use std::collections::HashMap;
use tokio::time::Instant;

/// In-flight messages, keyed by message id, with the instant they were sent.
///
/// Every entry is written once and read once: a receipt pops its entry, so a
/// duplicate or late receipt for the same id finds nothing. The table is not
/// synchronized on its own; it lives inside the aggregator's lock so a send
/// and its counter update are a single step.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    in_flight: HashMap<String, Instant>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: &str, sent_at: Instant) {
        self.in_flight.insert(String::from(id), sent_at);
    }

    pub fn pop_if_present(&mut self, id: &str) -> Option<Instant> {
        self.in_flight.remove(id)
    }

    /// Messages sent but never acknowledged.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
