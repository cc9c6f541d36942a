use crate::correlation::CorrelationTable;
use crate::error::ClientErrorKind;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Bucket used for latencies whose conversation size was never looked up.
pub const UNKNOWN_BUCKET: &str = "unknown";
const MAX_ERROR_DETAIL: usize = 80;

/// Process-wide statistics for one run.
///
/// Every read and write goes through one mutex, which also guards the
/// correlation table: recording a send, or resolving a receipt, updates the
/// table and the counters in a single critical section. Once [`freeze`] has
/// been called every write is ignored, so callbacks racing a shutdown can't
/// change the final numbers.
///
/// [`freeze`]: Aggregator::freeze
pub struct Aggregator {
    state: Mutex<AggregatorState>,
}

struct AggregatorState {
    frozen: bool,
    started_at: Instant,
    sent: u64,
    received: u64,
    errors: u64,
    timeouts: u64,
    clients_connected: u64,
    clients_joined: u64,
    errors_by_kind: BTreeMap<String, u64>,
    error_details: BTreeMap<String, u64>,
    latencies: Vec<Duration>,
    latency_timeline: Vec<(Duration, Duration)>,
    latency_by_size: BTreeMap<String, Vec<Duration>>,
    conversation_sizes: HashMap<String, usize>,
    correlation: CorrelationTable,
}

impl AggregatorState {
    fn new() -> Self {
        Self {
            frozen: false,
            started_at: Instant::now(),
            sent: 0,
            received: 0,
            errors: 0,
            timeouts: 0,
            clients_connected: 0,
            clients_joined: 0,
            errors_by_kind: BTreeMap::new(),
            error_details: BTreeMap::new(),
            latencies: Vec::new(),
            latency_timeline: Vec::new(),
            latency_by_size: BTreeMap::new(),
            conversation_sizes: HashMap::new(),
            correlation: CorrelationTable::new(),
        }
    }

    fn bucket_for(&self, conversation_id: &str) -> String {
        self.conversation_sizes
            .get(conversation_id)
            .map(|size| size.to_string())
            .unwrap_or_else(|| String::from(UNKNOWN_BUCKET))
    }

    fn push_latency(&mut self, latency: Duration, bucket: String, at: Instant) {
        let elapsed = at.saturating_duration_since(self.started_at);
        self.latencies.push(latency);
        self.latency_timeline.push((elapsed, latency));
        self.latency_by_size.entry(bucket).or_default().push(latency);
    }

    fn push_error(&mut self, kind: ClientErrorKind, detail: &str) {
        self.errors += 1;
        *self
            .errors_by_kind
            .entry(String::from(kind.signature()))
            .or_insert(0) += 1;
        let detail = format!("{}: {}", kind, truncate(detail, MAX_ERROR_DETAIL));
        *self.error_details.entry(detail).or_insert(0) += 1;
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AggregatorState::new()),
        }
    }

    // A poisoned lock only means a client panicked mid-update; counters are
    // still usable, so the guard is recovered instead of propagating the panic
    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts a fresh run: every counter, sample and in-flight entry is dropped.
    pub fn reset(&self) {
        *self.lock() = AggregatorState::new();
    }

    pub fn set_conversation_size(&self, conversation_id: &str, size: usize) {
        self.lock()
            .conversation_sizes
            .insert(String::from(conversation_id), size);
    }

    /// Records an outgoing message in the correlation table and counts it.
    /// Returns false when the aggregator is frozen and nothing was recorded.
    pub fn record_send(&self, message_id: &str, sent_at: Instant) -> bool {
        let mut state = self.lock();
        if state.frozen {
            return false;
        }
        state.correlation.record(message_id, sent_at);
        state.sent += 1;
        true
    }

    /// Counts a received message and, when its id matches an in-flight send,
    /// records and returns the round-trip latency. A second receipt for the
    /// same id is counted but yields no latency.
    pub fn resolve_receipt(
        &self,
        message_id: Option<&str>,
        conversation_id: &str,
        received_at: Instant,
    ) -> Option<Duration> {
        let mut state = self.lock();
        if state.frozen {
            return None;
        }
        state.received += 1;

        let sent_at = state.correlation.pop_if_present(message_id?)?;
        let latency = received_at.saturating_duration_since(sent_at);
        let bucket = state.bucket_for(conversation_id);
        state.push_latency(latency, bucket, received_at);
        Some(latency)
    }

    /// Takes back a send that never reached the transport: the in-flight entry
    /// is dropped and the message is no longer counted as sent.
    pub fn cancel_send(&self, message_id: &str) -> bool {
        let mut state = self.lock();
        if state.frozen || state.correlation.pop_if_present(message_id).is_none() {
            return false;
        }
        state.sent = state.sent.saturating_sub(1);
        true
    }

    pub fn increment_sent(&self) {
        let mut state = self.lock();
        if !state.frozen {
            state.sent += 1;
        }
    }

    /// Counts a receipt that carries nothing to correlate.
    pub fn increment_received(&self) {
        let mut state = self.lock();
        if !state.frozen {
            state.received += 1;
        }
    }

    pub fn record_latency(&self, latency: Duration, bucket: Option<&str>) {
        let mut state = self.lock();
        if state.frozen {
            return;
        }
        let bucket = bucket.unwrap_or(UNKNOWN_BUCKET).to_string();
        state.push_latency(latency, bucket, Instant::now());
    }

    pub fn record_error(&self, kind: ClientErrorKind, detail: &str) {
        let mut state = self.lock();
        if !state.frozen {
            state.push_error(kind, detail);
        }
    }

    /// A client gave up waiting for a reply. Counted as a timeout and as a
    /// `TimeoutError` in the error histogram.
    pub fn record_timeout(&self, detail: &str) {
        let mut state = self.lock();
        if !state.frozen {
            state.timeouts += 1;
            state.push_error(ClientErrorKind::Timeout, detail);
        }
    }

    pub fn record_connected(&self) {
        let mut state = self.lock();
        if !state.frozen {
            state.clients_connected += 1;
        }
    }

    pub fn record_joined(&self) {
        let mut state = self.lock();
        if !state.frozen {
            state.clients_joined += 1;
        }
    }

    /// Closes the aggregator for writes. The counters keep their final values.
    pub fn freeze(&self) {
        self.lock().frozen = true;
    }

    /// Current (sent, received) totals, read together.
    pub fn totals(&self) -> (u64, u64) {
        let state = self.lock();
        (state.sent, state.received)
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        let state = self.lock();
        let elapsed = state.started_at.elapsed();

        AggregateSnapshot {
            elapsed_secs: elapsed.as_secs_f64(),
            frozen: state.frozen,
            sent: state.sent,
            received: state.received,
            errors: state.errors,
            timeouts: state.timeouts,
            clients_connected: state.clients_connected,
            clients_joined: state.clients_joined,
            unresolved: state.correlation.in_flight() as u64,
            errors_by_kind: state.errors_by_kind.clone(),
            error_details: state.error_details.clone(),
            latency: LatencySummary::from_samples(&state.latencies),
            recent_latency_ms: recent_average_ms(&state.latencies, 10),
            latency_by_size: state
                .latency_by_size
                .iter()
                .map(|(size, samples)| (size.clone(), LatencySummary::from_samples(samples)))
                .collect(),
            latency_timeline: state
                .latency_timeline
                .iter()
                .map(|(at, latency)| LatencyPoint {
                    elapsed_secs: at.as_secs_f64(),
                    latency_ms: as_millis(*latency),
                })
                .collect(),
            latencies_ms: state.latencies.iter().map(|l| as_millis(*l)).collect(),
        }
    }
}

/// Point-in-time copy of the aggregator, taken under its lock.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    pub elapsed_secs: f64,
    pub frozen: bool,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub clients_connected: u64,
    pub clients_joined: u64,
    /// Messages still waiting for a reply when the snapshot was taken.
    pub unresolved: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub error_details: BTreeMap<String, u64>,
    pub latency: LatencySummary,
    pub recent_latency_ms: f64,
    pub latency_by_size: BTreeMap<String, LatencySummary>,
    pub latency_timeline: Vec<LatencyPoint>,
    pub latencies_ms: Vec<f64>,
}

impl AggregateSnapshot {
    /// Received over sent, in percent. `None` before anything was sent.
    pub fn success_rate(&self) -> Option<f64> {
        if self.sent == 0 {
            None
        } else {
            Some(self.received as f64 / self.sent as f64 * 100.0)
        }
    }

    pub fn errors_of(&self, kind: ClientErrorKind) -> u64 {
        self.errors_by_kind
            .get(kind.signature())
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyPoint {
    pub elapsed_secs: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub median_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub std_dev_ms: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<f64> = samples.iter().map(|l| as_millis(*l)).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        // Sample standard deviation, zero for a single sample
        let std_dev = if count > 1 {
            let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        Self {
            count,
            mean_ms: mean,
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            median_ms: percentile(&sorted, 50.0),
            p90_ms: percentile(&sorted, 90.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            std_dev_ms: std_dev,
        }
    }
}

// Linear interpolation between the closest ranks, over an already sorted slice
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

fn recent_average_ms(samples: &[Duration], window: usize) -> f64 {
    let recent = &samples[samples.len().saturating_sub(window)..];
    if recent.is_empty() {
        return 0.0;
    }
    recent.iter().map(|l| as_millis(*l)).sum::<f64>() / recent.len() as f64
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn truncate(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return String::from(detail);
    }
    let mut truncated: String = detail.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}
