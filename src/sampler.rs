use crate::aggregator::Aggregator;
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Host resource readings, as percentages in `0..=100`.
pub trait MetricsSource: Send {
    fn cpu_percent(&mut self) -> f64;
    fn memory_percent(&mut self) -> f64;
}

/// Whole-host CPU and memory usage through `sysinfo`.
pub struct SystemMetrics {
    system: System,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is computed between two refreshes, so the first reading
        // needs a baseline
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }
}

impl MetricsSource for SystemMetrics {
    fn cpu_percent(&mut self) -> f64 {
        self.system.refresh_cpu_usage();
        self.system.global_cpu_usage() as f64
    }

    fn memory_percent(&mut self) -> f64 {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        self.system.used_memory() as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    /// Seconds since the sampler started.
    pub elapsed_secs: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub sent_total: u64,
    pub received_total: u64,
    pub sent_delta: u64,
    pub received_delta: u64,
}

/// Background task that periodically records resource usage next to the
/// message counters of the aggregator.
pub struct ResourceSampler {
    stop: watch::Sender<bool>,
    task: JoinHandle<Vec<ResourceSample>>,
}

impl ResourceSampler {
    pub fn start(
        aggregator: Arc<Aggregator>,
        source: Box<dyn MetricsSource>,
        sample_interval: Duration,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sample_loop(aggregator, source, sample_interval, stop_rx));
        Self { stop, task }
    }

    /// Stops sampling and hands back every sample taken. Consumes the sampler,
    /// so it can only be stopped once.
    pub async fn stop(self) -> Vec<ResourceSample> {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(samples) => samples,
            Err(err) => {
                warn!("resource sampler task failed: {}", err);
                Vec::new()
            }
        }
    }
}

async fn sample_loop(
    aggregator: Arc<Aggregator>,
    mut source: Box<dyn MetricsSource>,
    sample_interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> Vec<ResourceSample> {
    let started = Instant::now();
    let mut samples = Vec::new();
    let (mut last_sent, mut last_received) = (0u64, 0u64);

    let mut ticker = interval(sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (sent, received) = aggregator.totals();
                let sample = ResourceSample {
                    elapsed_secs: started.elapsed().as_secs_f64(),
                    cpu_percent: source.cpu_percent(),
                    memory_percent: source.memory_percent(),
                    sent_total: sent,
                    received_total: received,
                    sent_delta: sent.saturating_sub(last_sent),
                    received_delta: received.saturating_sub(last_received),
                };
                last_sent = sent;
                last_received = received;
                samples.push(sample);
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    debug!("resource sampler stopped after {} samples", samples.len());
    samples
}
