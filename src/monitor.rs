use crate::aggregator::{AggregateSnapshot, Aggregator};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Logs a one-line progress summary at a fixed interval while a run is going.
pub struct LiveMonitor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LiveMonitor {
    pub fn start(aggregator: Arc<Aggregator>, clients: usize, every: Duration) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => info!("{}", progress_line(&aggregator.snapshot(), clients)),
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self { stop, task }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

pub fn progress_line(snapshot: &AggregateSnapshot, clients: usize) -> String {
    let success = snapshot
        .success_rate()
        .map(|rate| format!("{:.1}%", rate))
        .unwrap_or_else(|| String::from("-"));

    format!(
        "[{:>6.1}s] connected {}/{} joined {} | sent {} received {} ({}) | errors {} timeouts {} | latency avg {:.1}ms recent {:.1}ms",
        snapshot.elapsed_secs,
        snapshot.clients_connected,
        clients,
        snapshot.clients_joined,
        snapshot.sent,
        snapshot.received,
        success,
        snapshot.errors,
        snapshot.timeouts,
        snapshot.latency.mean_ms,
        snapshot.recent_latency_ms,
    )
}
