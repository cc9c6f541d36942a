use crate::aggregator::{AggregateSnapshot, Aggregator};
use crate::channel::Connector;
use crate::client::{ClientOutcome, ClientSettings, ClientState, VirtualClient};
use crate::config::RunConfig;
use crate::credentials::Credential;
use crate::error::ClientErrorKind;
use crate::lookup::ConversationSizeLookup;
use crate::monitor::LiveMonitor;
use crate::sampler::{MetricsSource, ResourceSample, ResourceSampler, SystemMetrics};
use crate::utils::{deadline_after, generate_run_id};
use futures::FutureExt;
use log::{info, warn};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use uuid::Uuid;

type MetricsFactory = Arc<dyn Fn() -> Box<dyn MetricsSource> + Send + Sync>;

/// Everything a finished run hands to the reporter.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub config: RunConfig,
    pub started_at: OffsetDateTime,
    pub duration: Duration,
    pub clients_spawned: usize,
    /// True when the global timeout cut the run short.
    pub forced: bool,
    pub snapshot: AggregateSnapshot,
    pub samples: Vec<ResourceSample>,
    pub outcomes: Vec<ClientOutcome>,
}

impl RunReport {
    pub fn outcome_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for outcome in &self.outcomes {
            *counts.entry(format!("{:?}", outcome.state)).or_insert(0) += 1;
        }
        counts
    }
}

/// Runs virtual clients against the chat service and bounds the whole run
/// with a global timeout.
pub struct Orchestrator {
    config: RunConfig,
    connector: Arc<dyn Connector>,
    aggregator: Arc<Aggregator>,
    metrics: MetricsFactory,
    size_lookup: Option<Arc<dyn ConversationSizeLookup>>,
}

impl Orchestrator {
    pub fn new(config: RunConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            aggregator: Arc::new(Aggregator::new()),
            metrics: Arc::new(|| Box::new(SystemMetrics::new()) as Box<dyn MetricsSource>),
            size_lookup: None,
        }
    }

    pub fn with_metrics_source<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn MetricsSource> + Send + Sync + 'static,
    {
        self.metrics = Arc::new(factory);
        self
    }

    pub fn with_size_lookup(mut self, lookup: Arc<dyn ConversationSizeLookup>) -> Self {
        self.size_lookup = Some(lookup);
        self
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run(&self, credentials: Vec<Credential>) -> RunReport {
        let run_id = generate_run_id();
        let started_at = OffsetDateTime::now_utc();
        let started = Instant::now();
        let deadline = deadline_after(started, self.config.global_timeout());

        let client_count = self.config.clients.min(credentials.len());
        if client_count < self.config.clients {
            warn!(
                "only {} credentials available, running {} of {} requested clients",
                credentials.len(),
                client_count,
                self.config.clients
            );
        }
        info!(
            "run {}: {} clients, {} messages each, against {}",
            run_id, client_count, self.config.messages_per_client, self.config.server_url
        );

        self.aggregator.reset();
        if let Some(first) = credentials.first() {
            self.lookup_conversation_size(first, deadline).await;
        }

        let sampler = ResourceSampler::start(
            self.aggregator(),
            (self.metrics)(),
            self.config.sample_interval(),
        );
        let monitor = self.config.live_monitoring.then(|| {
            LiveMonitor::start(self.aggregator(), client_count, self.config.monitor_interval())
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = Arc::new(ClientSettings::from_config(&self.config));
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::with_capacity(client_count);
        let mut pending = credentials.into_iter().take(client_count).enumerate();
        let mut spawned = 0;
        let mut next_spawn = Instant::now();

        let forced = loop {
            if spawned == client_count && tasks.is_empty() {
                break false;
            }

            tokio::select! {
                _ = sleep_until(deadline) => break true,
                _ = sleep_until(next_spawn), if spawned < client_count => {
                    if let Some((index, credential)) = pending.next() {
                        let client = VirtualClient::new(
                            index,
                            credential,
                            Arc::clone(&settings),
                            self.aggregator(),
                            Arc::clone(&self.connector),
                            shutdown_rx.clone(),
                        );
                        tasks.spawn(run_client(index, client, self.aggregator()));
                        spawned += 1;
                        next_spawn = deadline_after(Instant::now(), self.config.spawn_stagger());
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Ok(outcome) = joined {
                        outcomes.push(outcome);
                    }
                }
            }
        };

        if forced {
            warn!(
                "global timeout of {:?} reached with {} clients still running, shutting down",
                self.config.global_timeout(),
                tasks.len()
            );
            // Nothing may change the numbers once shutdown starts
            self.aggregator.freeze();
            let _ = shutdown_tx.send(true);

            let grace = self.config.shutdown_grace();
            let drained = timeout(grace, async {
                while let Some(joined) = tasks.join_next().await {
                    if let Ok(outcome) = joined {
                        outcomes.push(outcome);
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!("{} clients ignored the shutdown signal, aborting them", tasks.len());
                tasks.abort_all();
                while let Some(joined) = tasks.join_next().await {
                    if let Ok(outcome) = joined {
                        outcomes.push(outcome);
                    }
                }
            }
        }

        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        let samples = sampler.stop().await;
        self.aggregator.freeze();

        // Clients aborted mid-flight never reported back
        outcomes.sort_by_key(|outcome| outcome.index);
        for index in 0..spawned {
            if outcomes.get(index).map(|o| o.index) != Some(index) {
                outcomes.insert(index, ClientOutcome::lost(index, ClientState::Cancelled));
            }
        }

        let duration = started.elapsed();
        let snapshot = self.aggregator.snapshot();
        info!(
            "run {} finished in {:.2}s{}: sent {}, received {}, errors {}",
            run_id,
            duration.as_secs_f64(),
            if forced { " (forced)" } else { "" },
            snapshot.sent,
            snapshot.received,
            snapshot.errors
        );

        RunReport {
            run_id,
            config: self.config.clone(),
            started_at,
            duration,
            clients_spawned: spawned,
            forced,
            snapshot,
            samples,
            outcomes,
        }
    }

    async fn lookup_conversation_size(&self, credential: &Credential, deadline: Instant) {
        if !self.config.lookup_conversation_size || self.config.conversation_id.is_empty() {
            return;
        }
        let Some(lookup) = &self.size_lookup else {
            return;
        };

        let conversation_id = &self.config.conversation_id;
        let result = timeout_at(
            deadline,
            lookup.conversation_size(&self.config.server_url, conversation_id, &credential.token),
        )
        .await;

        match result {
            Ok(Ok(size)) => self.aggregator.set_conversation_size(conversation_id, size),
            Ok(Err(err)) => warn!(
                "conversation size lookup failed, latencies go to the unknown bucket: {}",
                err
            ),
            Err(_) => warn!("conversation size lookup didn't finish before the global timeout"),
        }
    }
}

// A panic stays inside its client: it's recorded and turned into an outcome
async fn run_client(index: usize, client: VirtualClient, aggregator: Arc<Aggregator>) -> ClientOutcome {
    match AssertUnwindSafe(client.run()).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| String::from("client task panicked"));
            warn!("client {}: panicked: {}", index, detail);
            aggregator.record_error(ClientErrorKind::Generic, &detail);
            ClientOutcome::lost(index, ClientState::Failed)
        }
    }
}
