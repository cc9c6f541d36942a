use futures::future::BoxFuture;
use serde_json::{json, Value};
use socket_swarm::channel::{ChannelEvent, Command, Connector, EventChannel};
use socket_swarm::client::ClientState;
use socket_swarm::config::RunConfig;
use socket_swarm::credentials::Credential;
use socket_swarm::error::{ClientErrorKind, Error};
use socket_swarm::lookup::ConversationSizeLookup;
use socket_swarm::orchestrator::{Orchestrator, RunReport};
use socket_swarm::report;
use socket_swarm::sampler::MetricsSource;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONVERSATION: &str = "room";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Behaviour {
    /// Sends every message back to its sender after a millisecond.
    Echo,
    /// Same as Echo, but every message comes back twice.
    EchoTwice,
    /// Accepts the connection and never says anything.
    Silent,
    /// Rejects the namespace connection.
    Refuse,
    /// Never finishes connecting.
    Hang,
    /// Answers the join with a server side error event, then echoes.
    ErrorOnJoin,
    /// Answers every message with a payload that isn't an object.
    Garbled,
}

// In-memory chat service: one task per connection, fed by the channel pair
struct MockService {
    behaviour: Behaviour,
    connections: AtomicUsize,
}

impl MockService {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            connections: AtomicUsize::new(0),
        })
    }
}

impl Connector for MockService {
    fn connect<'a>(
        &'a self,
        _address: &'a str,
        _token: &'a str,
    ) -> BoxFuture<'a, Result<EventChannel, Error>> {
        match self.behaviour {
            Behaviour::Hang => return Box::pin(futures::future::pending::<Result<EventChannel, Error>>()),
            Behaviour::Refuse => {
                return Box::pin(async {
                    Err::<EventChannel, Error>(Error::ConnectRefused(String::from("Authentication error")))
                })
            }
            _ => {}
        }

        self.connections.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.behaviour;
        Box::pin(async move {
            let (channel, mut peer) = EventChannel::pair();
            tokio::spawn(async move {
                while let Some(command) = peer.commands.recv().await {
                    let (name, payload) = match command {
                        Command::Emit { name, payload } => (name, payload),
                        Command::Close => break,
                    };

                    match (name.as_str(), behaviour) {
                        ("join_conversation", Behaviour::ErrorOnJoin) => {
                            let error = json!({ "message": "Not a participant" });
                            let _ = peer.events.send(Ok(ChannelEvent::new("error", error)));
                        }
                        ("join_conversation", _) => {
                            let joined = json!({ "conversationId": CONVERSATION });
                            let _ = peer
                                .events
                                .send(Ok(ChannelEvent::new("joined_conversation", joined)));
                        }
                        ("send_message", Behaviour::Silent) => {}
                        ("send_message", Behaviour::Garbled) => {
                            let event = ChannelEvent::new("new_message", json!("garbled"));
                            let _ = peer.events.send(Ok(event));
                        }
                        ("send_message", _) => {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            let copies = if behaviour == Behaviour::EchoTwice { 2 } else { 1 };
                            for _ in 0..copies {
                                let event = ChannelEvent::new("new_message", echo_of(&payload));
                                let _ = peer.events.send(Ok(event));
                            }
                        }
                        _ => {}
                    }
                }
            });
            Ok::<EventChannel, Error>(channel)
        })
    }
}

fn echo_of(payload: &Value) -> Value {
    let data = &payload["data"];
    json!({
        "message": {
            "messageId": data["messageId"],
            "conversationId": data["conversationId"],
            "content": data["content"],
        },
        "conversationId": data["conversationId"],
    })
}

struct FixedMetrics;

impl MetricsSource for FixedMetrics {
    fn cpu_percent(&mut self) -> f64 {
        20.0
    }

    fn memory_percent(&mut self) -> f64 {
        50.0
    }
}

struct FixedSize(usize);

impl ConversationSizeLookup for FixedSize {
    fn conversation_size<'a>(
        &'a self,
        _server_url: &'a str,
        _conversation_id: &'a str,
        _token: &'a str,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        let size = self.0;
        Box::pin(async move { Ok::<usize, Error>(size) })
    }
}

fn test_config(clients: usize, messages: usize) -> RunConfig {
    RunConfig {
        server_url: String::from("ws://chat.test"),
        conversation_id: String::from(CONVERSATION),
        clients,
        messages_per_client: messages,
        message_delay_ms: 10,
        inactivity_timeout_secs: 1,
        global_timeout_secs: 30,
        spawn_stagger_ms: 0,
        join_settle_ms: 0,
        sample_interval_ms: 100,
        shutdown_grace_secs: 1,
        reports_enabled: false,
        lookup_conversation_size: false,
        ..RunConfig::default()
    }
}

fn credentials(count: usize) -> Vec<Credential> {
    (0..count)
        .map(|i| Credential::from_token(&format!("token-{}", i)))
        .collect()
}

async fn run(config: RunConfig, connector: Arc<MockService>, tokens: usize) -> RunReport {
    Orchestrator::new(config, connector)
        .with_metrics_source(|| Box::new(FixedMetrics) as Box<dyn MetricsSource>)
        .run(credentials(tokens))
        .await
}

#[tokio::test(start_paused = true)]
async fn echoed_messages_resolve_latency() {
    let config = RunConfig {
        message_delay_ms: 0,
        ..test_config(1, 3)
    };
    let report = run(config, MockService::new(Behaviour::Echo), 1).await;
    let snapshot = &report.snapshot;

    assert!(!report.forced);
    assert_eq!(snapshot.sent, 3);
    assert_eq!(snapshot.received, 3);
    assert_eq!(snapshot.latency.count, 3);
    assert!(snapshot.latency.min_ms > 0.0);
    assert_eq!(snapshot.timeouts, 0);
    assert_eq!(snapshot.errors, 0);
    assert_eq!(snapshot.unresolved, 0);
    assert_eq!(snapshot.clients_connected, 1);
    assert_eq!(snapshot.clients_joined, 1);
    assert_eq!(snapshot.success_rate(), Some(100.0));

    // Nothing pending after the burst, so the client leaves once idle
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].state, ClientState::Disconnected);
    assert!(!report.outcomes[0].timed_out);
    assert!(!report.samples.is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out() {
    let report = run(test_config(1, 2), MockService::new(Behaviour::Silent), 1).await;
    let snapshot = &report.snapshot;

    assert_eq!(snapshot.sent, 2);
    assert_eq!(snapshot.received, 0);
    assert_eq!(snapshot.timeouts, 1);
    assert_eq!(snapshot.errors_of(ClientErrorKind::Timeout), 1);
    assert_eq!(snapshot.unresolved, 2);
    assert_eq!(snapshot.latency.count, 0);

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.state, ClientState::TimedOut);
    assert!(outcome.timed_out);
    assert_eq!(outcome.sent(), 2);
}

#[tokio::test(start_paused = true)]
async fn refused_connections_are_connection_errors() {
    let report = run(test_config(5, 3), MockService::new(Behaviour::Refuse), 5).await;
    let snapshot = &report.snapshot;

    assert_eq!(snapshot.errors, 5);
    assert_eq!(snapshot.errors_of(ClientErrorKind::Connection), 5);
    assert_eq!(snapshot.sent, 0);
    assert_eq!(snapshot.clients_connected, 0);
    assert_eq!(snapshot.success_rate(), None);
    assert_eq!(report::verdict(&report), report::Verdict::Inconclusive);
    assert!(report
        .outcomes
        .iter()
        .all(|outcome| outcome.state == ClientState::Failed));
}

#[tokio::test(start_paused = true)]
async fn concurrent_clients_share_the_counters() {
    let service = MockService::new(Behaviour::Echo);
    let report = run(test_config(20, 5), Arc::clone(&service), 20).await;
    let snapshot = &report.snapshot;

    assert_eq!(service.connections.load(Ordering::SeqCst), 20);
    assert_eq!(report.clients_spawned, 20);
    assert_eq!(report.outcomes.len(), 20);

    let sent_by_clients: usize = report.outcomes.iter().map(|o| o.sent()).sum();
    assert_eq!(sent_by_clients as u64, snapshot.sent);
    assert_eq!(snapshot.sent, 100);
    assert_eq!(snapshot.received, 100);
    assert_eq!(snapshot.latency.count, 100);
    assert_eq!(report.outcome_counts().get("Disconnected"), Some(&20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn parallel_clients_lose_no_updates() {
    let service = MockService::new(Behaviour::Echo);
    let report = run(test_config(200, 5), Arc::clone(&service), 200).await;
    let snapshot = &report.snapshot;

    assert!(!report.forced);
    assert_eq!(service.connections.load(Ordering::SeqCst), 200);
    assert_eq!(report.outcomes.len(), 200);

    let sent_by_clients: usize = report.outcomes.iter().map(|o| o.sent()).sum();
    let received_by_clients: usize = report.outcomes.iter().map(|o| o.received).sum();
    assert_eq!(sent_by_clients as u64, snapshot.sent);
    assert_eq!(received_by_clients as u64, snapshot.received);
    assert_eq!(snapshot.sent, 1000);
    assert_eq!(snapshot.received, 1000);
    assert_eq!(snapshot.latency.count, 1000);
    assert_eq!(snapshot.unresolved, 0);
    assert_eq!(snapshot.clients_connected, 200);
    assert_eq!(report.outcome_counts().get("Disconnected"), Some(&200));
}

#[tokio::test(start_paused = true)]
async fn oversized_timeouts_do_not_overflow() {
    let config = RunConfig {
        global_timeout_secs: u64::MAX,
        ..test_config(2, 2)
    };
    let report = run(config, MockService::new(Behaviour::Echo), 2).await;

    assert!(!report.forced);
    assert_eq!(report.snapshot.sent, 4);
    assert_eq!(report.snapshot.received, 4);
}

#[tokio::test(start_paused = true)]
async fn clients_are_capped_by_credentials() {
    let report = run(test_config(10, 1), MockService::new(Behaviour::Echo), 3).await;

    assert_eq!(report.clients_spawned, 3);
    assert_eq!(report.snapshot.sent, 3);
}

#[tokio::test(start_paused = true)]
async fn duplicate_receipts_add_no_samples() {
    let report = run(test_config(1, 2), MockService::new(Behaviour::EchoTwice), 1).await;
    let snapshot = &report.snapshot;

    assert_eq!(snapshot.sent, 2);
    assert_eq!(snapshot.received, 4);
    assert_eq!(snapshot.latency.count, 2);
    assert_eq!(report.outcomes[0].received, 4);
}

#[tokio::test(start_paused = true)]
async fn forwards_stop_at_the_cap() {
    let config = RunConfig {
        max_forwards: Some(2),
        ..test_config(1, 1)
    };
    let report = run(config, MockService::new(Behaviour::Echo), 1).await;
    let snapshot = &report.snapshot;

    assert_eq!(snapshot.sent, 3);
    assert_eq!(snapshot.received, 3);
    assert_eq!(snapshot.latency.count, 3);

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.initial_sent, 1);
    assert_eq!(outcome.forwarded_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn server_error_event_is_recorded() {
    let report = run(test_config(1, 2), MockService::new(Behaviour::ErrorOnJoin), 1).await;
    let snapshot = &report.snapshot;

    assert_eq!(snapshot.errors_of(ClientErrorKind::Protocol), 1);
    assert_eq!(
        snapshot.error_details.get("ProtocolError: Not a participant"),
        Some(&1)
    );
    // The session carries on after the error
    assert_eq!(snapshot.sent, 2);
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.clients_joined, 0);
}

#[tokio::test(start_paused = true)]
async fn garbled_replies_still_count_as_received() {
    let report = run(test_config(1, 2), MockService::new(Behaviour::Garbled), 1).await;
    let snapshot = &report.snapshot;

    assert_eq!(snapshot.sent, 2);
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.latency.count, 0);
    assert_eq!(snapshot.errors_of(ClientErrorKind::Protocol), 2);
    assert_eq!(snapshot.timeouts, 0);

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.received, 2);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.state, ClientState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn global_timeout_cancels_hanging_clients() {
    let config = RunConfig {
        global_timeout_secs: 1,
        connect_timeout_secs: 60,
        ..test_config(4, 3)
    };
    let report = run(config, MockService::new(Behaviour::Hang), 4).await;

    assert!(report.forced);
    assert!(report.duration >= Duration::from_secs(1));
    assert!(report.duration < Duration::from_secs(3));
    assert!(report.snapshot.frozen);
    assert_eq!(report.snapshot.errors, 0);
    assert_eq!(report.snapshot.sent, 0);
    assert_eq!(report.outcomes.len(), 4);
    assert!(report
        .outcomes
        .iter()
        .all(|outcome| outcome.state == ClientState::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn global_timeout_freezes_a_running_burst() {
    let config = RunConfig {
        global_timeout_secs: 1,
        message_delay_ms: 300,
        ..test_config(2, 100)
    };
    let report = run(config, MockService::new(Behaviour::Echo), 2).await;
    let snapshot = &report.snapshot;

    assert!(report.forced);
    assert!(snapshot.sent > 0);
    assert!(snapshot.sent < 200);
    let sent_by_clients: usize = report.outcomes.iter().map(|o| o.sent()).sum();
    assert_eq!(sent_by_clients as u64, snapshot.sent);
    assert!(report
        .outcomes
        .iter()
        .all(|outcome| outcome.state == ClientState::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn latencies_are_bucketed_by_conversation_size() {
    let config = RunConfig {
        lookup_conversation_size: true,
        ..test_config(2, 2)
    };
    let report = Orchestrator::new(config, MockService::new(Behaviour::Echo))
        .with_metrics_source(|| Box::new(FixedMetrics) as Box<dyn MetricsSource>)
        .with_size_lookup(Arc::new(FixedSize(12)))
        .run(credentials(2))
        .await;

    let buckets = &report.snapshot.latency_by_size;
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets["12"].count, 4);
}

#[tokio::test(start_paused = true)]
async fn reports_are_written() -> Result<(), Box<dyn std::error::Error>> {
    let report = run(test_config(2, 2), MockService::new(Behaviour::Echo), 2).await;
    let dir = tempfile::tempdir()?;

    let files = report::write_reports(&report, dir.path())?;
    let text = std::fs::read_to_string(&files.text)?;
    assert!(text.contains("SUMMARY RESULTS"));
    assert!(text.contains("LATENCY STATISTICS"));
    assert!(text.contains("CONCLUSION"));

    let summary: Value = serde_json::from_str(&std::fs::read_to_string(&files.summary)?)?;
    assert_eq!(summary["statistics"]["sent"], 4);
    assert_eq!(summary["clients_spawned"], 2);

    let resources = std::fs::read_to_string(&files.resources_csv)?;
    assert!(resources.starts_with(
        "elapsed_secs,cpu_percent,memory_percent,sent_total,received_total,sent_delta,received_delta\n"
    ));
    let latency = std::fs::read_to_string(&files.latency_csv)?;
    assert!(latency.starts_with("elapsed_secs,latency_ms\n"));
    assert_eq!(latency.lines().count(), 1 + 4);
    Ok(())
}
