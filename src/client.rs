use crate::aggregator::Aggregator;
use crate::channel::{ChannelEvent, Connector, EventChannel};
use crate::config::RunConfig;
use crate::credentials::Credential;
use crate::error::{ClientErrorKind, Error};
use crate::utils::deadline_after;
use log::{debug, trace, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};

pub const JOIN_CONVERSATION: &str = "join_conversation";
pub const JOINED_CONVERSATION: &str = "joined_conversation";
pub const SEND_MESSAGE: &str = "send_message";
pub const NEW_MESSAGE: &str = "new_message";
pub const ERROR_EVENT: &str = "error";

const WATCHDOG_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClientState {
    Connecting,
    Joining,
    Sending,
    AwaitingActivity,
    TimedOut,
    Disconnected,
    Cancelled,
    Failed,
}

impl ClientState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientState::TimedOut
                | ClientState::Disconnected
                | ClientState::Cancelled
                | ClientState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Initial,
    Forwarded,
}

impl MessageKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            MessageKind::Initial => "init",
            MessageKind::Forwarded => "fwd",
        }
    }
}

/// What the inactivity watchdog decided on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inactivity {
    Active,
    /// Sent something and heard nothing back in time.
    NoReply,
    /// Burst finished, nothing pending, and the conversation went quiet.
    Idle,
}

/// Per-client settings shared by every client of a run.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    pub conversation_id: String,
    pub messages: usize,
    pub message_delay: Duration,
    pub inactivity_timeout: Duration,
    pub join_settle: Duration,
    pub connect_timeout: Duration,
    pub max_forwards: Option<usize>,
}

impl ClientSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            conversation_id: config.conversation_id.clone(),
            messages: config.messages_per_client,
            message_delay: config.message_delay(),
            inactivity_timeout: config.inactivity_timeout(),
            join_settle: config.join_settle(),
            connect_timeout: config.connect_timeout(),
            max_forwards: config.max_forwards,
        }
    }
}

/// Mutable record of one client's session. Only the client task touches it.
#[derive(Debug, Clone)]
pub struct Session {
    pub index: usize,
    pub state: ClientState,
    pub initial_sent: usize,
    pub forwarded_sent: usize,
    pub received: usize,
    pub last_send_time: Option<Instant>,
    pub last_activity_time: Instant,
    pub timed_out: bool,
    pub has_started_sending: bool,
    pub awaiting_reply: bool,
    pub joined: bool,
}

impl Session {
    pub fn new(index: usize, now: Instant) -> Self {
        Self {
            index,
            state: ClientState::Connecting,
            initial_sent: 0,
            forwarded_sent: 0,
            received: 0,
            last_send_time: None,
            last_activity_time: now,
            timed_out: false,
            has_started_sending: false,
            awaiting_reply: false,
            joined: false,
        }
    }

    /// Id of the next message of the given kind, e.g. `init_3_0` or `fwd_3_1`.
    pub fn next_message_id(&self, kind: MessageKind) -> String {
        let sequence = match kind {
            MessageKind::Initial => self.initial_sent,
            MessageKind::Forwarded => self.forwarded_sent,
        };
        format!("{}_{}_{}", kind.prefix(), self.index, sequence)
    }

    pub fn can_send(&self) -> bool {
        !self.timed_out && !self.state.is_terminal()
    }

    pub fn on_sent(&mut self, kind: MessageKind, now: Instant, burst_size: usize) {
        match kind {
            MessageKind::Initial => self.initial_sent += 1,
            MessageKind::Forwarded => self.forwarded_sent += 1,
        }
        self.last_send_time = Some(now);
        self.last_activity_time = now;
        self.has_started_sending = true;
        self.awaiting_reply = true;
        self.state = if self.initial_sent >= burst_size {
            ClientState::AwaitingActivity
        } else {
            ClientState::Sending
        };
    }

    pub fn on_received(&mut self, now: Instant) {
        self.received += 1;
        self.last_activity_time = now;
        self.awaiting_reply = false;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity_time = now;
    }

    pub fn check_inactivity(
        &self,
        now: Instant,
        inactivity_timeout: Duration,
        burst_size: usize,
    ) -> Inactivity {
        if self.has_started_sending && self.awaiting_reply {
            if let Some(last_send) = self.last_send_time {
                if now.saturating_duration_since(last_send) > inactivity_timeout {
                    return Inactivity::NoReply;
                }
            }
            return Inactivity::Active;
        }

        let burst_done = self.initial_sent >= burst_size;
        if burst_done && now.saturating_duration_since(self.last_activity_time) >= inactivity_timeout
        {
            return Inactivity::Idle;
        }
        Inactivity::Active
    }

    pub fn outcome(&self) -> ClientOutcome {
        ClientOutcome {
            index: self.index,
            state: self.state,
            initial_sent: self.initial_sent,
            forwarded_sent: self.forwarded_sent,
            received: self.received,
            timed_out: self.timed_out,
        }
    }
}

/// How a client ended, as seen from its own session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientOutcome {
    pub index: usize,
    pub state: ClientState,
    pub initial_sent: usize,
    pub forwarded_sent: usize,
    pub received: usize,
    pub timed_out: bool,
}

impl ClientOutcome {
    /// A client whose task never reported back, because it panicked or was aborted.
    pub fn lost(index: usize, state: ClientState) -> Self {
        Self {
            index,
            state,
            initial_sent: 0,
            forwarded_sent: 0,
            received: 0,
            timed_out: false,
        }
    }

    pub fn sent(&self) -> usize {
        self.initial_sent + self.forwarded_sent
    }
}

/// One simulated user: connects, joins the conversation, sends its burst and
/// answers to what it receives until it times out, goes idle or is cancelled.
pub struct VirtualClient {
    index: usize,
    credential: Credential,
    settings: Arc<ClientSettings>,
    aggregator: Arc<Aggregator>,
    connector: Arc<dyn Connector>,
    shutdown: watch::Receiver<bool>,
}

impl VirtualClient {
    pub fn new(
        index: usize,
        credential: Credential,
        settings: Arc<ClientSettings>,
        aggregator: Arc<Aggregator>,
        connector: Arc<dyn Connector>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            index,
            credential,
            settings,
            aggregator,
            connector,
            shutdown,
        }
    }

    pub async fn run(mut self) -> ClientOutcome {
        let mut session = Session::new(self.index, Instant::now());

        let mut channel = match self.connect(&mut session).await {
            Some(channel) => channel,
            None => return session.outcome(),
        };

        self.drive(&mut session, &mut channel).await;
        self.disconnect(&mut channel).await;

        debug!(
            "client {}: finished as {:?}, sent {} initial + {} forwarded, received {}",
            self.index,
            session.state,
            session.initial_sent,
            session.forwarded_sent,
            session.received
        );
        session.outcome()
    }

    async fn connect(&mut self, session: &mut Session) -> Option<EventChannel> {
        debug!("client {}: connecting to {}", self.index, self.settings.server_url);

        let attempt = timeout(
            self.settings.connect_timeout,
            self.connector
                .connect(&self.settings.server_url, &self.credential.token),
        );
        let result = tokio::select! {
            result = attempt => result,
            _ = wait_for_shutdown(&mut self.shutdown) => {
                session.state = ClientState::Cancelled;
                return None;
            }
        };

        // Anything that goes wrong before the channel is up is a connection failure,
        // whatever layer it came from
        let mut channel = match result {
            Ok(Ok(channel)) => channel,
            Ok(Err(err)) => {
                warn!("client {}: connection failed: {}", self.index, err);
                self.aggregator
                    .record_error(ClientErrorKind::Connection, &err.to_string());
                session.state = ClientState::Failed;
                return None;
            }
            Err(_) => {
                warn!(
                    "client {}: connection timed out after {:?}",
                    self.index, self.settings.connect_timeout
                );
                self.aggregator.record_error(
                    ClientErrorKind::Connection,
                    &format!("connect timed out after {:?}", self.settings.connect_timeout),
                );
                session.state = ClientState::Failed;
                return None;
            }
        };

        self.aggregator.record_connected();
        session.state = ClientState::Joining;
        session.touch(Instant::now());
        debug!(
            "client {}: connected, joining conversation {}",
            self.index, self.settings.conversation_id
        );

        let join = json!({ "data": { "conversationId": self.settings.conversation_id } });
        if let Err(err) = channel.emit(JOIN_CONVERSATION, join) {
            warn!("client {}: failed to join: {}", self.index, err);
            self.aggregator
                .record_error(ClientErrorKind::Connection, &err.to_string());
            session.state = ClientState::Failed;
            channel.close().await;
            return None;
        }

        Some(channel)
    }

    // Send pacing, the inactivity watchdog, shutdown and inbound events are all
    // branches of this loop, so every timer is gone once it returns
    async fn drive(&mut self, session: &mut Session, channel: &mut EventChannel) {
        let settings = Arc::clone(&self.settings);

        let pacing = sleep_until(deadline_after(Instant::now(), settings.join_settle));
        tokio::pin!(pacing);

        let mut watchdog = interval_at(Instant::now() + WATCHDOG_TICK, WATCHDOG_TICK);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !session.state.is_terminal() {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    debug!("client {}: run is shutting down", self.index);
                    session.state = ClientState::Cancelled;
                }
                _ = &mut pacing, if session.initial_sent < settings.messages => {
                    let sent = self.send(session, channel, MessageKind::Initial);
                    if sent && session.initial_sent < settings.messages {
                        pacing
                            .as_mut()
                            .reset(deadline_after(Instant::now(), settings.message_delay));
                    }
                }
                _ = watchdog.tick() => {
                    self.check_inactivity(session, Instant::now());
                }
                event = channel.next_event() => match event {
                    Some(Ok(event)) => self.handle_event(session, channel, event),
                    Some(Err(err)) => self.handle_transport_error(session, err),
                    None => {
                        debug!("client {}: server closed the channel", self.index);
                        session.state = ClientState::Disconnected;
                    }
                },
            }
        }
    }

    fn send(&self, session: &mut Session, channel: &EventChannel, kind: MessageKind) -> bool {
        if !session.can_send() {
            return false;
        }
        if !channel.is_open() {
            debug!("client {}: channel is gone, nothing more to send", self.index);
            session.state = ClientState::Disconnected;
            return false;
        }

        let message_id = session.next_message_id(kind);
        let content = match kind {
            MessageKind::Initial => format!(
                "Msg {} from client {}",
                session.initial_sent + 1,
                self.index
            ),
            MessageKind::Forwarded => format!(
                "Client {} forwards after receiving. Count: {}",
                self.index,
                session.forwarded_sent + 1
            ),
        };

        // The send instant is recorded before the emit, so a reply can never
        // arrive ahead of its correlation entry
        let now = Instant::now();
        if !self.aggregator.record_send(&message_id, now) {
            debug!("client {}: statistics are closed, stopping", self.index);
            session.state = ClientState::Cancelled;
            return false;
        }

        let payload = json!({
            "data": {
                "conversationId": self.settings.conversation_id,
                "content": content,
                "messageId": message_id,
            }
        });
        if let Err(err) = channel.emit(SEND_MESSAGE, payload) {
            warn!("client {}: failed to send {}: {}", self.index, message_id, err);
            self.aggregator.cancel_send(&message_id);
            self.aggregator.record_error(err.kind(), &err.to_string());
            session.state = ClientState::Failed;
            return false;
        }
        session.on_sent(kind, now, self.settings.messages);

        trace!("client {}: sent {}", self.index, message_id);
        true
    }

    fn handle_event(&self, session: &mut Session, channel: &EventChannel, event: ChannelEvent) {
        let now = Instant::now();

        match event.name.as_str() {
            NEW_MESSAGE => self.on_message_received(session, channel, &event.payload, now),
            JOINED_CONVERSATION => {
                session.touch(now);
                if !session.joined {
                    session.joined = true;
                    self.aggregator.record_joined();
                    debug!("client {}: joined the conversation", self.index);
                }
            }
            ERROR_EVENT => {
                session.touch(now);
                let detail = error_detail(&event.payload);
                warn!("client {}: server error: {}", self.index, detail);
                self.aggregator
                    .record_error(ClientErrorKind::Protocol, &detail);
            }
            other => {
                trace!("client {}: ignoring event {}", self.index, other);
                session.touch(now);
            }
        }
    }

    fn on_message_received(
        &self,
        session: &mut Session,
        channel: &EventChannel,
        payload: &Value,
        now: Instant,
    ) {
        if !payload.is_object() {
            self.aggregator.increment_received();
            self.aggregator.record_error(
                ClientErrorKind::Protocol,
                "new_message payload is not an object",
            );
            session.on_received(now);
            return;
        }

        let message = payload.get("message");
        let message_id = message
            .and_then(|m| m.get("messageId"))
            .and_then(Value::as_str);
        let conversation_id = message
            .and_then(|m| m.get("conversationId"))
            .or_else(|| payload.get("conversationId"))
            .and_then(Value::as_str)
            .unwrap_or(&self.settings.conversation_id);

        if let Some(latency) = self
            .aggregator
            .resolve_receipt(message_id, conversation_id, now)
        {
            trace!(
                "client {}: reply for {} after {:?}",
                self.index,
                message_id.unwrap_or_default(),
                latency
            );
        }
        session.on_received(now);

        if let Some(max_forwards) = self.settings.max_forwards {
            if session.forwarded_sent < max_forwards {
                self.send(session, channel, MessageKind::Forwarded);
            }
        }
    }

    fn handle_transport_error(&self, session: &mut Session, err: Error) {
        let kind = err.kind();
        self.aggregator.record_error(kind, &err.to_string());

        // A malformed packet only spoils that packet, the session goes on
        if kind == ClientErrorKind::Protocol {
            warn!("client {}: protocol error: {}", self.index, err);
            return;
        }
        warn!("client {}: channel failed: {}", self.index, err);
        session.state = ClientState::Failed;
    }

    fn check_inactivity(&self, session: &mut Session, now: Instant) {
        let timeout = self.settings.inactivity_timeout;
        match session.check_inactivity(now, timeout, self.settings.messages) {
            Inactivity::Active => {}
            Inactivity::NoReply => {
                warn!(
                    "client {}: no reply {:?} after the last send, timing out",
                    self.index, timeout
                );
                session.timed_out = true;
                session.state = ClientState::TimedOut;
                self.aggregator
                    .record_timeout(&format!("no reply within {:?}", timeout));
            }
            Inactivity::Idle => {
                debug!("client {}: idle for {:?}, disconnecting", self.index, timeout);
                session.state = ClientState::Disconnected;
            }
        }
    }

    async fn disconnect(&self, channel: &mut EventChannel) {
        if channel.is_open() {
            debug!("client {}: closing connection", self.index);
        }
        channel.close().await;
    }
}

// Resolves once shutdown was signalled, or once the orchestrator is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn error_detail(payload: &Value) -> String {
    match payload {
        Value::Null => String::from("unknown socket error"),
        Value::String(message) => message.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| other.to_string()),
    }
}
