use crate::config::ClientConfig;
use crate::connection::WSConnection;
use crate::error::Error;
use crate::handshake::connect_async_with_config;
use crate::message::Message;
use crate::protocol::Packet;
use futures::future::BoxFuture;
use futures::StreamExt;
use log::{debug, trace};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use url::Url;

const CLOSE_TIMEOUT: u64 = 5;

/// A named event received from the chat service.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub name: String,
    pub payload: Value,
}

impl ChannelEvent {
    pub fn new(name: &str, payload: Value) -> Self {
        Self {
            name: String::from(name),
            payload,
        }
    }
}

/// What the owner of an [`EventChannel`] asks the transport behind it to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Emit { name: String, payload: Value },
    Close,
}

/// Bidirectional event channel to the chat service. Transports sit behind the
/// two unbounded channels, so the virtual clients never see the wire protocol.
pub struct EventChannel {
    commands: UnboundedSender<Command>,
    events: UnboundedReceiver<Result<ChannelEvent, Error>>,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

/// The transport end of an in-memory [`EventChannel`].
pub struct ChannelPeer {
    pub commands: UnboundedReceiver<Command>,
    pub events: UnboundedSender<Result<ChannelEvent, Error>>,
}

impl EventChannel {
    pub fn new(
        commands: UnboundedSender<Command>,
        events: UnboundedReceiver<Result<ChannelEvent, Error>>,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            commands,
            events,
            pump,
            closed: false,
        }
    }

    /// Channel backed by nothing but the returned peer, for transports that
    /// drive both ends themselves.
    pub fn pair() -> (EventChannel, ChannelPeer) {
        let (command_tx, command_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();
        (
            EventChannel::new(command_tx, event_rx, None),
            ChannelPeer {
                commands: command_rx,
                events: event_tx,
            },
        )
    }

    pub fn emit(&self, name: &str, payload: Value) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.commands
            .send(Command::Emit {
                name: String::from(name),
                payload,
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Next event, `None` once the transport has gone away.
    pub async fn next_event(&mut self) -> Option<Result<ChannelEvent, Error>> {
        self.events.recv().await
    }

    pub fn is_open(&self) -> bool {
        !self.closed && !self.commands.is_closed()
    }

    /// Asks the transport to close and waits for it to finish. Safe to call
    /// more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.commands.send(Command::Close);

        if let Some(pump) = self.pump.take() {
            if timeout(Duration::from_secs(CLOSE_TIMEOUT), pump).await.is_err() {
                debug!("transport didn't finish closing in {}s", CLOSE_TIMEOUT);
            }
        }
    }
}

/// Opens event channels to the chat service. The seam between the harness and
/// the wire protocol.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        address: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<EventChannel, Error>>;
}

/// Socket.IO v4 over websocket, authenticated with a bearer token.
#[derive(Debug, Clone, Default)]
pub struct SocketIoConnector {
    client_config: ClientConfig,
}

impl SocketIoConnector {
    pub fn new(client_config: ClientConfig) -> Self {
        Self { client_config }
    }

    async fn open(&self, address: &str, token: &str) -> Result<EventChannel, Error> {
        let url = socket_io_url(address, token)?;

        let mut client_config = self.client_config.clone();
        client_config
            .headers
            .push((String::from("token"), String::from(token)));

        let mut connection = connect_async_with_config(&url, Some(client_config)).await?;

        // Engine.IO starts with the open packet, then the namespace connect has to be
        // acknowledged before any event can be exchanged
        match next_packet(&mut connection).await? {
            Packet::Open(info) => trace!("engine.io session {} opened", info.sid),
            _ => return Err(Error::UnexpectedPacket("waiting for the open packet")),
        }

        send_packet(&connection, &Packet::connect(Some(json!({ "token": token }))))?;

        loop {
            match next_packet(&mut connection).await? {
                Packet::Connect { .. } => break,
                Packet::ConnectError { data, .. } => {
                    let reason = data
                        .get("message")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(|| data.to_string());
                    let _ = connection.close_connection().await;
                    return Err(Error::ConnectRefused(reason));
                }
                Packet::Ping => send_packet(&connection, &Packet::Pong)?,
                Packet::Close | Packet::Disconnect { .. } => return Err(Error::ConnectionClosed),
                _ => {}
            }
        }

        let (command_tx, command_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();
        let pump = tokio::spawn(pump_events(connection, command_rx, event_tx));

        Ok(EventChannel::new(command_tx, event_rx, Some(pump)))
    }
}

impl Connector for SocketIoConnector {
    fn connect<'a>(
        &'a self,
        address: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<EventChannel, Error>> {
        Box::pin(self.open(address, token))
    }
}

// Builds the Engine.IO websocket endpoint from the service base address. An address
// with its own path is kept as is, so servers mounted elsewhere still work.
pub fn socket_io_url(address: &str, token: &str) -> Result<String, Error> {
    let mut url = Url::parse(address)?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(Error::InvalidSchemeURL(other.to_string())),
    };
    // Switching between special schemes never fails
    let _ = url.set_scheme(scheme);

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/socket.io/");
    }

    url.query_pairs_mut()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket")
        .append_pair("token", token);

    Ok(url.to_string())
}

async fn next_packet(connection: &mut WSConnection) -> Result<Packet, Error> {
    loop {
        match connection.next().await {
            Some(Ok(Message::Text(text))) => return Packet::decode(&text),
            // Binary attachments are not part of the chat protocol
            Some(Ok(Message::Binary(_))) => continue,
            Some(Err(err)) => return Err(err),
            None => return Err(Error::ConnectionClosed),
        }
    }
}

fn send_packet(connection: &WSConnection, packet: &Packet) -> Result<(), Error> {
    connection.send_text(packet.encode()?)
}

// Moves events between the websocket and the channel until either side closes
async fn pump_events(
    mut connection: WSConnection,
    mut commands: UnboundedReceiver<Command>,
    events: UnboundedSender<Result<ChannelEvent, Error>>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Emit { name, payload }) => {
                    let sent = Packet::event(&name, payload)
                        .encode()
                        .and_then(|text| connection.send_text(text));
                    if let Err(err) = sent {
                        let _ = events.send(Err(err));
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = send_packet(&connection, &Packet::disconnect());
                    break;
                }
            },
            message = connection.next() => match message {
                Some(Ok(Message::Text(text))) => match Packet::decode(&text) {
                    Ok(Packet::Ping) => {
                        if send_packet(&connection, &Packet::Pong).is_err() {
                            break;
                        }
                    }
                    Ok(Packet::Event { name, data, .. }) => {
                        if events.send(Ok(ChannelEvent { name, payload: data })).is_err() {
                            break;
                        }
                    }
                    Ok(Packet::Close) | Ok(Packet::Disconnect { .. }) => break,
                    Ok(_) => {}
                    Err(err) => {
                        if events.send(Err(err)).is_err() {
                            break;
                        }
                    }
                },
                Some(Ok(Message::Binary(_))) => {}
                Some(Err(err)) => {
                    let _ = events.send(Err(err));
                    break;
                }
                None => break,
            },
        }
    }

    if let Err(err) = connection.close_connection().await {
        debug!("error while closing websocket: {}", err);
    }
}
