//! Text codec for the Engine.IO v4 / Socket.IO v5 packets carried inside
//! websocket text messages.
//!
//! An Engine.IO packet is a single type digit followed by its data. Type `4`
//! (message) wraps a Socket.IO packet, which is again a type digit, an optional
//! `/namespace,` prefix, an optional ack id and a JSON document:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   open
//! 2 / 3                                                    ping / pong
//! 40{"token":".."}                                         connect with auth
//! 42["new_message",{"message":{..}}]                       event
//! 44{"message":"Authentication error"}                     connect error
//! ```
use crate::error::Error;
use serde::Deserialize;
use serde_json::{json, Value};

pub const DEFAULT_NAMESPACE: &str = "/";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Noop,
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        name: String,
        data: Value,
    },
    Ack {
        namespace: String,
    },
    ConnectError {
        namespace: String,
        data: Value,
    },
}

impl Packet {
    pub fn event(name: &str, data: Value) -> Self {
        Packet::Event {
            namespace: String::from(DEFAULT_NAMESPACE),
            name: String::from(name),
            data,
        }
    }

    pub fn connect(data: Option<Value>) -> Self {
        Packet::Connect {
            namespace: String::from(DEFAULT_NAMESPACE),
            data,
        }
    }

    pub fn disconnect() -> Self {
        Packet::Disconnect {
            namespace: String::from(DEFAULT_NAMESPACE),
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        let encoded = match self {
            Packet::Open(info) => format!(
                "0{}",
                json!({
                    "sid": info.sid,
                    "pingInterval": info.ping_interval,
                    "pingTimeout": info.ping_timeout,
                })
            ),
            Packet::Close => String::from("1"),
            Packet::Ping => String::from("2"),
            Packet::Pong => String::from("3"),
            Packet::Noop => String::from("6"),
            Packet::Connect { namespace, data } => {
                let mut out = format!("40{}", namespace_prefix(namespace));
                if let Some(data) = data {
                    out.push_str(&serde_json::to_string(data)?);
                }
                out
            }
            Packet::Disconnect { namespace } => format!("41{}", namespace_prefix(namespace)),
            Packet::Event {
                namespace,
                name,
                data,
            } => {
                let args = Value::Array(vec![Value::String(name.clone()), data.clone()]);
                format!(
                    "42{}{}",
                    namespace_prefix(namespace),
                    serde_json::to_string(&args)?
                )
            }
            Packet::Ack { namespace } => format!("43{}[]", namespace_prefix(namespace)),
            Packet::ConnectError { namespace, data } => format!(
                "44{}{}",
                namespace_prefix(namespace),
                serde_json::to_string(data)?
            ),
        };
        Ok(encoded)
    }

    pub fn decode(raw: &str) -> Result<Self, Error> {
        let mut chars = raw.chars();
        let engine_type = chars
            .next()
            .ok_or_else(|| Error::MalformedPacket(String::from("empty packet")))?;
        let rest = chars.as_str();

        match engine_type {
            '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_socket_packet(rest),
            '6' => Ok(Packet::Noop),
            other => Err(Error::MalformedPacket(format!(
                "unknown engine packet type {:?}",
                other
            ))),
        }
    }
}

// The default namespace is implicit on the wire, any other one is written
// as "/name," in front of the payload
fn namespace_prefix(namespace: &str) -> String {
    if namespace == DEFAULT_NAMESPACE {
        String::new()
    } else {
        format!("{},", namespace)
    }
}

fn decode_socket_packet(raw: &str) -> Result<Packet, Error> {
    let mut chars = raw.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| Error::MalformedPacket(String::from("empty socket.io packet")))?;
    let mut rest = chars.as_str();

    let mut namespace = String::from(DEFAULT_NAMESPACE);
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(end) => {
                namespace = rest[..end].to_string();
                rest = &rest[end + 1..];
            }
            None => {
                namespace = rest.to_string();
                rest = "";
            }
        }
    }

    // Optional ack id, we never request acks so it's only skipped
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    match socket_type {
        '0' => {
            let data = if rest.is_empty() {
                None
            } else {
                Some(serde_json::from_str(rest)?)
            };
            Ok(Packet::Connect { namespace, data })
        }
        '1' => Ok(Packet::Disconnect { namespace }),
        '2' => {
            let args: Value = serde_json::from_str(rest)?;
            let mut args = match args {
                Value::Array(args) => args.into_iter(),
                _ => {
                    return Err(Error::MalformedPacket(String::from(
                        "event arguments must be an array",
                    )))
                }
            };
            let name = match args.next() {
                Some(Value::String(name)) => name,
                _ => {
                    return Err(Error::MalformedPacket(String::from(
                        "event without a name",
                    )))
                }
            };
            let data = args.next().unwrap_or(Value::Null);
            Ok(Packet::Event {
                namespace,
                name,
                data,
            })
        }
        '3' => Ok(Packet::Ack { namespace }),
        '4' => {
            let data = if rest.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(rest)?
            };
            Ok(Packet::ConnectError { namespace, data })
        }
        other => Err(Error::MalformedPacket(format!(
            "unsupported socket.io packet type {:?}",
            other
        ))),
    }
}
