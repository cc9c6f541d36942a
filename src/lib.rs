//! Load generator for real-time chat services.
//!
//! Many virtual clients connect to the service concurrently, join one
//! conversation, send a burst of messages and wait for them to come back. Every
//! outgoing message id is correlated with its receipt to measure the round-trip
//! latency, and all clients feed one shared [`aggregator::Aggregator`] that
//! the resource sampler, the live monitor and the final report read from.
//!
//! The transport is a small async websocket client built on tokio, following
//! [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455), with the Engine.IO /
//! Socket.IO packet codec on top of it. Clients only see the
//! [`channel::EventChannel`] abstraction, so any other transport can be plugged in
//! through the [`channel::Connector`] trait.
//!
pub mod aggregator;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod credentials;
pub mod error;
mod frame;
pub mod handshake;
pub mod lookup;
pub mod message;
pub mod monitor;
pub mod orchestrator;
pub mod protocol;
mod read;
pub mod report;
mod request;
pub mod sampler;
pub mod stream;
mod utils;
mod write;
