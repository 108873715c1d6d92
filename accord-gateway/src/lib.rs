//! # accord-gateway
//!
//! Durable session manager for the Discord real-time gateway, protocol
//! version 6.
//!
//! A [`GatewayClient`] opens a websocket to the gateway, authenticates a
//! session, keeps it alive with heartbeats, decodes the inbound event
//! stream and routes dispatched events to registered handlers. Outbound
//! traffic is drained from three prioritised queues under the gateway's
//! rate limit, with lifecycle payloads drawing from a reserved slice of
//! the budget. Dropped connections are recovered by resuming where
//! possible and by re-identifying through the session arbiter otherwise.
//!
//! What this crate deliberately does not do: decode event-specific
//! entities (see [`registry::EventHandler`]), perform REST calls, own
//! entity caches, or carry the UDP audio transport. Those live behind
//! narrow traits so the session engine stays self-contained.

#![deny(unsafe_code)]

pub mod close_code;
pub mod compression;
pub mod config;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod payload;
pub mod registry;
pub mod stage;
pub mod voice;

mod client;
mod emitter;
mod listener;
mod processor;
mod ratelimiter;
mod sender;
mod session;
mod socket_forwarder;

pub use self::{
    client::GatewayClient,
    config::{Config, ConfigBuilder, ShardId},
    event::{Event, EventTypeFlags},
    listener::Listeners,
    ratelimiter::CommandRatelimiter,
    stage::Stage,
};
pub use accord_gateway_queue::{
    ConnectNode, InstantArbiter, LocalArbiter, NodeKind, SessionArbiter,
};

use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Gateway protocol version the crate speaks.
pub const API_VERSION: u64 = 6;

/// Default URL of the gateway.
pub const GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Websocket connection to the gateway.
pub type Connection = WebSocketStream<MaybeTlsStream<TcpStream>>;
