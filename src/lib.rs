//! Channel-based publish/subscribe client SDK for Bagman realtime servers.
//!
//! The crate is organized around the connection lifecycle:
//! - `client`: connection orchestrator, subscriptions and lifecycle events.
//! - `channel`: per-channel publish, presence and unsubscribe.
//! - `auth`: API key and authorizer token handling.
//! - `config`: client and authorizer configuration.
//! - `transport`: transport capability and the default websocket transport.
//! - `protocol`: request/ack payload shapes.
//! - `backoff`: reconnect delay policy.

/// Authorization manager and authorizer token exchange.
pub mod auth;
/// Reconnect backoff policy used by the websocket transport.
pub mod backoff;
/// Channel handle returned by subscriptions.
pub mod channel;
/// Connection orchestrator.
pub mod client;
/// Client and authorizer configuration.
pub mod config;
/// Request/ack payload types and wire event names.
pub mod protocol;
/// Transport capability and websocket implementation.
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{AuthError, AuthorizationManager};
pub use backoff::ReconnectPolicy;
pub use channel::{Channel, ChannelError};
pub use client::{Client, ClientError, GlobalEvent, AFFINITY_COOKIE};
pub use config::{AuthorizerConfig, ClientConfig, Deferred};
pub use protocol::Presence;
pub use transport::ws::WsTransport;
pub use transport::{Transport, TransportError};
