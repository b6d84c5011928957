//! Transport capability consumed by the client and channels.
//!
//! - `ws`: default websocket transport with a reconnecting background worker.
//! - `frame`: JSON frames exchanged by the websocket transport.
//!
//! Anything implementing [`Transport`] can back a [`crate::client::Client`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Websocket frame types.
pub mod frame;
/// Websocket transport implementation.
pub mod ws;

/// Callback invoked with the payload of an inbound event.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback invoked each time an upgrade/poll round trip completes.
pub type PollHandler = Arc<dyn Fn(&ResponseHeaders) + Send + Sync>;

/// Outgoing header metadata attached to connection attempts.
pub type HeaderMetadata = BTreeMap<String, String>;

/// Duplex event transport.
///
/// Correlating acknowledgements with their requests is the transport's job;
/// callers only see the reply payload.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends an event without waiting for a reply.
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Sends an event and resolves with the single reply payload.
    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, TransportError>;

    /// Registers a handler for an inbound event name.
    fn on(&self, event: &str, handler: EventHandler);

    /// Starts connecting. Calling this while already connecting is a no-op.
    fn connect(&self) -> Result<(), TransportError>;

    /// Tears down the connection.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Auth payload sent on the next connection attempt.
    fn auth(&self) -> Option<Value>;

    fn set_auth(&self, auth: Value);

    /// Extra headers sent on the next connection attempt.
    fn extra_headers(&self) -> Option<HeaderMetadata>;

    fn set_extra_headers(&self, headers: HeaderMetadata);

    /// Registers a handler for completed upgrade/poll round trips.
    fn on_poll_complete(&self, handler: PollHandler);
}

/// Raw response headers of the last upgrade/poll round trip.
///
/// Header names are matched case-insensitively.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    values: BTreeMap<String, Vec<String>>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value for `name`.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.values
            .entry(name.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Returns every value recorded for `name`, or `None` when absent.
    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.values
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
    }
}

impl From<&HeaderMap> for ResponseHeaders {
    fn from(map: &HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map {
            if let Ok(value) = value.to_str() {
                headers.append(name.as_str(), value);
            }
        }
        headers
    }
}

/// Errors produced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Extra header could not be converted to a valid HTTP header.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// `connect` was called outside a Tokio runtime.
    #[error("transport requires a running tokio runtime")]
    NoRuntime,

    /// The connection was closed before the operation completed.
    #[error("transport is closed")]
    Closed,

    /// Frame or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<InvalidHeaderValue> for TransportError {
    fn from(err: InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}
