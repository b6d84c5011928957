//! Per-channel handle returned by [`crate::client::Client::subscribe`].
//!
//! A channel starts active and becomes deactivated the moment
//! [`Channel::unsubscribe`] is called. Deactivation is permanent, even when
//! the server rejects the unsubscribe.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{
    self, Ack, ChannelRequest, EmitRequest, Presence, PresenceAck, RequestError, EVENT_EMIT,
    EVENT_PRESENCE_FETCH, EVENT_UNSUBSCRIBE,
};
use crate::transport::{Transport, TransportError};

/// Handle for one channel subscription.
///
/// Clones share the same subscription state. The transport is shared with the
/// client and every other channel; a channel never closes it.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    transport: Arc<dyn Transport>,
    active: AtomicBool,
}

impl Channel {
    pub(crate) fn new(transport: Arc<dyn Transport>, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                transport,
                active: AtomicBool::new(true),
            }),
        }
    }

    /// Channel name as passed to [`crate::client::Client::subscribe`].
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns false once [`Self::unsubscribe`] has been called.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Registers `callback` for `event` on this channel.
    ///
    /// The transport event name is `"{channel}:{event}"`.
    pub fn listen<F>(&self, event: &str, callback: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner
            .transport
            .on(&self.event_name(event), Arc::new(callback));
    }

    /// Publishes `data` as `event` to every subscriber of this channel.
    pub async fn publish<D>(&self, event: &str, data: D) -> Result<(), ChannelError>
    where
        D: Serialize,
    {
        if !self.is_active() {
            return Err(ChannelError::Deactivated);
        }

        let payload = protocol::encode(&EmitRequest {
            channel: self.inner.name.clone(),
            event: event.to_string(),
            data,
        })?;
        let ack: Ack = self.request(EVENT_EMIT, payload).await?;
        ack.into_result().map_err(ChannelError::Publish)
    }

    /// Leaves the channel.
    ///
    /// The handle is deactivated before the server replies and stays
    /// deactivated if the server reports an error.
    pub async fn unsubscribe(&self) -> Result<(), ChannelError> {
        self.inner.active.store(false, Ordering::SeqCst);
        debug!(event = "channel_unsubscribe", channel = %self.inner.name);

        let ack: Ack = self
            .request(EVENT_UNSUBSCRIBE, self.channel_request()?)
            .await?;
        ack.into_result().map_err(ChannelError::Unsubscribe)
    }

    /// Fetches identities currently subscribed to this channel.
    ///
    /// Order is whatever the server sends.
    pub async fn presences<T>(&self) -> Result<Vec<Presence<T>>, ChannelError>
    where
        T: DeserializeOwned,
    {
        let reply: PresenceAck<T> = self
            .request(EVENT_PRESENCE_FETCH, self.channel_request()?)
            .await?;
        match reply {
            PresenceAck::Presences { presences } => Ok(presences),
            PresenceAck::Failed(ack) => Err(ChannelError::PresenceFetch(
                ack.message
                    .unwrap_or_else(|| "presence fetch failed".to_string()),
            )),
        }
    }

    fn event_name(&self, event: &str) -> String {
        format!("{}:{}", self.inner.name, event)
    }

    fn channel_request(&self) -> Result<Value, ChannelError> {
        let payload = protocol::encode(&ChannelRequest {
            channel: self.inner.name.clone(),
        })?;
        Ok(payload)
    }

    async fn request<R>(&self, event: &str, payload: Value) -> Result<R, ChannelError>
    where
        R: DeserializeOwned,
    {
        protocol::request(self.inner.transport.as_ref(), event, payload)
            .await
            .map_err(ChannelError::from)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Errors produced by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel was unsubscribed; nothing was sent.
    #[error("channel is deactivated")]
    Deactivated,

    #[error("{0}")]
    Publish(String),

    #[error("{0}")]
    Unsubscribe(String),

    #[error("{0}")]
    PresenceFetch(String),

    /// The reply did not match the expected ack shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<RequestError> for ChannelError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Transport(err) => Self::Transport(err),
            RequestError::Decode(message) => Self::Protocol(message),
        }
    }
}
