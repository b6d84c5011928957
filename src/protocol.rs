//! Request/acknowledgement conventions shared by the client and channels.
//!
//! Every request is a transport ack exchange whose reply is an [`Ack`], except
//! presence fetches which may instead reply with the presence list.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::{Transport, TransportError};

pub const EVENT_SUBSCRIBE: &str = "client:subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "client:unsubscribe";
pub const EVENT_EMIT: &str = "client:emit";
pub const EVENT_PRESENCE_FETCH: &str = "presence:fetch";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmitRequest<D> {
    pub channel: String,
    pub event: String,
    pub data: D,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Reply to a request/ack exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: AckStatus::Ok,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            message: Some(message.into()),
        }
    }

    /// Converts the ack into `Ok(())` or the server's error message.
    pub fn into_result(self) -> Result<(), String> {
        match self.status {
            AckStatus::Ok => Ok(()),
            AckStatus::Error => Err(self.message.unwrap_or_default()),
        }
    }
}

/// One identity currently subscribed to a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Presence<T = Value> {
    pub id: String,
    pub user: T,
}

/// Reply to `presence:fetch`.
///
/// Any reply carrying `status` is a failure.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PresenceAck<T> {
    Failed(Ack),
    Presences { presences: Vec<Presence<T>> },
}

/// Failure of a single request/ack exchange.
#[derive(Debug)]
pub(crate) enum RequestError {
    Transport(TransportError),
    Decode(String),
}

/// Encodes a request payload.
pub(crate) fn encode<P>(payload: &P) -> Result<Value, RequestError>
where
    P: Serialize + ?Sized,
{
    serde_json::to_value(payload).map_err(|err| RequestError::Transport(TransportError::Json(err)))
}

/// Sends `payload` as `event` and decodes the ack reply.
pub(crate) async fn request<R>(
    transport: &dyn Transport,
    event: &str,
    payload: Value,
) -> Result<R, RequestError>
where
    R: DeserializeOwned,
{
    let reply = transport
        .emit_with_ack(event, payload)
        .await
        .map_err(RequestError::Transport)?;
    serde_json::from_value(reply)
        .map_err(|err| RequestError::Decode(format!("invalid {event} ack: {err}")))
}
