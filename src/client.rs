//! Connection orchestrator.
//!
//! [`Client`] owns the transport, gates connecting on authorization and pins
//! reconnects to the same server through the affinity cookie captured during
//! the transport upgrade.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::{auth_payload, AuthError, AuthorizationManager};
use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::protocol::{self, Ack, ChannelRequest, RequestError, EVENT_SUBSCRIBE};
use crate::transport::ws::WsTransport;
use crate::transport::{HeaderMetadata, ResponseHeaders, Transport, TransportError};

/// Cookie the server sets to identify the node holding the session.
pub const AFFINITY_COOKIE: &str = "server_id";

const SET_COOKIE: &str = "set-cookie";
const COOKIE: &str = "cookie";

/// Lifecycle events reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GlobalEvent {
    Connect,
    ConnectError,
    Disconnect,
    Disconnecting,
}

impl GlobalEvent {
    pub const ALL: [GlobalEvent; 4] = [
        GlobalEvent::Connect,
        GlobalEvent::ConnectError,
        GlobalEvent::Disconnect,
        GlobalEvent::Disconnecting,
    ];

    /// Transport event name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::ConnectError => "connect_error",
            Self::Disconnect => "disconnect",
            Self::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for GlobalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GlobalEvent {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| ClientError::InvalidEvent(s.to_string()))
    }
}

/// Entry point for talking to a realtime server.
///
/// With an API key the client connects as soon as it is built. With only an
/// authorizer it connects after [`Client::authorize`] succeeds.
pub struct Client {
    transport: Arc<dyn Transport>,
    auth: AuthorizationManager,
    affinity: Arc<Mutex<Option<String>>>,
}

impl Client {
    /// Builds a client on the default websocket transport.
    ///
    /// Must be called inside a Tokio runtime when an API key is configured.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = WsTransport::new(config.endpoint(), config.reconnect.clone());
        Self::with_transport(config, Arc::new(transport))
    }

    /// Builds a client on a caller-supplied transport.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        let auth = AuthorizationManager::new(&config)?;
        Self::from_parts(auth, transport)
    }

    /// Builds a client from an existing authorization manager.
    pub fn from_parts(
        auth: AuthorizationManager,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        let client = Self {
            transport,
            auth,
            affinity: Arc::new(Mutex::new(None)),
        };
        client.register_affinity_handler();

        if client.auth.is_authorized() {
            client.connect()?;
        }
        Ok(client)
    }

    /// Fetches a session token from the authorizer, then connects.
    pub async fn authorize(&self) -> Result<(), ClientError> {
        self.auth.authorize().await?;
        if self.auth.is_authorized() {
            self.connect()?;
        }
        Ok(())
    }

    /// Joins `channel` and returns its handle.
    ///
    /// Fails with [`ClientError::Unauthorized`] before touching the transport
    /// when no credential is available.
    pub async fn subscribe(&self, channel: &str) -> Result<Channel, ClientError> {
        if !self.auth.is_authorized() {
            return Err(ClientError::Unauthorized);
        }

        let payload = protocol::encode(&ChannelRequest {
            channel: channel.to_string(),
        })?;
        let ack: Ack = protocol::request(self.transport.as_ref(), EVENT_SUBSCRIBE, payload).await?;
        ack.into_result().map_err(|message| {
            warn!(event = "subscribe_rejected", channel, message = %message);
            ClientError::Subscription(message)
        })?;

        debug!(event = "subscribed", channel);
        Ok(Channel::new(Arc::clone(&self.transport), channel))
    }

    /// Registers `callback` for a transport lifecycle event.
    pub fn listen<F>(&self, event: GlobalEvent, callback: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.transport.on(event.as_str(), Arc::new(callback));
    }

    /// Like [`Self::listen`], with the event given by name.
    ///
    /// Unknown names register nothing.
    pub fn listen_named<F>(&self, event: &str, callback: F) -> Result<(), ClientError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let event = event.parse::<GlobalEvent>()?;
        self.listen(event, callback);
        Ok(())
    }

    /// Disconnects the transport if it is connected.
    pub fn close(&self) {
        if self.transport.is_connected() {
            debug!(event = "client_close");
            self.transport.disconnect();
        }
    }

    /// Returns true once an API key or fetched token is available.
    pub fn is_authorized(&self) -> bool {
        self.auth.is_authorized()
    }

    /// Returns whether the transport currently holds an accepted connection.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// The captured `server_id=<value>` pair, if the server sent one.
    pub fn affinity_cookie(&self) -> Option<String> {
        self.affinity.lock().ok().and_then(|slot| slot.clone())
    }

    /// Shared transport used by the client and every channel.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn connect(&self) -> Result<(), ClientError> {
        let token = self.auth.token()?;
        self.transport.set_auth(auth_payload(&token));
        self.transport.connect()?;
        Ok(())
    }

    fn register_affinity_handler(&self) {
        let transport: Weak<dyn Transport> = Arc::downgrade(&self.transport);
        let affinity = Arc::clone(&self.affinity);
        self.transport.on_poll_complete(Arc::new(move |headers: &ResponseHeaders| {
            let Some(transport) = transport.upgrade() else {
                return;
            };
            if let Some(cookie) = apply_affinity_cookie(transport.as_ref(), headers) {
                if let Ok(mut slot) = affinity.lock() {
                    *slot = Some(cookie);
                }
            }
        }));
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("auth", &self.auth)
            .field("connected", &self.is_connected())
            .field("affinity", &self.affinity_cookie())
            .finish()
    }
}

/// Copies the affinity cookie from `headers` into the transport's outgoing
/// `cookie` header.
///
/// Returns the `server_id=<value>` pair when one was found. Metadata is left
/// untouched otherwise.
fn apply_affinity_cookie(transport: &dyn Transport, headers: &ResponseHeaders) -> Option<String> {
    let cookie = headers
        .get_all(SET_COOKIE)?
        .iter()
        .find_map(|value| affinity_pair(value))?;

    let mut metadata: HeaderMetadata = transport.extra_headers().unwrap_or_default();
    metadata.insert(COOKIE.to_string(), cookie.clone());
    transport.set_extra_headers(metadata);
    debug!(event = "affinity_cookie_captured");
    Some(cookie)
}

fn affinity_pair(set_cookie: &str) -> Option<String> {
    let pair = set_cookie.split(';').next()?.trim();
    let (name, _) = pair.split_once('=')?;
    (name.trim() == AFFINITY_COOKIE).then(|| pair.to_string())
}

/// Errors produced by [`Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Please authorize client or provide API Key.")]
    Unauthorized,

    #[error("unsupported global event: {0}")]
    InvalidEvent(String),

    /// The server refused the subscription.
    #[error("{0}")]
    Subscription(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<RequestError> for ClientError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Transport(err) => Self::Transport(err),
            RequestError::Decode(message) => Self::Protocol(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use reqwest::StatusCode;
    use secrecy::SecretString;
    use serde_json::json;

    use super::{affinity_pair, Client, ClientError, GlobalEvent};
    use crate::auth::AuthError;
    use crate::config::{AuthorizerConfig, ClientConfig};
    use crate::testing::{local_authorizer, spawn_authorizer, MockTransport};
    use crate::transport::{ResponseHeaders, Transport};

    fn api_key_config() -> ClientConfig {
        ClientConfig::new().with_api_key(SecretString::new("key".to_string()))
    }

    fn authorizer_config() -> ClientConfig {
        ClientConfig::new().with_authorizer(AuthorizerConfig::new("localhost", "/auth"))
    }

    fn client(config: ClientConfig) -> (Arc<MockTransport>, Client) {
        let transport = Arc::new(MockTransport::new());
        let client = Client::with_transport(config, transport.clone()).expect("client");
        (transport, client)
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let transport = Arc::new(MockTransport::new());
        let err = Client::with_transport(ClientConfig::new(), transport).expect_err("config");
        assert_eq!(
            err.to_string(),
            "Please supply either API Key or Authorizer Config"
        );
    }

    #[test]
    fn api_key_client_connects_with_token_payload() {
        let (transport, client) = client(api_key_config());

        assert!(client.is_authorized());
        assert!(client.is_connected());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(transport.auth(), Some(json!({"token": "key"})));
    }

    #[test]
    fn authorizer_only_client_waits_for_authorize() {
        let (transport, client) = client(authorizer_config());

        assert!(!client.is_authorized());
        assert!(!client.is_connected());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
        assert_eq!(transport.auth(), None);
    }

    #[tokio::test]
    async fn subscribe_requires_authorization() {
        let (transport, client) = client(authorizer_config());

        let err = client.subscribe("lobby").await.expect_err("unauthorized");
        assert!(matches!(err, ClientError::Unauthorized));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn subscribe_returns_active_channel() {
        let (transport, client) = client(api_key_config());
        transport.reply_with(json!({"status": "ok"}));

        let channel = client.subscribe("lobby").await.expect("subscribe");

        assert_eq!(channel.name(), "lobby");
        assert!(channel.is_active());
        assert_eq!(
            transport.sent(),
            vec![("client:subscribe".to_string(), json!({"channel": "lobby"}))]
        );
    }

    #[tokio::test]
    async fn rejected_subscribe_surfaces_server_message() {
        let (transport, client) = client(api_key_config());
        transport.reply_with(json!({"status": "error", "message": "subscribe failed"}));

        let err = client.subscribe("lobby").await.expect_err("rejected");
        assert!(matches!(&err, ClientError::Subscription(message) if message == "subscribe failed"));
        assert_eq!(err.to_string(), "subscribe failed");
    }

    #[tokio::test]
    async fn malformed_subscribe_ack_is_protocol_error() {
        let (transport, client) = client(api_key_config());
        transport.reply_with(json!({"unexpected": true}));

        let err = client.subscribe("lobby").await.expect_err("malformed");
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn listen_registers_global_event() {
        let (transport, client) = client(api_key_config());
        let fired = Arc::new(AtomicUsize::new(0));
        client.listen(GlobalEvent::Disconnect, {
            let fired = Arc::clone(&fired);
            move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(transport.handler_names(), vec!["disconnect"]);
        transport.fire("disconnect", json!("transport close"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listen_named_accepts_every_global_event() {
        let (transport, client) = client(api_key_config());
        for name in ["connect", "connect_error", "disconnect", "disconnecting"] {
            client.listen_named(name, |_| {}).expect("known event");
        }
        assert_eq!(
            transport.handler_names(),
            vec!["connect", "connect_error", "disconnect", "disconnecting"]
        );
    }

    #[test]
    fn listen_named_rejects_unknown_event() {
        let (transport, client) = client(api_key_config());

        let err = client
            .listen_named("lobby:message", |_| {})
            .expect_err("unknown event");
        assert!(matches!(&err, ClientError::InvalidEvent(name) if name == "lobby:message"));
        assert!(transport.handler_names().is_empty());
    }

    #[test]
    fn global_event_names_round_trip() {
        for event in GlobalEvent::ALL {
            assert_eq!(event.as_str().parse::<GlobalEvent>().expect("parse"), event);
            assert_eq!(event.to_string(), event.as_str());
        }
    }

    #[test]
    fn close_disconnects_only_when_connected() {
        let (transport, client) = client(api_key_config());

        client.close();
        client.close();

        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert!(!client.is_connected());
    }

    #[test]
    fn close_without_connection_is_noop() {
        let (transport, client) = client(authorizer_config());
        client.close();
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn affinity_cookie_is_written_to_extra_headers() {
        let (transport, client) = client(api_key_config());
        let mut headers = ResponseHeaders::new();
        headers.append("set-cookie", "server_id=abcdef");

        transport.complete_poll(&headers);

        assert_eq!(
            transport.extra_headers(),
            Some(BTreeMap::from([(
                "cookie".to_string(),
                "server_id=abcdef".to_string()
            )]))
        );
        assert_eq!(client.affinity_cookie().as_deref(), Some("server_id=abcdef"));
    }

    #[test]
    fn affinity_cookie_merges_with_existing_headers() {
        let (transport, _client) = client(api_key_config());
        transport.set_extra_headers(BTreeMap::from([(
            "x-trace".to_string(),
            "1".to_string(),
        )]));
        let mut headers = ResponseHeaders::new();
        headers.append("Set-Cookie", "session=zzz; Path=/");
        headers.append("Set-Cookie", "server_id=node-7; Path=/; HttpOnly");

        transport.complete_poll(&headers);

        assert_eq!(
            transport.extra_headers(),
            Some(BTreeMap::from([
                ("cookie".to_string(), "server_id=node-7".to_string()),
                ("x-trace".to_string(), "1".to_string()),
            ]))
        );
    }

    #[test]
    fn missing_set_cookie_leaves_metadata_absent() {
        let (transport, client) = client(api_key_config());

        transport.complete_poll(&ResponseHeaders::new());

        assert_eq!(transport.extra_headers(), None);
        assert_eq!(client.affinity_cookie(), None);
    }

    #[test]
    fn unrelated_cookies_are_ignored() {
        let (transport, _client) = client(api_key_config());
        let mut headers = ResponseHeaders::new();
        headers.append("set-cookie", "server_id_old=1");
        headers.append("set-cookie", "other=server_id=2");

        transport.complete_poll(&headers);

        assert_eq!(transport.extra_headers(), None);
    }

    #[test]
    fn affinity_pair_takes_first_cookie_segment() {
        assert_eq!(
            affinity_pair(" server_id=abc ; Secure").as_deref(),
            Some("server_id=abc")
        );
        assert_eq!(affinity_pair("server_id"), None);
    }

    #[tokio::test]
    async fn authorize_without_authorizer_does_not_reconnect() {
        let (transport, client) = client(api_key_config());
        transport.disconnect();

        let err = client.authorize().await.expect_err("no authorizer");
        assert!(matches!(err, ClientError::Auth(_)));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authorize_attaches_fetched_token_and_connects() {
        let (addr, requests) = spawn_authorizer(StatusCode::OK, json!({"token": "abc"})).await;
        let (transport, client) =
            client(ClientConfig::new().with_authorizer(local_authorizer(addr, "/auth")));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);

        client.authorize().await.expect("authorize");

        assert!(client.is_authorized());
        assert!(client.is_connected());
        assert_eq!(transport.auth(), Some(json!({"token": "abc"})));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(requests.lock().expect("requests").len(), 1);
    }

    #[tokio::test]
    async fn failed_authorize_leaves_client_disconnected() {
        let (addr, _requests) =
            spawn_authorizer(StatusCode::BAD_REQUEST, json!({"message": "bad creds"})).await;
        let (transport, client) =
            client(ClientConfig::new().with_authorizer(local_authorizer(addr, "/auth")));

        let err = client.authorize().await.expect_err("400 response");

        assert!(matches!(
            err,
            ClientError::Auth(AuthError::AuthorizationFailed { status, .. })
                if status == StatusCode::BAD_REQUEST
        ));
        assert!(!client.is_authorized());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
        assert_eq!(transport.auth(), None);
    }
}
