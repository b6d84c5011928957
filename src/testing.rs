//! In-memory transport and mock authorizer used by unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::routing::any;
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;

use crate::config::AuthorizerConfig;

use crate::transport::{
    EventHandler, HeaderMetadata, PollHandler, ResponseHeaders, Transport, TransportError,
};

/// Records calls and replies to acks from a scripted queue.
#[derive(Default)]
pub(crate) struct MockTransport {
    pub sent: Mutex<Vec<(String, Value)>>,
    pub replies: Mutex<VecDeque<Value>>,
    pub handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
    pub poll_handlers: Mutex<Vec<PollHandler>>,
    pub auth: Mutex<Option<Value>>,
    pub extra_headers: Mutex<Option<HeaderMetadata>>,
    pub connected: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply_with(&self, reply: Value) {
        self.replies.lock().expect("replies").push_back(reply);
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().expect("sent").clone()
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.lock().expect("handlers").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn fire(&self, event: &str, payload: Value) {
        let handlers = self
            .handlers
            .lock()
            .expect("handlers")
            .get(event)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(payload.clone());
        }
    }

    pub fn complete_poll(&self, headers: &ResponseHeaders) {
        let handlers = self.poll_handlers.lock().expect("poll handlers").clone();
        for handler in handlers {
            handler(headers);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        self.sent
            .lock()
            .expect("sent")
            .push((event.to_string(), payload));
        Ok(())
    }

    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        self.emit(event, payload)?;
        self.replies
            .lock()
            .expect("replies")
            .pop_front()
            .ok_or(TransportError::Closed)
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.handlers
            .lock()
            .expect("handlers")
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn auth(&self) -> Option<Value> {
        self.auth.lock().expect("auth").clone()
    }

    fn set_auth(&self, auth: Value) {
        *self.auth.lock().expect("auth") = Some(auth);
    }

    fn extra_headers(&self) -> Option<HeaderMetadata> {
        self.extra_headers.lock().expect("extra headers").clone()
    }

    fn set_extra_headers(&self, headers: HeaderMetadata) {
        *self.extra_headers.lock().expect("extra headers") = Some(headers);
    }

    fn on_poll_complete(&self, handler: PollHandler) {
        self.poll_handlers.lock().expect("poll handlers").push(handler);
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Observed {
    pub method: String,
    pub uri: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Clone)]
struct MockAuthorizer {
    status: StatusCode,
    reply: Value,
    requests: Arc<Mutex<Vec<Observed>>>,
}

async fn authorize_handler(
    State(state): State<MockAuthorizer>,
    request: Request,
) -> (StatusCode, Json<Value>) {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("read request body");
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    state.requests.lock().expect("requests").push(Observed {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });
    (state.status, Json(state.reply.clone()))
}

/// Serves `reply` with `status` on every path and records each request.
pub(crate) async fn spawn_authorizer(
    status: StatusCode,
    reply: Value,
) -> (SocketAddr, Arc<Mutex<Vec<Observed>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/{*path}", any(authorize_handler))
        .route("/", any(authorize_handler))
        .with_state(MockAuthorizer {
            status,
            reply,
            requests: Arc::clone(&requests),
        });
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock authorizer");
    let addr = listener.local_addr().expect("mock authorizer address");
    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock authorizer should run");
    });
    (addr, requests)
}

pub(crate) fn local_authorizer(addr: SocketAddr, path: &str) -> AuthorizerConfig {
    AuthorizerConfig::new(addr.ip().to_string(), path)
        .with_scheme("http")
        .with_port(addr.port())
}
