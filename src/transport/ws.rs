//! Websocket transport with a reconnecting background worker.
//!
//! A worker task owns the socket. Frames emitted while the worker is
//! handshaking or waiting out a reconnect delay are queued and flushed in
//! order once the server accepts the connection.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::backoff::ReconnectPolicy;
use crate::transport::frame::{ClientFrame, ServerFrame};
use crate::transport::{
    EventHandler, HeaderMetadata, PollHandler, ResponseHeaders, Transport, TransportError,
};

const EVENT_CONNECT: &str = "connect";
const EVENT_CONNECT_ERROR: &str = "connect_error";
const EVENT_DISCONNECT: &str = "disconnect";
const EVENT_DISCONNECTING: &str = "disconnecting";

/// Websocket-backed [`Transport`].
pub struct WsTransport {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    policy: ReconnectPolicy,
    auth: RwLock<Option<Value>>,
    extra_headers: RwLock<Option<HeaderMetadata>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    poll_handlers: RwLock<Vec<PollHandler>>,
    connected: AtomicBool,
    next_ack: AtomicU64,
    acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    worker: Mutex<WorkerSlot>,
}

#[derive(Default)]
struct WorkerSlot {
    tx: Option<mpsc::UnboundedSender<ClientFrame>>,
    queued: VecDeque<ClientFrame>,
}

impl WsTransport {
    /// Creates a disconnected transport for `endpoint`.
    ///
    /// `http://` and `https://` endpoints are mapped to `ws://` and `wss://`.
    pub fn new(endpoint: impl AsRef<str>, policy: ReconnectPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: websocket_url(endpoint.as_ref()),
                policy,
                auth: RwLock::new(None),
                extra_headers: RwLock::new(None),
                handlers: RwLock::new(HashMap::new()),
                poll_handlers: RwLock::new(Vec::new()),
                connected: AtomicBool::new(false),
                next_ack: AtomicU64::new(0),
                acks: Mutex::new(HashMap::new()),
                worker: Mutex::new(WorkerSlot::default()),
            }),
        }
    }

    /// Websocket URL used for connection attempts.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    fn shutdown(&self) {
        if let Ok(mut slot) = self.shared.worker.lock() {
            slot.tx = None;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.fail_pending_acks();
    }
}

impl fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.shared.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        self.shared.send_frame(ClientFrame::Event {
            event: event.to_string(),
            data: payload,
            ack: None,
        })
    }

    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        let id = self.shared.next_ack.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .acks
            .lock()
            .map_err(|_| TransportError::Closed)?
            .insert(id, reply_tx);

        if let Err(err) = self.shared.send_frame(ClientFrame::Event {
            event: event.to_string(),
            data: payload,
            ack: Some(id),
        }) {
            self.shared.take_ack(id);
            return Err(err);
        }

        reply_rx.await.map_err(|_| TransportError::Closed)
    }

    fn on(&self, event: &str, handler: EventHandler) {
        if let Ok(mut handlers) = self.shared.handlers.write() {
            handlers.entry(event.to_string()).or_default().push(handler);
        }
    }

    fn connect(&self) -> Result<(), TransportError> {
        let mut slot = self
            .shared
            .worker
            .lock()
            .map_err(|_| TransportError::Closed)?;
        if slot.tx.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        while let Some(frame) = slot.queued.pop_front() {
            let _ = outbound_tx.send(frame);
        }
        slot.tx = Some(outbound_tx);
        drop(slot);

        debug!(event = "ws_connect_requested", url = %self.shared.url);
        let shared = Arc::clone(&self.shared);
        runtime.spawn(connection_worker(shared, outbound_rx));
        Ok(())
    }

    fn disconnect(&self) {
        let connected = self.is_connected();
        if connected {
            self.shared
                .dispatch(EVENT_DISCONNECTING, Value::from("io client disconnect"));
        }
        self.shutdown();
        if connected {
            self.shared
                .dispatch(EVENT_DISCONNECT, Value::from("io client disconnect"));
        }
        debug!(event = "ws_disconnected", url = %self.shared.url);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn auth(&self) -> Option<Value> {
        self.shared.auth.read().ok().and_then(|auth| auth.clone())
    }

    fn set_auth(&self, auth: Value) {
        if let Ok(mut slot) = self.shared.auth.write() {
            *slot = Some(auth);
        }
    }

    fn extra_headers(&self) -> Option<HeaderMetadata> {
        self.shared.extra_headers()
    }

    fn set_extra_headers(&self, headers: HeaderMetadata) {
        if let Ok(mut slot) = self.shared.extra_headers.write() {
            *slot = Some(headers);
        }
    }

    fn on_poll_complete(&self, handler: PollHandler) {
        if let Ok(mut handlers) = self.shared.poll_handlers.write() {
            handlers.push(handler);
        }
    }
}

impl Shared {
    fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let mut slot = self.worker.lock().map_err(|_| TransportError::Closed)?;
        let frame = match slot.tx.as_ref() {
            Some(tx) => match tx.send(frame) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        slot.queued.push_back(frame);
        Ok(())
    }

    fn requeue(&self, frames: VecDeque<ClientFrame>) {
        if let Ok(mut slot) = self.worker.lock() {
            for frame in frames.into_iter().rev() {
                slot.queued.push_front(frame);
            }
        }
    }

    fn extra_headers(&self) -> Option<HeaderMetadata> {
        self.extra_headers
            .read()
            .ok()
            .and_then(|headers| headers.clone())
    }

    fn dispatch(&self, event: &str, payload: Value) {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers.get(event).cloned().unwrap_or_default(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(payload.clone());
        }
    }

    fn notify_poll_complete(&self, headers: &ResponseHeaders) {
        let handlers = match self.poll_handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(headers);
        }
    }

    fn take_ack(&self, id: u64) -> Option<oneshot::Sender<Value>> {
        self.acks.lock().ok().and_then(|mut acks| acks.remove(&id))
    }

    fn fail_pending_acks(&self) {
        if let Ok(mut acks) = self.acks.lock() {
            acks.clear();
        }
    }

    fn mark_lost(&self, reason: &str) -> SessionOutcome {
        self.connected.store(false, Ordering::SeqCst);
        debug!(event = "ws_connection_lost", reason);
        self.dispatch(EVENT_DISCONNECT, Value::from(reason));
        SessionOutcome::Reconnect
    }
}

enum SessionOutcome {
    GracefulShutdown,
    Rejected,
    Reconnect,
}

async fn connection_worker(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
) {
    let mut pending = VecDeque::new();
    let mut failures = 0usize;

    loop {
        match run_connected_session(&shared, &mut outbound_rx, &mut pending, &mut failures).await {
            Ok(SessionOutcome::GracefulShutdown) => return,
            Ok(SessionOutcome::Rejected) => break,
            Ok(SessionOutcome::Reconnect) => {
                // A dropped session counts toward the attempt limit.
                if !shared.policy.allows_attempt(failures + 1) {
                    warn!(event = "ws_reconnect_disabled");
                    break;
                }
            }
            Err(err) => {
                failures += 1;
                warn!(event = "ws_connect_failed", failures, error = %err);
                shared.dispatch(EVENT_CONNECT_ERROR, Value::from(err.to_string()));
            }
        }

        if outbound_rx.is_closed() {
            return;
        }

        if !shared.policy.allows_attempt(failures) {
            warn!(event = "ws_reconnect_exhausted", failures);
            break;
        }

        let delay = shared.policy.delay_for_attempt(failures.max(1));
        if !collect_frames_during_delay(delay, &mut outbound_rx, &mut pending).await {
            return;
        }
    }

    outbound_rx.close();
    while let Ok(frame) = outbound_rx.try_recv() {
        pending.push_back(frame);
    }
    shared.requeue(pending);
}

async fn run_connected_session(
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    pending: &mut VecDeque<ClientFrame>,
    failures: &mut usize,
) -> Result<SessionOutcome, TransportError> {
    let mut request = shared.url.as_str().into_client_request()?;
    if let Some(headers) = shared.extra_headers() {
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| TransportError::InvalidHeader(err.to_string()))?;
            let value: HeaderValue = value.parse()?;
            request.headers_mut().insert(name, value);
        }
    }

    let (mut socket, response) = connect_async(request).await?;
    shared.notify_poll_complete(&ResponseHeaders::from(response.headers()));

    let auth = shared.auth.read().ok().and_then(|auth| auth.clone());
    send_client_frame(&mut socket, &ClientFrame::Connect { auth }).await?;

    match recv_handshake_frame(&mut socket).await? {
        ServerFrame::ConnectOk { sid } => {
            debug!(event = "ws_connected", sid = %sid);
        }
        ServerFrame::ConnectError { message } => {
            warn!(event = "ws_connect_rejected", message = %message);
            let _ = socket.close(None).await;
            shared.dispatch(EVENT_CONNECT_ERROR, Value::from(message));
            return Ok(SessionOutcome::Rejected);
        }
        other => {
            return Err(TransportError::Protocol(format!(
                "expected connect_ok, got {other:?}"
            )));
        }
    }

    if outbound_rx.is_closed() {
        let _ = socket.close(None).await;
        return Ok(SessionOutcome::GracefulShutdown);
    }

    *failures = 0;
    shared.connected.store(true, Ordering::SeqCst);
    shared.dispatch(EVENT_CONNECT, Value::Null);

    while let Some(next) = pending.pop_front() {
        if send_client_frame(&mut socket, &next).await.is_err() {
            pending.push_front(next);
            return Ok(shared.mark_lost("transport error"));
        }
    }

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if send_client_frame(&mut socket, &frame).await.is_err() {
                            pending.push_front(frame);
                            return Ok(shared.mark_lost("transport error"));
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return Ok(SessionOutcome::GracefulShutdown);
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match ServerFrame::from_text(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(event = "ws_frame_decode_failed", error = %err);
                                return Ok(shared.mark_lost("parse error"));
                            }
                        };
                        if let Some(reply) = handle_server_frame(shared, frame) {
                            if send_client_frame(&mut socket, &reply).await.is_err() {
                                return Ok(shared.mark_lost("transport error"));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return Ok(shared.mark_lost("transport error"));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return Ok(shared.mark_lost("transport close")),
                    Some(Ok(_)) => return Ok(shared.mark_lost("parse error")),
                    Some(Err(_)) => return Ok(shared.mark_lost("transport error")),
                    None => return Ok(shared.mark_lost("transport close")),
                }
            }
        }
    }
}

fn handle_server_frame(shared: &Shared, frame: ServerFrame) -> Option<ClientFrame> {
    match frame {
        ServerFrame::Event { event, data, ack } => {
            shared.dispatch(&event, data);
            ack.map(|ack| ClientFrame::Ack {
                ack,
                data: Value::Null,
            })
        }
        ServerFrame::Ack { ack, data } => {
            match shared.take_ack(ack) {
                Some(reply) => {
                    let _ = reply.send(data);
                }
                None => debug!(event = "ws_unknown_ack", ack),
            }
            None
        }
        other => {
            debug!(event = "ws_unexpected_frame", frame = ?other);
            None
        }
    }
}

async fn recv_handshake_frame<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
) -> Result<ServerFrame, TransportError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError>
        + Stream<Item = Result<Message, WsError>>
        + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(ServerFrame::from_text(&text)?),
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(TransportError::Protocol(
                    "socket closed before connect_ok".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(TransportError::Protocol(
                    "received non-text frame before connect_ok".to_string(),
                ));
            }
            Some(Err(err)) => return Err(TransportError::WebSocket(err)),
            None => {
                return Err(TransportError::Protocol(
                    "socket ended before connect_ok".to_string(),
                ));
            }
        }
    }
}

async fn send_client_frame<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    frame: &ClientFrame,
) -> Result<(), TransportError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = frame.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn collect_frames_during_delay(
    delay: Duration,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    pending: &mut VecDeque<ClientFrame>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_frame = outbound_rx.recv() => {
                match maybe_frame {
                    Some(frame) => pending.push_back(frame),
                    None => return false,
                }
            }
        }
    }
}

fn websocket_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end();
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_string()
    }
}
