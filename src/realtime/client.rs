//! Realtime websocket client and event fan-out.
//!
//! The client owns one logical connection driven by a background worker.
//! `connect()` is idempotent, subscribers register per-event handlers, and
//! outbound emits are queued through the worker. On disconnect the worker
//! retries with bounded backoff and then rests at `Disconnected` until an
//! explicit `connect()`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::backoff::ReconnectPolicy;
use crate::realtime::proto::EventEnvelope;

/// Production websocket endpoint for the telemetry stream.
pub const REALTIME_ENDPOINT: &str = "wss://rt.guardlink.io/v1/ws";
/// Local development websocket endpoint for the telemetry stream.
pub const LOCAL_REALTIME_ENDPOINT: &str = "ws://localhost:8082/v1/ws";

/// Lifecycle of the logical realtime connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Errors produced by the realtime client's public surface.
///
/// Transport faults never surface here; the worker folds them into its
/// reconnect loop.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The outbound event queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,
}

/// Construction options for [`RealtimeClient`].
#[derive(Clone, Debug, Default)]
pub struct RealtimeClientOptions {
    /// Routes the connection to the local development endpoint.
    pub local: bool,
    /// Explicit endpoint override.
    ///
    /// The override takes precedence over local mode when set.
    pub endpoint: Option<String>,
    /// Reconnect policy; defaults to [`ReconnectPolicy::bounded`].
    pub policy: Option<ReconnectPolicy>,
}

type EventHandler = Box<dyn Fn(&Value) + Send + Sync + 'static>;

/// Registry of per-event handlers, invoked in registration order.
#[derive(Clone, Default)]
struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Vec<EventHandler>>>>,
}

impl HandlerRegistry {
    fn register(&self, event: &str, handler: EventHandler) {
        if let Ok(mut map) = self.handlers.write() {
            map.entry(event.to_string()).or_default().push(handler);
        }
    }

    fn dispatch(&self, event: &str, data: &Value) {
        if let Ok(map) = self.handlers.read() {
            if let Some(list) = map.get(event) {
                for handler in list {
                    handler(data);
                }
            }
        }
    }
}

struct RealtimeInner {
    endpoint: String,
    policy: ReconnectPolicy,
    handlers: HandlerRegistry,
    outbound: Mutex<Option<mpsc::UnboundedSender<EventEnvelope>>>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Handle to the shared realtime connection.
///
/// Cloning is cheap; clones share the connection, the handler registry, and
/// the connection state.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<RealtimeInner>,
}

impl RealtimeClient {
    /// Creates a client against the production endpoint.
    pub fn new() -> Self {
        Self::with_options(RealtimeClientOptions::default())
    }

    /// Creates a client with explicit options.
    pub fn with_options(options: RealtimeClientOptions) -> Self {
        let endpoint = match options.endpoint {
            Some(endpoint) => endpoint.trim_end().to_string(),
            None if options.local => LOCAL_REALTIME_ENDPOINT.to_string(),
            None => REALTIME_ENDPOINT.to_string(),
        };
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(RealtimeInner {
                endpoint,
                policy: options.policy.unwrap_or_default(),
                handlers: HandlerRegistry::default(),
                outbound: Mutex::new(None),
                state_tx,
            }),
        }
    }

    /// Returns the endpoint the worker connects to.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribes to connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Opens the connection if it is not already open or opening.
    ///
    /// Calling this while connected or connecting is a no-op.
    pub fn connect(&self) {
        let Ok(mut guard) = self.inner.outbound.lock() else {
            return;
        };
        if let Some(tx) = guard.as_ref() {
            if !tx.is_closed() {
                return;
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        drop(guard);

        self.inner
            .state_tx
            .send_replace(ConnectionState::Connecting);
        // The worker only holds a weak reference so that dropping every
        // client handle closes the outbound channel and shuts it down.
        tokio::spawn(realtime_worker(
            self.inner.endpoint.clone(),
            self.inner.policy.clone(),
            self.inner.handlers.clone(),
            Arc::downgrade(&self.inner),
            rx,
        ));
    }

    /// Registers a handler for a named event.
    ///
    /// Multiple handlers per event are allowed; each received event invokes
    /// them all in registration order.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.handlers.register(event, Box::new(handler));
    }

    /// Queues an event for the backend, opening the connection first when
    /// disconnected.
    ///
    /// Best effort: an emit issued before the connection opens rides the
    /// pending queue, but is dropped if the worker exhausts its reconnect
    /// attempts.
    pub fn emit(&self, event: &str, data: Value) -> Result<(), RealtimeError> {
        self.connect();

        let Ok(guard) = self.inner.outbound.lock() else {
            return Err(RealtimeError::SendQueueClosed);
        };
        match guard.as_ref() {
            Some(tx) => tx
                .send(EventEnvelope::new(event, data))
                .map_err(|_| RealtimeError::SendQueueClosed),
            None => Err(RealtimeError::SendQueueClosed),
        }
    }
}

impl Default for RealtimeClient {
    fn default() -> Self {
        Self::new()
    }
}

enum SessionOutcome {
    GracefulShutdown,
    Reconnect,
}

async fn realtime_worker(
    endpoint: String,
    policy: ReconnectPolicy,
    handlers: HandlerRegistry,
    shared: Weak<RealtimeInner>,
    mut outbound_rx: mpsc::UnboundedReceiver<EventEnvelope>,
) {
    let mut pending: VecDeque<EventEnvelope> = VecDeque::new();
    let mut attempt = 0usize;

    loop {
        match connect_async(endpoint.as_str()).await {
            Ok((mut socket, _)) => {
                attempt = 0;
                set_state(&shared, ConnectionState::Connected);
                debug!(event = "realtime_connected");

                match run_connected_session(&mut socket, &handlers, &mut outbound_rx, &mut pending)
                    .await
                {
                    SessionOutcome::GracefulShutdown => {
                        finish(&shared);
                        return;
                    }
                    SessionOutcome::Reconnect => {
                        set_state(&shared, ConnectionState::Connecting);
                    }
                }
            }
            Err(err) => {
                warn!(event = "realtime_connect_failed", error = %err);
            }
        }

        attempt += 1;
        if attempt >= policy.max_attempts {
            warn!(event = "realtime_reconnect_exhausted", attempts = attempt);
            finish(&shared);
            return;
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "realtime_reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        if !collect_events_during_delay(delay, &mut outbound_rx, &mut pending).await {
            finish(&shared);
            return;
        }
    }
}

fn set_state(shared: &Weak<RealtimeInner>, state: ConnectionState) {
    if let Some(inner) = shared.upgrade() {
        inner.state_tx.send_replace(state);
    }
}

/// Rests the client at `Disconnected` so a later `connect()` starts fresh.
fn finish(shared: &Weak<RealtimeInner>) {
    let Some(inner) = shared.upgrade() else {
        return;
    };
    if let Ok(mut guard) = inner.outbound.lock() {
        *guard = None;
    }
    inner.state_tx.send_replace(ConnectionState::Disconnected);
}

async fn run_connected_session<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    handlers: &HandlerRegistry,
    outbound_rx: &mut mpsc::UnboundedReceiver<EventEnvelope>,
    pending: &mut VecDeque<EventEnvelope>,
) -> SessionOutcome
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError>
        + Stream<Item = Result<Message, WsError>>
        + Unpin,
{
    while let Some(next) = pending.pop_front() {
        if send_envelope(socket, &next).await.is_err() {
            pending.push_front(next);
            return SessionOutcome::Reconnect;
        }
    }

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(envelope) => {
                        if send_envelope(socket, &envelope).await.is_err() {
                            pending.push_front(envelope);
                            return SessionOutcome::Reconnect;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return SessionOutcome::GracefulShutdown;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        match EventEnvelope::from_text(&text) {
                            Ok(envelope) => handlers.dispatch(&envelope.event, &envelope.data),
                            // Malformed frames are dropped, not fatal.
                            Err(err) => warn!(event = "realtime_frame_dropped", error = %err),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return SessionOutcome::Reconnect;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(_)) | Some(Err(_)) | None => return SessionOutcome::Reconnect,
                }
            }
        }
    }
}

async fn send_envelope<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    envelope: &EventEnvelope,
) -> Result<(), WsError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    match envelope.to_text() {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(err) => {
            warn!(event = "realtime_emit_unencodable", error = %err);
            Ok(())
        }
    }
}

async fn collect_events_during_delay(
    delay: Duration,
    outbound_rx: &mut mpsc::UnboundedReceiver<EventEnvelope>,
    pending: &mut VecDeque<EventEnvelope>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_envelope = outbound_rx.recv() => {
                match maybe_envelope {
                    Some(envelope) => pending.push_back(envelope),
                    None => return false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{
        ConnectionState, HandlerRegistry, RealtimeClient, RealtimeClientOptions,
        LOCAL_REALTIME_ENDPOINT, REALTIME_ENDPOINT,
    };

    #[test]
    fn realtime_client_uses_production_endpoint_by_default() {
        let client = RealtimeClient::new();
        assert_eq!(client.endpoint(), REALTIME_ENDPOINT);
    }

    #[test]
    fn realtime_client_uses_local_endpoint_when_enabled() {
        let client = RealtimeClient::with_options(RealtimeClientOptions {
            local: true,
            ..RealtimeClientOptions::default()
        });
        assert_eq!(client.endpoint(), LOCAL_REALTIME_ENDPOINT);
    }

    #[test]
    fn realtime_client_endpoint_override_takes_precedence() {
        let client = RealtimeClient::with_options(RealtimeClientOptions {
            local: true,
            endpoint: Some("ws://rt-dev.example/ws   \n".to_string()),
            ..RealtimeClientOptions::default()
        });
        assert_eq!(client.endpoint(), "ws://rt-dev.example/ws");
    }

    #[test]
    fn new_client_starts_disconnected() {
        let client = RealtimeClient::new();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let registry = HandlerRegistry::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.register(
                "status",
                Box::new(move |_| order.lock().expect("lock").push(tag)),
            );
        }
        registry.register("other", Box::new(|_| panic!("wrong event")));

        registry.dispatch("status", &json!({}));
        assert_eq!(
            *order.lock().expect("lock"),
            vec!["first", "second", "third"]
        );
    }
}
