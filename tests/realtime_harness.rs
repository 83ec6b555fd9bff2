use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use guardlink_sdk::backoff::ReconnectPolicy;
use guardlink_sdk::realtime::client::{ConnectionState, RealtimeClient, RealtimeClientOptions};
use guardlink_sdk::realtime::proto::EventEnvelope;
use guardlink_sdk::realtime::telemetry::{TelemetrySnapshot, TelemetryStore};
use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

/// Scripted websocket backend: each accepted connection runs the next
/// script entry; the final entry repeats.
struct WsBackend {
    scripts: Vec<ConnectionScript>,
    connection_count: AtomicUsize,
    observed_tx: Mutex<Option<oneshot::Sender<EventEnvelope>>>,
}

#[derive(Clone)]
enum ConnectionScript {
    /// Push these raw text frames, then hold the socket open.
    Push(Vec<String>),
    /// Push these frames, then close the socket.
    PushAndClose(Vec<String>),
    /// Wait for one inbound envelope and report it, then hold open.
    Observe,
}

impl WsBackend {
    fn pushing(frames: Vec<String>) -> Arc<Self> {
        Self::scripted(vec![ConnectionScript::Push(frames)])
    }

    fn scripted(scripts: Vec<ConnectionScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts,
            connection_count: AtomicUsize::new(0),
            observed_tx: Mutex::new(None),
        })
    }
}

fn envelope(event: &str, data: serde_json::Value) -> String {
    EventEnvelope::new(event, data).to_text().expect("encode")
}

async fn ws_handler(State(backend): State<Arc<WsBackend>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let index = backend.connection_count.fetch_add(1, Ordering::SeqCst);
    let script = backend
        .scripts
        .get(index)
        .or_else(|| backend.scripts.last())
        .cloned()
        .expect("script");
    ws.on_upgrade(move |socket| run_script(socket, script, backend))
}

async fn run_script(mut socket: WebSocket, script: ConnectionScript, backend: Arc<WsBackend>) {
    match script {
        ConnectionScript::Push(frames) => {
            for frame in frames {
                if socket.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            hold_open(socket).await;
        }
        ConnectionScript::PushAndClose(frames) => {
            for frame in frames {
                if socket.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            let _ = socket.send(Message::Close(None)).await;
        }
        ConnectionScript::Observe => {
            while let Some(Ok(message)) = socket.recv().await {
                if let Message::Text(text) = message {
                    let decoded = EventEnvelope::from_text(&text).expect("decode client envelope");
                    if let Some(tx) = backend.observed_tx.lock().await.take() {
                        let _ = tx.send(decoded);
                    }
                    break;
                }
            }
            hold_open(socket).await;
        }
    }
}

async fn hold_open(mut socket: WebSocket) {
    // Drain frames until the peer goes away.
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_ws_server(
    backend: Arc<WsBackend>,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock ws listener");
    let addr = listener.local_addr().expect("read mock ws listener address");
    let (shutdown_tx, task) = spawn_ws_server_on(listener, backend);
    (addr, shutdown_tx, task)
}

fn spawn_ws_server_on(
    listener: tokio::net::TcpListener,
    backend: Arc<WsBackend>,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/v1/ws", get(ws_handler))
        .with_state(backend);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock ws server should run");
    });
    (shutdown_tx, task)
}

fn client_for(addr: SocketAddr) -> RealtimeClient {
    RealtimeClient::with_options(RealtimeClientOptions {
        endpoint: Some(format!("ws://{addr}/v1/ws")),
        policy: Some(ReconnectPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            jitter: Duration::ZERO,
        }),
        ..RealtimeClientOptions::default()
    })
}

async fn wait_for_snapshot<F>(store: &TelemetryStore, predicate: F) -> TelemetrySnapshot
where
    F: Fn(&TelemetrySnapshot) -> bool,
{
    let mut rx = store.subscribe();
    let snapshot = timeout(Duration::from_secs(5), rx.wait_for(|snapshot| predicate(snapshot)))
        .await
        .expect("timed out waiting for telemetry snapshot")
        .expect("telemetry store dropped")
        .clone();
    snapshot
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_then_location_events_build_the_snapshot() {
    let backend = WsBackend::pushing(vec![
        envelope("status", json!({"status": "offline", "emergency": true})),
        envelope("location", json!({"lat": 14.7, "lng": 121.05})),
    ]);
    let (addr, shutdown_tx, server_task) = spawn_ws_server(Arc::clone(&backend)).await;

    let client = client_for(addr);
    let store = TelemetryStore::new();
    store.bind(&client);
    client.connect();

    let snapshot = wait_for_snapshot(&store, |snapshot| snapshot.device_location.is_some()).await;
    assert!(!snapshot.device_online);
    assert!(snapshot.emergency);
    let location = snapshot.device_location.expect("device location");
    assert_eq!(location.lat, 14.7);
    assert_eq!(location.lng, 121.05);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_location_event_is_dropped_and_the_stream_continues() {
    let backend = WsBackend::pushing(vec![
        envelope("location", json!({"lat": "x", "lng": 14.7})),
        envelope("status", json!({"status": "online"})),
    ]);
    let (addr, shutdown_tx, server_task) = spawn_ws_server(Arc::clone(&backend)).await;

    let client = client_for(addr);
    let store = TelemetryStore::new();
    store.bind(&client);
    client.connect();

    let snapshot = wait_for_snapshot(&store, |snapshot| snapshot.device_online).await;
    assert_eq!(
        snapshot.device_location, None,
        "malformed location must leave the snapshot unchanged"
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnects_after_the_server_drops_the_connection() {
    let backend = WsBackend::scripted(vec![
        ConnectionScript::PushAndClose(vec![envelope(
            "status",
            json!({"status": "online", "emergency": false}),
        )]),
        ConnectionScript::Push(vec![envelope(
            "status",
            json!({"status": "online", "emergency": true}),
        )]),
    ]);
    let (addr, shutdown_tx, server_task) = spawn_ws_server(Arc::clone(&backend)).await;

    let client = client_for(addr);
    let store = TelemetryStore::new();
    store.bind(&client);
    client.connect();

    let snapshot = wait_for_snapshot(&store, |snapshot| snapshot.emergency).await;
    assert!(snapshot.device_online);
    assert!(
        backend.connection_count.load(Ordering::SeqCst) >= 2,
        "the emergency update only exists on the second connection"
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_rests_disconnected_after_exhausting_reconnect_attempts() {
    // Reserve a port with nothing listening behind it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("reserve port");
    let addr = listener.local_addr().expect("read reserved address");
    drop(listener);

    let client = RealtimeClient::with_options(RealtimeClientOptions {
        endpoint: Some(format!("ws://{addr}/v1/ws")),
        policy: Some(ReconnectPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            jitter: Duration::ZERO,
        }),
        ..RealtimeClientOptions::default()
    });
    let mut state = client.subscribe_state();

    client.connect();
    assert_eq!(client.state(), ConnectionState::Connecting);
    timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == ConnectionState::Disconnected),
    )
    .await
    .expect("worker should give up after its bounded attempts")
    .expect("client alive");

    // The backend coming up on its own must not revive the worker.
    let backend = WsBackend::pushing(vec![envelope("status", json!({"status": "online"}))]);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("rebind reserved port");
    let (shutdown_tx, server_task) = spawn_ws_server_on(listener, Arc::clone(&backend));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        backend.connection_count.load(Ordering::SeqCst),
        0,
        "a resting client must not dial on its own"
    );

    // An explicit connect() starts a fresh worker.
    let store = TelemetryStore::new();
    store.bind(&client);
    client.connect();
    let snapshot = wait_for_snapshot(&store, |snapshot| snapshot.device_online).await;
    assert!(snapshot.device_online);
    assert_eq!(backend.connection_count.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emit_opens_the_connection_and_reaches_the_server() {
    let backend = WsBackend::scripted(vec![ConnectionScript::Observe]);
    let (observed_tx, observed_rx) = oneshot::channel();
    *backend.observed_tx.lock().await = Some(observed_tx);
    let (addr, shutdown_tx, server_task) = spawn_ws_server(Arc::clone(&backend)).await;

    let client = client_for(addr);
    // connect() is idempotent; a second call must not open a second socket.
    client.connect();
    client.connect();
    client
        .emit("guardian_location", json!({"lat": 51.5, "lng": -0.12}))
        .expect("emit");

    let observed = timeout(Duration::from_secs(5), observed_rx)
        .await
        .expect("timed out waiting for emitted event")
        .expect("observation channel closed");
    assert_eq!(observed.event, "guardian_location");
    assert_eq!(observed.data, json!({"lat": 51.5, "lng": -0.12}));

    assert_eq!(
        backend.connection_count.load(Ordering::SeqCst),
        1,
        "repeated connect() must reuse the existing connection"
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}
