//! Authenticated HTTP session client.
//!
//! The client attaches the server-issued session cookie to every request and
//! survives one-time credential expiry transparently: the first 401 triggers
//! exactly one refresh call, calls failing while that refresh is in flight
//! wait in a FIFO queue, and every affected call is replayed at most once,
//! in the order it joined the queue.
//! An unrecoverable refresh failure ends the session and raises a one-shot
//! "session ended" signal for the routing collaborator.

use std::collections::VecDeque;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Production base URL for the GuardLink API.
pub const API_BASE_URL: &str = "https://api.guardlink.io";
/// Local development base URL for the GuardLink API.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8080";

const LOGIN_PATH: &str = "/v1/auth/login";
const LOGOUT_PATH: &str = "/v1/auth/logout";
const REFRESH_PATH: &str = "/v1/auth/refresh";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
}

/// Construction options for [`SessionClient`].
#[derive(Clone, Debug)]
pub struct SessionClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Routes requests to the local development backend.
    pub local: bool,
    /// Explicit base URL override.
    ///
    /// The override takes precedence over local mode when set.
    pub base_url: Option<String>,
}

impl Default for SessionClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SessionDefaults::CONNECT_TIMEOUT,
            attempt_timeout: SessionDefaults::ATTEMPT_TIMEOUT,
            local: false,
            base_url: None,
        }
    }
}

/// Login credentials for [`SessionClient::login`].
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

/// Descriptor for one authenticated API request.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Marks requests that are themselves part of the auth flow; a 401 on
    /// these propagates directly instead of triggering a refresh.
    auth_flow: bool,
}

impl ApiRequest {
    /// Creates a request descriptor for a domain endpoint.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            auth_flow: false,
        }
    }

    /// Attaches a JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    fn auth_flow(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            body: None,
            auth_flow: true,
        }
    }
}

/// Errors produced by authenticated API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport unreachable or timed out. Never retried automatically.
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The session is no longer valid and could not be refreshed.
    #[error("session is no longer valid")]
    Unauthorized,

    /// The backend rejected the request; its message is passed through.
    #[error("server returned {status}: {message}")]
    Server { status: StatusCode, message: String },
}

/// HTTP client that owns one credential session.
///
/// Cloning is cheap and clones share the session cookie jar and the refresh
/// coordinator, so concurrent callers across clones still trigger at most
/// one refresh.
#[derive(Clone)]
pub struct SessionClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    auth_tx: mpsc::UnboundedSender<AuthCommand>,
    ended_rx: watch::Receiver<bool>,
}

impl SessionClient {
    /// Creates a client against the production API.
    ///
    /// Must be called within a Tokio runtime; construction spawns the
    /// refresh coordinator task.
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(SessionClientOptions::default())
    }

    /// Creates a client with explicit options.
    pub fn with_options(options: SessionClientOptions) -> Result<Self, ApiError> {
        let http = Client::builder()
            .cookie_store(true)
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Network)?;

        let base_url = match options.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if options.local => LOCAL_API_BASE_URL.to_string(),
            None => API_BASE_URL.to_string(),
        };

        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = watch::channel(false);
        tokio::spawn(auth_worker(
            http.clone(),
            format!("{base_url}{REFRESH_PATH}"),
            options.attempt_timeout,
            auth_rx,
            ended_tx,
        ));

        Ok(Self {
            http,
            base_url,
            attempt_timeout: options.attempt_timeout,
            auth_tx,
            ended_rx,
        })
    }

    /// Returns the base URL requests are issued against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns a receiver that flips to `true` when the session ends
    /// unrecoverably.
    ///
    /// The signal fires at most once per failed session regardless of how
    /// many calls were rejected by the failure.
    pub fn session_ended(&self) -> watch::Receiver<bool> {
        self.ended_rx.clone()
    }

    /// Authenticates and establishes a fresh credential session.
    pub async fn login(&self, credentials: &Credentials) -> Result<Value, ApiError> {
        let request = ApiRequest::auth_flow(Method::POST, LOGIN_PATH).with_body(json!({
            "email": credentials.email,
            "password": credentials.password.expose_secret(),
        }));
        let value = self.call(&request).await?;
        let _ = self.auth_tx.send(AuthCommand::Reset);
        Ok(value)
    }

    /// Ends the credential session server-side.
    pub async fn logout(&self) -> Result<(), ApiError> {
        self.call(&ApiRequest::auth_flow(Method::POST, LOGOUT_PATH))
            .await
            .map(|_| ())
    }

    /// Issues a GET request to a domain endpoint.
    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.call(&ApiRequest::new(Method::GET, path)).await
    }

    /// Issues a POST request with a JSON body.
    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.call(&ApiRequest::new(Method::POST, path).with_body(body))
            .await
    }

    /// Issues a PUT request with a JSON body.
    pub async fn put(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.call(&ApiRequest::new(Method::PUT, path).with_body(body))
            .await
    }

    /// Issues a DELETE request to a domain endpoint.
    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.call(&ApiRequest::new(Method::DELETE, path)).await
    }

    /// Performs an authenticated call, transparent to one-time credential
    /// expiry.
    ///
    /// A 401 on a domain request coordinates with the refresh worker: the
    /// first caller starts the single refresh, later callers join its FIFO
    /// waiter queue, and each affected request is replayed exactly once after
    /// a successful refresh, one at a time in the order the calls joined the
    /// queue. A 401 on the replay itself surfaces as
    /// [`ApiError::Unauthorized`] without starting another refresh.
    pub async fn call(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let response = self.send_attempt(request).await?;
        let status = response.status();

        if status != StatusCode::UNAUTHORIZED {
            return classify_response(status, response).await;
        }
        if request.auth_flow {
            return Err(ApiError::Unauthorized);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .auth_tx
            .send(AuthCommand::Reauthenticate { reply: reply_tx })
            .is_err()
        {
            return Err(ApiError::Unauthorized);
        }

        match reply_rx.await {
            Ok(ReauthOutcome::Refreshed(turn)) => {
                if let Some(after) = turn.after {
                    // A dropped predecessor releases the slot as well.
                    let _ = after.await;
                }
                let replay = self.send_attempt(request).await;
                let _ = turn.done.send(());

                let response = replay?;
                let status = response.status();
                if status == StatusCode::UNAUTHORIZED {
                    return Err(ApiError::Unauthorized);
                }
                classify_response(status, response).await
            }
            Ok(ReauthOutcome::SessionEnded) | Err(_) => Err(ApiError::Unauthorized),
        }
    }

    async fn send_attempt(&self, request: &ApiRequest) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .timeout(self.attempt_timeout);

        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        builder.send().await.map_err(ApiError::Network)
    }
}

async fn classify_response(
    status: StatusCode,
    response: reqwest::Response,
) -> Result<Value, ApiError> {
    let body = response.text().await.map_err(ApiError::Network)?;

    if !status.is_success() {
        return Err(ApiError::Server {
            status,
            message: summarize_error_body(&body),
        });
    }

    if body.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

enum AuthCommand {
    Reauthenticate {
        reply: oneshot::Sender<ReauthOutcome>,
    },
    /// Sent after a successful login; re-arms a dead coordinator.
    Reset,
}

#[derive(Debug)]
enum ReauthOutcome {
    Refreshed(ReplayTurn),
    SessionEnded,
}

/// One waiter's slot in the replay line.
///
/// The replay may only be issued once the predecessor's `after` resolves,
/// and `done` hands the line to the successor after the replay attempt has
/// settled. Chained turns are what keep replays in enqueue order even though
/// every waiter runs on its own task.
#[derive(Debug)]
struct ReplayTurn {
    after: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RefreshState {
    Idle,
    Refreshing,
    Dead,
}

/// Coordinator task owning the refresh state and the pending-call queue.
///
/// At most one refresh request is in flight at any time. Waiters enqueued
/// during the refresh window are settled in FIFO order with the refresh
/// outcome, and a successful refresh hands out chained [`ReplayTurn`]s so
/// their replays also reach the wire in enqueue order. Once the coordinator
/// is dead, every later request is rejected immediately until a login resets
/// it.
async fn auth_worker(
    http: Client,
    refresh_url: String,
    attempt_timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<AuthCommand>,
    ended_tx: watch::Sender<bool>,
) {
    let mut state = RefreshState::Idle;
    let mut waiters: VecDeque<oneshot::Sender<ReauthOutcome>> = VecDeque::new();
    let mut inflight: Option<oneshot::Receiver<bool>> = None;

    loop {
        if let Some(mut done) = inflight.take() {
            tokio::select! {
                refreshed = &mut done => {
                    let refreshed = refreshed.unwrap_or(false);
                    debug!(
                        event = "refresh_settled",
                        refreshed,
                        waiters = waiters.len()
                    );
                    if refreshed {
                        state = RefreshState::Idle;
                        let mut after = None;
                        for waiter in waiters.drain(..) {
                            let (done_tx, done_rx) = oneshot::channel();
                            let turn = ReplayTurn {
                                after: after.take(),
                                done: done_tx,
                            };
                            // A refused send drops the turn, which releases
                            // the successor's slot through the closed channel.
                            let _ = waiter.send(ReauthOutcome::Refreshed(turn));
                            after = Some(done_rx);
                        }
                    } else {
                        state = RefreshState::Dead;
                        signal_session_ended(&ended_tx);
                        for waiter in waiters.drain(..) {
                            let _ = waiter.send(ReauthOutcome::SessionEnded);
                        }
                    }
                }
                command = rx.recv() => {
                    match command {
                        Some(AuthCommand::Reauthenticate { reply }) => waiters.push_back(reply),
                        // A reset while refreshing takes effect once the
                        // in-flight refresh settles.
                        Some(AuthCommand::Reset) => {}
                        None => return,
                    }
                    inflight = Some(done);
                }
            }
        } else {
            match rx.recv().await {
                Some(AuthCommand::Reauthenticate { reply }) => {
                    if state == RefreshState::Dead {
                        let _ = reply.send(ReauthOutcome::SessionEnded);
                        continue;
                    }
                    state = RefreshState::Refreshing;
                    waiters.push_back(reply);

                    let (done_tx, done_rx) = oneshot::channel();
                    let http = http.clone();
                    let url = refresh_url.clone();
                    tokio::spawn(async move {
                        let _ = done_tx.send(perform_refresh(&http, &url, attempt_timeout).await);
                    });
                    inflight = Some(done_rx);
                }
                Some(AuthCommand::Reset) => {
                    state = RefreshState::Idle;
                    let _ = ended_tx.send_replace(false);
                }
                None => return,
            }
        }
    }
}

async fn perform_refresh(http: &Client, url: &str, attempt_timeout: Duration) -> bool {
    match http.post(url).timeout(attempt_timeout).send().await {
        Ok(response) if response.status().is_success() => {
            debug!(event = "refresh_succeeded");
            true
        }
        Ok(response) => {
            warn!(event = "refresh_rejected", status = %response.status());
            false
        }
        Err(err) => {
            warn!(event = "refresh_transport_failed", error = %err);
            false
        }
    }
}

fn signal_session_ended(ended_tx: &watch::Sender<bool>) {
    if !*ended_tx.borrow() {
        let _ = ended_tx.send(true);
    }
}
