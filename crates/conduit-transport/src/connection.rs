//! Persistent WebSocket connection to one agent.
//!
//! A [`ConnectionManager`] owns at most one live socket. Outbound frames go
//! through a writer task fed by an mpsc channel so concurrent callers never
//! contend for the sink; a reader task demultiplexes inbound frames into the
//! pending-request table (by correlation id) or the event-handler table.
//! On unexpected loss the old tasks are stopped, pending requests fail with
//! `Connection`, and a background loop reconnects with exponential backoff
//! behind its own circuit breaker.

use crate::protocol::{Envelope, MessageKind};
use chrono::{DateTime, Utc};
use conduit_core::{AgentErrorBody, AgentIdentity, ConduitError, ConduitResult};
use conduit_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Socket, Message>;
type WsStream = SplitStream<Socket>;

/// Callback invoked for unsolicited frames. Must not block.
pub type EventHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

const TASK_STOP_GRACE: Duration = Duration::from_secs(2);

/// Timing and reconnection tunables for a persistent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Time allowed for the TCP and WebSocket upgrade.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Time allowed for `connection_acknowledged` after the handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Default per-request timeout when the caller gives none.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Idle time after which a heartbeat is sent.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Time allowed for `heartbeat_response` before the socket is declared dead.
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    /// Backoff shape between reconnection attempts; `max_attempts` is ignored.
    #[serde(default = "default_reconnect_policy")]
    pub reconnect: RetryPolicy,
    /// Breaker guarding reconnection attempts.
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_pong_timeout_ms() -> u64 {
    5_000
}
fn default_reconnect_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: u32::MAX,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            reconnect: default_reconnect_policy(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ConnectionConfig {
    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }
}

/// Lifecycle phase of a persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No socket and no reconnection running.
    Disconnected,
    /// First connect in progress.
    Connecting,
    /// Handshake done; requests are accepted.
    Connected,
    /// Lost; the background loop is retrying.
    Reconnecting,
    /// Reconnection breaker is open; waiting for its recovery window.
    Failed,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionPhase::Disconnected => write!(f, "disconnected"),
            ConnectionPhase::Connecting => write!(f, "connecting"),
            ConnectionPhase::Connected => write!(f, "connected"),
            ConnectionPhase::Reconnecting => write!(f, "reconnecting"),
            ConnectionPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Read-only snapshot of a connection for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    /// Agent name.
    pub agent: String,
    /// Persistent address.
    pub url: String,
    /// Current lifecycle phase.
    pub phase: ConnectionPhase,
    /// Attempts in the current (re)connection cycle.
    pub attempt_count: u32,
    /// Most recent connect or socket error.
    pub last_error: Option<String>,
    /// When the current socket finished its handshake.
    pub connected_at: Option<DateTime<Utc>>,
    /// Successful reconnections since start.
    pub reconnect_count: u32,
    /// Requests waiting for a correlated reply.
    pub pending_requests: usize,
}

#[derive(Debug)]
struct StateInner {
    phase: ConnectionPhase,
    attempt_count: u32,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    reconnect_count: u32,
}

struct PendingRequest {
    issued_at: Instant,
    deadline: Instant,
    completion: oneshot::Sender<ConduitResult<Envelope>>,
}

type PendingMap = Mutex<HashMap<String, PendingRequest>>;

/// Removes a pending entry however the waiting future ends.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

/// The tasks and outbound channel of one physical socket.
struct LiveConnection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Manages the persistent transport to a single agent.
pub struct ConnectionManager {
    agent: AgentIdentity,
    url: String,
    config: ConnectionConfig,
    state: RwLock<StateInner>,
    pending: PendingMap,
    handlers: RwLock<HashMap<String, EventHandler>>,
    live: tokio::sync::Mutex<Option<LiveConnection>>,
    connect_lock: tokio::sync::Mutex<()>,
    breaker: Arc<CircuitBreaker>,
    last_activity: Mutex<Instant>,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    me: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager for `agent`, which must have a `ws_url`.
    ///
    /// `breaker` guards reconnection attempts and is usually the registry's
    /// `<agent>:reconnect` breaker.
    pub fn new(
        agent: AgentIdentity,
        config: ConnectionConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> ConduitResult<Arc<Self>> {
        let url = agent.ws_url.clone().ok_or_else(|| {
            ConduitError::Config(format!(
                "agent '{}' has no persistent transport address",
                agent.name
            ))
        })?;

        Ok(Arc::new_cyclic(|me| Self {
            agent,
            url,
            config,
            state: RwLock::new(StateInner {
                phase: ConnectionPhase::Disconnected,
                attempt_count: 0,
                last_error: None,
                connected_at: None,
                reconnect_count: 0,
            }),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            live: tokio::sync::Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            breaker,
            last_activity: Mutex::new(Instant::now()),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            me: me.clone(),
        }))
    }

    /// The agent this manager connects to.
    pub fn agent(&self) -> &AgentIdentity {
        &self.agent
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.state.read().phase
    }

    /// Whether requests can be sent right now.
    pub fn is_available(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    /// Requests waiting for a correlated reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot for the admin surface.
    pub fn state(&self) -> ConnectionState {
        let inner = self.state.read();
        ConnectionState {
            agent: self.agent.name.clone(),
            url: self.url.clone(),
            phase: inner.phase,
            attempt_count: inner.attempt_count,
            last_error: inner.last_error.clone(),
            connected_at: inner.connected_at,
            reconnect_count: inner.reconnect_count,
            pending_requests: self.pending_count(),
        }
    }

    /// Register a handler for unsolicited frames keyed by `event_name`
    /// (or by frame type when no event name is present).
    pub fn on_event<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    /// Connect once, without the background reconnection loop.
    ///
    /// A no-op if already connected. Clears a previous `disconnect()`.
    pub async fn connect(&self) -> ConduitResult<()> {
        {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_available() {
            return Ok(());
        }
        self.set_phase(ConnectionPhase::Connecting);
        {
            let mut inner = self.state.write();
            inner.attempt_count = inner.attempt_count.saturating_add(1);
        }

        match self.breaker.call(|| self.establish()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let phase = if self.breaker.state() == CircuitState::Open {
                    ConnectionPhase::Failed
                } else {
                    ConnectionPhase::Disconnected
                };
                self.record_error(&e);
                self.set_phase(phase);
                Err(e)
            }
        }
    }

    /// Connect in the background, reconnecting with backoff until it succeeds
    /// or `disconnect()` is called.
    pub fn start(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match me.connect().await {
                Ok(()) | Err(ConduitError::Cancelled) => {}
                Err(e) => {
                    warn!(agent = %me.agent.name, error = %e, "Initial connect failed, reconnecting in background");
                    me.spawn_reconnect();
                }
            }
        });
    }

    /// Stop reconnection, close the socket and fail all pending requests.
    ///
    /// A connect already in flight is abandoned before this returns, so the
    /// phase afterwards is always `Disconnected`.
    pub async fn disconnect(&self) {
        self.shutdown.lock().cancel();
        let _guard = self.connect_lock.lock().await;
        let live = self.live.lock().await.take();
        if let Some(live) = live {
            self.teardown(live).await;
        }
        self.fail_pending("disconnected");
        self.set_phase(ConnectionPhase::Disconnected);
        info!(agent = %self.agent.name, "Persistent connection closed");
    }

    /// Send a `<capability>_request` and return the response payload.
    ///
    /// A response carrying an `{error_type, message}` body, or an `error`
    /// frame, becomes an `Agent`/`Validation` error.
    pub async fn request(
        &self,
        capability: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> ConduitResult<Value> {
        let reply = self.send(Envelope::request(capability, payload), timeout).await?;

        if let Some(body) = AgentErrorBody::extract(&reply.payload) {
            return Err(ConduitError::from_agent_body(body));
        }
        match reply.kind() {
            MessageKind::Response(cap) if cap == capability => Ok(reply.payload),
            MessageKind::Error => Err(ConduitError::Agent {
                error_type: "agent_error".into(),
                message: format!("'{capability}' request rejected"),
            }),
            _ => Err(ConduitError::Validation(format!(
                "expected '{capability}_response', got '{}'",
                reply.msg_type
            ))),
        }
    }

    /// Send an envelope and wait for the frame with the same correlation id.
    ///
    /// A missing correlation id is filled in. On timeout the pending entry is
    /// removed and `Timeout` returned; the connection stays up.
    pub async fn send(
        &self,
        mut envelope: Envelope,
        timeout: Option<Duration>,
    ) -> ConduitResult<Envelope> {
        let correlation_id = envelope
            .correlation_id
            .get_or_insert_with(crate::protocol::new_correlation_id)
            .clone();
        let outbound = self
            .live
            .lock()
            .await
            .as_ref()
            .map(|l| l.outbound.clone())
            .ok_or_else(|| {
                ConduitError::Connection(format!("agent '{}' is not connected", self.agent.name))
            })?;

        let timeout =
            timeout.unwrap_or_else(|| ConnectionConfig::ms(self.config.request_timeout_ms));
        let text = envelope.to_text()?;
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.pending.lock().insert(
            correlation_id.clone(),
            PendingRequest {
                issued_at: now,
                deadline: now + timeout,
                completion: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        outbound.send(Message::Text(text)).map_err(|_| {
            ConduitError::Connection(format!("writer for '{}' has stopped", self.agent.name))
        })?;
        self.touch();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConduitError::Connection(
                "pending request dropped without completion".into(),
            )),
            Err(_) => {
                debug!(
                    agent = %self.agent.name,
                    correlation_id = %correlation_id,
                    msg_type = %envelope.msg_type,
                    "Request timed out"
                );
                Err(ConduitError::Timeout(format!(
                    "no reply to '{}' from '{}' within {}ms",
                    envelope.msg_type,
                    self.agent.name,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Round-trip a heartbeat within the pong timeout.
    pub async fn heartbeat(&self) -> ConduitResult<()> {
        let reply = self
            .send(
                Envelope::heartbeat(),
                Some(ConnectionConfig::ms(self.config.pong_timeout_ms)),
            )
            .await?;
        match reply.kind() {
            MessageKind::HeartbeatResponse => Ok(()),
            _ => Err(ConduitError::Validation(format!(
                "expected heartbeat_response, got '{}'",
                reply.msg_type
            ))),
        }
    }

    /// Open the socket, handshake, and install a fresh set of tasks.
    async fn establish(&self) -> ConduitResult<()> {
        let stale = self.live.lock().await.take();
        if let Some(stale) = stale {
            self.teardown(stale).await;
        }

        let shutdown = self.shutdown.lock().clone();
        let (sink, stream) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(ConduitError::Cancelled),
            opened = self.open_socket() => opened?,
        };
        self.install(sink, stream, shutdown.child_token()).await;
        Ok(())
    }

    /// Connect and complete the handshake.
    async fn open_socket(&self) -> ConduitResult<(WsSink, WsStream)> {
        let (ws, _) = tokio::time::timeout(
            ConnectionConfig::ms(self.config.connect_timeout_ms),
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| ConduitError::Timeout(format!("connecting to {} timed out", self.url)))?
        .map_err(|e| ConduitError::Connection(format!("connect to {}: {e}", self.url)))?;

        let (mut sink, mut stream) = ws.split();

        let hello = Envelope::handshake(&self.agent.name, &self.agent.capabilities);
        sink.send(Message::Text(hello.to_text()?))
            .await
            .map_err(|e| ConduitError::Connection(format!("handshake send failed: {e}")))?;

        tokio::time::timeout(
            ConnectionConfig::ms(self.config.handshake_timeout_ms),
            async {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => match Envelope::from_text(&text) {
                            Ok(env) if env.kind() == MessageKind::Acknowledged => return Ok(()),
                            Ok(env) => {
                                debug!(agent = %self.agent.name, msg_type = %env.msg_type, "Frame before acknowledgement ignored");
                            }
                            Err(e) => debug!(agent = %self.agent.name, error = %e, "Malformed frame during handshake"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            return Err(ConduitError::Connection(format!(
                                "handshake read failed: {e}"
                            )))
                        }
                    }
                }
                Err(ConduitError::Connection(
                    "socket closed during handshake".into(),
                ))
            },
        )
        .await
        .map_err(|_| {
            ConduitError::Timeout(format!(
                "'{}' did not acknowledge the handshake",
                self.agent.name
            ))
        })??;

        Ok((sink, stream))
    }

    /// Spawn the writer, reader and heartbeat tasks for a handshaken socket.
    async fn install(&self, mut sink: WsSink, mut stream: WsStream, cancel: CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = {
            let cancel = cancel.clone();
            let me = self.me.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            let _ = sink.close().await;
                            break;
                        }
                        msg = outbound_rx.recv() => match msg {
                            Some(msg) => {
                                if let Err(e) = sink.send(msg).await {
                                    if let Some(me) = me.upgrade() {
                                        me.connection_lost(generation, format!("write failed: {e}"));
                                    }
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            })
        };

        let reader = {
            let cancel = cancel.clone();
            let me = self.me.clone();
            let replies = outbound.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = stream.next() => frame,
                    };
                    let Some(me) = me.upgrade() else {
                        break;
                    };
                    match frame {
                        Some(Ok(Message::Text(text))) => me.handle_frame(&text, &replies),
                        Some(Ok(Message::Close(_))) | None => {
                            me.connection_lost(generation, "closed by agent".into());
                            break;
                        }
                        Some(Ok(_)) => me.touch(),
                        Some(Err(e)) => {
                            me.connection_lost(generation, format!("read failed: {e}"));
                            break;
                        }
                    }
                }
            })
        };

        let heartbeat = {
            let cancel = cancel.clone();
            let me = self.me.clone();
            let interval = ConnectionConfig::ms(self.config.heartbeat_interval_ms);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(me) = me.upgrade() else {
                        break;
                    };
                    if me.idle_for() < interval {
                        continue;
                    }
                    if let Err(e) = me.heartbeat().await {
                        me.connection_lost(generation, format!("heartbeat failed: {e}"));
                        break;
                    }
                }
            })
        };

        *self.live.lock().await = Some(LiveConnection {
            generation,
            outbound,
            cancel,
            tasks: vec![writer, reader, heartbeat],
        });
        self.touch();
        {
            let mut inner = self.state.write();
            inner.phase = ConnectionPhase::Connected;
            inner.attempt_count = 0;
            inner.last_error = None;
            inner.connected_at = Some(Utc::now());
        }
        info!(agent = %self.agent.name, url = %self.url, generation, "Persistent connection established");
    }

    fn handle_frame(&self, text: &str, replies: &mpsc::UnboundedSender<Message>) {
        self.touch();
        let envelope = match Envelope::from_text(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(agent = %self.agent.name, error = %e, "Skipping malformed frame");
                return;
            }
        };

        if envelope.kind() == MessageKind::Heartbeat {
            let pong = Envelope::heartbeat_response(envelope.correlation_id);
            if let Ok(text) = pong.to_text() {
                let _ = replies.send(Message::Text(text));
            }
            return;
        }

        if let Some(id) = envelope.correlation_id.as_deref() {
            let waiter = self.pending.lock().remove(id);
            if let Some(waiter) = waiter {
                debug!(
                    agent = %self.agent.name,
                    correlation_id = %id,
                    latency_ms = waiter.issued_at.elapsed().as_millis() as u64,
                    late = Instant::now() > waiter.deadline,
                    "Response matched"
                );
                let _ = waiter.completion.send(Ok(envelope));
                return;
            }
        }

        self.dispatch_event(envelope);
    }

    fn dispatch_event(&self, envelope: Envelope) {
        let handler = self.handlers.read().get(envelope.routing_key()).cloned();
        match handler {
            Some(handler) => handler(envelope),
            None => debug!(
                agent = %self.agent.name,
                key = %envelope.routing_key(),
                "No handler for event"
            ),
        }
    }

    /// Called from a task that observed the socket die.
    fn connection_lost(&self, generation: u64, reason: String) {
        if self.shutdown.lock().is_cancelled() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            me.handle_disconnect(generation, reason).await;
        });
    }

    async fn handle_disconnect(&self, generation: u64, reason: String) {
        let live = {
            let mut slot = self.live.lock().await;
            match slot.as_ref() {
                Some(live) if live.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(live) = live else {
            return;
        };

        warn!(agent = %self.agent.name, generation, reason = %reason, "Persistent connection lost");
        self.set_phase(ConnectionPhase::Reconnecting);
        self.state.write().last_error = Some(reason.clone());
        self.fail_pending(&reason);
        self.teardown(live).await;

        if !self.shutdown.lock().is_cancelled() {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(&self) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            let shutdown = me.shutdown.lock().clone();
            me.reconnect_loop(&shutdown).await;
            me.end_reconnect(&shutdown);
        });
    }

    /// Clear the in-progress flag, then pick up a loss that raced with it.
    fn end_reconnect(&self, shutdown: &CancellationToken) {
        self.reconnecting.store(false, Ordering::SeqCst);
        if !shutdown.is_cancelled() && !self.is_available() {
            debug!(agent = %self.agent.name, "Connection lost while reconnect was finishing");
            self.spawn_reconnect();
        }
    }

    async fn reconnect_loop(&self, shutdown: &CancellationToken) {
        let policy = &self.config.reconnect;
        self.set_phase(ConnectionPhase::Reconnecting);
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            attempt = attempt.saturating_add(1);
            self.state.write().attempt_count = attempt;

            let result = {
                let _guard = self.connect_lock.lock().await;
                if self.is_available() {
                    Ok(())
                } else {
                    self.breaker.call(|| self.establish()).await
                }
            };

            let err = match result {
                Ok(()) => {
                    let mut inner = self.state.write();
                    inner.reconnect_count = inner.reconnect_count.saturating_add(1);
                    info!(agent = %self.agent.name, attempt, "Reconnected");
                    return;
                }
                Err(e) => e,
            };
            self.record_error(&err);

            let wait = if self.breaker.state() == CircuitState::Open {
                self.set_phase(ConnectionPhase::Failed);
                warn!(
                    agent = %self.agent.name,
                    attempt,
                    error = %err,
                    "Reconnect breaker open, waiting for recovery window"
                );
                self.breaker.config().recovery_timeout()
            } else {
                self.set_phase(ConnectionPhase::Reconnecting);
                let delay = policy.delay_with_jitter(attempt);
                info!(
                    agent = %self.agent.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Reconnect failed, backing off"
                );
                delay
            };

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Stop a socket's tasks. The slot must already be cleared.
    async fn teardown(&self, live: LiveConnection) {
        live.cancel.cancel();
        drop(live.outbound);
        for mut task in live.tasks {
            if tokio::time::timeout(TASK_STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        debug!(agent = %self.agent.name, generation = live.generation, "Connection tasks stopped");
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(agent = %self.agent.name, count = drained.len(), "Failing pending requests");
        }
        for (_, waiter) in drained {
            let _ = waiter.completion.send(Err(ConduitError::Connection(format!(
                "connection to '{}' lost: {reason}",
                self.agent.name
            ))));
        }
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let previous = std::mem::replace(&mut self.state.write().phase, phase);
        if previous != phase {
            debug!(agent = %self.agent.name, from = %previous, to = %phase, "Connection phase changed");
        }
    }

    fn record_error(&self, error: &ConduitError) {
        self.state.write().last_error = Some(error.to_string());
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn manager(ws: Option<&str>) -> ConduitResult<Arc<ConnectionManager>> {
        let mut agent = AgentIdentity::new("data", "http://127.0.0.1:9").with_capability("fetch_data");
        if let Some(ws) = ws {
            agent = agent.with_ws_url(ws);
        }
        ConnectionManager::new(
            agent,
            ConnectionConfig::default(),
            Arc::new(CircuitBreaker::new("data:reconnect", CircuitBreakerConfig::default())),
        )
    }

    #[test]
    fn test_requires_ws_url() {
        assert!(matches!(manager(None), Err(ConduitError::Config(_))));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let m = manager(Some("ws://127.0.0.1:9/ws")).unwrap();
        let state = m.state();
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert_eq!(state.pending_requests, 0);
        assert!(!m.is_available());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails_fast() {
        let m = manager(Some("ws://127.0.0.1:9/ws")).unwrap();
        let err = m
            .request("fetch_data", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::Connection(_)));
        assert_eq!(m.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_event_dispatch_by_routing_key() {
        let m = manager(Some("ws://127.0.0.1:9/ws")).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        m.on_event("schema_changed", move |env| sink.lock().push(env.msg_type));
        let (tx, _rx) = mpsc::unbounded_channel();

        m.handle_frame(r#"{"type":"schema_changed","correlation_id":null}"#, &tx);
        m.handle_frame(r#"{"type":"event","event_name":"unknown_thing"}"#, &tx);
        m.handle_frame("garbage", &tx);

        assert_eq!(seen.lock().as_slice(), ["schema_changed"]);
    }

    #[tokio::test]
    async fn test_incoming_heartbeat_is_answered() {
        let m = manager(Some("ws://127.0.0.1:9/ws")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        m.handle_frame(r#"{"type":"heartbeat","correlation_id":"hb-1"}"#, &tx);

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected a heartbeat_response frame");
        };
        let env = Envelope::from_text(&text).unwrap();
        assert_eq!(env.kind(), MessageKind::HeartbeatResponse);
        assert_eq!(env.correlation_id.as_deref(), Some("hb-1"));
    }

    #[tokio::test]
    async fn test_loss_during_reconnect_wind_down_schedules_another() {
        let m = manager(Some("ws://127.0.0.1:9/ws")).unwrap();
        let shutdown = m.shutdown.lock().clone();

        m.reconnecting.store(true, Ordering::SeqCst);
        m.set_phase(ConnectionPhase::Reconnecting);
        m.end_reconnect(&shutdown);
        assert!(m.reconnecting.load(Ordering::SeqCst));
        m.disconnect().await;

        let m = manager(Some("ws://127.0.0.1:9/ws")).unwrap();
        let shutdown = m.shutdown.lock().clone();
        m.reconnecting.store(true, Ordering::SeqCst);
        m.set_phase(ConnectionPhase::Connected);
        m.end_reconnect(&shutdown);
        assert!(!m.reconnecting.load(Ordering::SeqCst));
    }

    #[test]
    fn test_config_defaults() {
        let cfg: ConnectionConfig = serde_json::from_str(r#"{"heartbeat_interval_ms": 100}"#).unwrap();
        assert_eq!(cfg.heartbeat_interval_ms, 100);
        assert_eq!(cfg.connect_timeout_ms, 5_000);
        assert_eq!(cfg.reconnect.base_delay_ms, 1_000);
    }
}
