//! Transport adapter: the client end of the presence socket.
//!
//! One supervisor task per adapter owns the WebSocket, the liveness probe
//! timer and the reconnect timer, so they start and stop together:
//!
//! ```text
//! connect() ──spawn──▶ supervise ──▶ connect_async ──ok──▶ run_session ─┐
//!                          ▲               │                            │
//!                          │             error                     lost │
//!                          │               ▼                            │
//!                          └──backoff── Reconnecting ◀──────────────────┘
//!                                          │
//!                                  attempts > max ──▶ Failed
//! ```
//!
//! Inbound events are dispatched sequentially on the supervisor task.
//! Callbacks are cloned out of the subscriber table before they run, so a
//! callback may subscribe, unsubscribe or call `disconnect()`.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::PresenceError;
use crate::ids::{ConnectionId, TeamId, UserId};
use crate::protocol::{ClientAction, Coordinates, EventKind, MemberStatus, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Subscriber callback. Two subscriptions are the same subscriber when they
/// share the same `Arc`.
pub type EventCallback = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The reconnect cap was exhausted. Terminal until the next `connect()`.
    Failed,
}

/// Linear backoff, capped.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Retries after the first failed attempt.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the presence server
    pub server_url: String,
    pub connect_timeout: Duration,
    /// How often a `liveness-probe` is sent
    pub liveness_interval: Duration,
    /// Silence after which the link is considered dead
    pub liveness_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Actions buffered between callers and the socket
    pub outbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3000".to_string(),
            connect_timeout: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(75),
            reconnect: ReconnectPolicy::default(),
            outbound_capacity: 64,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

/// Who this client announces itself as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub user_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Subscriptions
// ───────────────────────────────────────────────────────────────────

struct Registration {
    id: u64,
    callback: EventCallback,
    /// Live `Subscription` handles for this callback.
    handles: usize,
}

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    entries: HashMap<EventKind, Vec<Registration>>,
}

fn callback_key(callback: &EventCallback) -> *const () {
    Arc::as_ptr(callback) as *const ()
}

/// Handle for one subscription; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    table: Weak<Mutex<SubscriberTable>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = lock(&table);
        if let Some(registrations) = table.entries.get_mut(&self.kind) {
            if let Some(pos) = registrations.iter().position(|r| r.id == self.id) {
                registrations[pos].handles -= 1;
                if registrations[pos].handles == 0 {
                    registrations.remove(pos);
                }
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Adapter
// ───────────────────────────────────────────────────────────────────

struct Shared {
    config: ClientConfig,
    status: watch::Sender<ConnectionStatus>,
    reconnect_attempts: AtomicU32,
    subscribers: Arc<Mutex<SubscriberTable>>,
    identity: Mutex<Option<Identity>>,
    /// Last `join-team`, replayed after every (re)connect.
    joined_team: Mutex<Option<ClientAction>>,
    connection_id: Mutex<Option<ConnectionId>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    /// Publish a status unless the session was told to stop.
    fn set_status(&self, shutdown: &watch::Receiver<bool>, status: ConnectionStatus) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        self.status.send_replace(status);
        true
    }

    fn dispatch(&self, event: &ServerEvent) {
        let callbacks: Vec<EventCallback> = lock(&self.subscribers)
            .entries
            .get(&event.kind())
            .map(|registrations| registrations.iter().map(|r| Arc::clone(&r.callback)).collect())
            .unwrap_or_default();

        log::trace!("Dispatching {} to {} subscriber(s)", event.kind(), callbacks.len());
        for callback in callbacks {
            callback(event);
        }
    }

    /// Actions that restore server-side state on a fresh socket.
    fn resync_actions(&self, joined_team: Option<ClientAction>) -> Vec<ClientAction> {
        let mut actions = Vec::with_capacity(2);
        if let Some(identity) = lock(&self.identity).clone() {
            actions.push(ClientAction::Announce {
                user_id: identity.user_id,
                user_name: identity.user_name,
            });
        }
        if let Some(join) = joined_team {
            actions.push(join);
        }
        actions
    }
}

struct SessionHandle {
    shutdown: watch::Sender<bool>,
    outgoing: mpsc::Sender<ClientAction>,
    task: JoinHandle<()>,
}

/// Client-side connection to a presence server.
pub struct TransportAdapter {
    shared: Arc<Shared>,
    session: Mutex<Option<SessionHandle>>,
}

impl TransportAdapter {
    pub fn new(config: ClientConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                status,
                reconnect_attempts: AtomicU32::new(0),
                subscribers: Arc::new(Mutex::new(SubscriberTable::default())),
                identity: Mutex::new(None),
                joined_team: Mutex::new(None),
                connection_id: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            session: Mutex::new(None),
        }
    }

    /// Connect, or attach to the session already running.
    ///
    /// Resolves once connected. Fails with `TransportFailure` once the
    /// reconnect cap is exhausted, or `ConnectionClosed` if `disconnect()` is
    /// called first.
    pub async fn connect(&self, identity: Option<Identity>) -> Result<(), PresenceError> {
        if let Some(identity) = identity {
            *lock(&self.shared.identity) = Some(identity);
        }

        let mut status_rx = {
            let mut session = lock(&self.session);
            let running = session.as_ref().is_some_and(|s| !s.task.is_finished());
            if running {
                log::debug!("Reusing running session to {}", self.shared.config.server_url);
            } else {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let (outgoing_tx, outgoing_rx) = mpsc::channel(self.shared.config.outbound_capacity);
                self.shared.reconnect_attempts.store(0, Ordering::Relaxed);
                self.shared.status.send_replace(ConnectionStatus::Connecting);

                let task = tokio::spawn(supervise(
                    Arc::clone(&self.shared),
                    shutdown_rx,
                    outgoing_rx,
                ));
                *session = Some(SessionHandle {
                    shutdown: shutdown_tx,
                    outgoing: outgoing_tx,
                    task,
                });
            }
            self.shared.status.subscribe()
        };

        let settled = *status_rx
            .wait_for(|status| {
                matches!(
                    status,
                    ConnectionStatus::Connected
                        | ConnectionStatus::Failed
                        | ConnectionStatus::Disconnected
                )
            })
            .await
            .map_err(|_| PresenceError::ConnectionClosed)?;

        match settled {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Failed => {
                let reason = lock(&self.shared.last_error)
                    .clone()
                    .unwrap_or_else(|| "reconnect attempts exhausted".to_string());
                Err(PresenceError::TransportFailure(reason))
            }
            _ => Err(PresenceError::ConnectionClosed),
        }
    }

    /// Stop the session. Never waits on the session task, so it is safe from
    /// inside a subscription callback and when already disconnected.
    pub fn disconnect(&self) {
        if let Some(session) = lock(&self.session).take() {
            session.shutdown.send_replace(true);
            log::info!("Disconnecting from {}", self.shared.config.server_url);
        }

        self.shared.status.send_replace(ConnectionStatus::Disconnected);
        self.shared.reconnect_attempts.store(0, Ordering::Relaxed);
        *lock(&self.shared.joined_team) = None;
        *lock(&self.shared.connection_id) = None;
    }

    /// Register `callback` for one event kind.
    ///
    /// Subscribing the same callback `Arc` twice yields one delivery; it is
    /// removed once every returned handle has been dropped.
    pub fn subscribe(&self, kind: EventKind, callback: EventCallback) -> Subscription {
        let mut guard = lock(&self.shared.subscribers);
        let table = &mut *guard;
        let registrations = table.entries.entry(kind).or_default();

        let key = callback_key(&callback);
        let id = match registrations.iter_mut().find(|r| callback_key(&r.callback) == key) {
            Some(existing) => {
                existing.handles += 1;
                existing.id
            }
            None => {
                table.next_id += 1;
                registrations.push(Registration {
                    id: table.next_id,
                    callback,
                    handles: 1,
                });
                table.next_id
            }
        };

        Subscription {
            table: Arc::downgrade(&self.shared.subscribers),
            kind,
            id,
        }
    }

    /// Convenience wrapper around [`subscribe`](Self::subscribe).
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(callback))
    }

    /// Drop every subscriber of `kind`, whoever holds the handles.
    pub fn unsubscribe_all(&self, kind: EventKind) {
        lock(&self.shared.subscribers).entries.remove(&kind);
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.shared.subscribers)
            .entries
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Queue an action for the socket. Requires a connected session.
    pub fn send(&self, action: ClientAction) -> Result<(), PresenceError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(PresenceError::ConnectionClosed);
        }

        let outgoing = lock(&self.session)
            .as_ref()
            .map(|session| session.outgoing.clone())
            .ok_or(PresenceError::ConnectionClosed)?;

        outgoing.try_send(action).map_err(|e| match e {
            TrySendError::Full(action) => PresenceError::TransportFailure(format!(
                "outbound queue full, dropped {}",
                action.name()
            )),
            TrySendError::Closed(_) => PresenceError::ConnectionClosed,
        })
    }

    /// Join a team room. Remembered and replayed after reconnects, so it may
    /// be called before `connect()`.
    pub fn join_team(&self, team_id: impl Into<TeamId>) -> Result<(), PresenceError> {
        let identity = lock(&self.shared.identity)
            .clone()
            .ok_or(PresenceError::UnboundIdentity(None))?;

        let action = ClientAction::JoinTeam {
            team_id: team_id.into(),
            user_id: identity.user_id,
            user_name: identity.user_name,
        };
        let mut joined_team = lock(&self.shared.joined_team);
        *joined_team = Some(action.clone());

        match self.send(action) {
            Err(PresenceError::ConnectionClosed) => {
                log::debug!("join-team deferred until connected");
                Ok(())
            }
            other => other,
        }
    }

    pub fn leave_team(&self) -> Result<(), PresenceError> {
        *lock(&self.shared.joined_team) = None;
        self.send(ClientAction::LeaveTeam)
    }

    pub fn update_status(&self, status: MemberStatus) -> Result<(), PresenceError> {
        self.send(ClientAction::MemberStatusUpdate { status })
    }

    pub fn update_location(
        &self,
        location: impl Into<String>,
        coordinates: Option<Coordinates>,
    ) -> Result<(), PresenceError> {
        self.send(ClientAction::LocationUpdate {
            location: location.into(),
            coordinates,
        })
    }

    pub fn schedule_meeting(&self, meeting: Value) -> Result<(), PresenceError> {
        self.send(ClientAction::MeetingScheduled(meeting))
    }

    pub fn send_typing(&self, is_typing: bool) -> Result<(), PresenceError> {
        self.send(ClientAction::TypingMeeting { is_typing })
    }

    pub fn probe(&self) -> Result<(), PresenceError> {
        self.send(ClientAction::LivenessProbe)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Failed attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Server-assigned id from the last `connection-confirmed`.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        *lock(&self.shared.connection_id)
    }

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.shared.identity).clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

// ───────────────────────────────────────────────────────────────────
// Supervisor
// ───────────────────────────────────────────────────────────────────

enum SessionEnd {
    Shutdown,
    Lost(String),
}

async fn supervise(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    mut outgoing: mpsc::Receiver<ClientAction>,
) {
    let url = shared.config.server_url.clone();
    let connect_timeout = shared.config.connect_timeout;
    let policy = shared.config.reconnect.clone();

    loop {
        let attempt = tokio::select! {
            _ = shutdown.changed() => return,
            result = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str())) => result,
        };

        let failure = match attempt {
            Ok(Ok((ws, _response))) => {
                shared.reconnect_attempts.store(0, Ordering::Relaxed);
                log::info!("Connected to {url}");

                match run_session(&shared, ws, &mut shutdown, &mut outgoing).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {connect_timeout:?}"),
        };

        *lock(&shared.connection_id) = None;
        *lock(&shared.last_error) = Some(failure.clone());
        let attempts = shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;

        if attempts > policy.max_attempts {
            log::error!("Giving up on {url} after {attempts} failed attempts: {failure}");
            shared.set_status(&shutdown, ConnectionStatus::Failed);
            return;
        }

        let delay = policy.delay(attempts);
        log::warn!(
            "Connection to {} failed ({}), retry {}/{} in {:?}",
            url,
            failure,
            attempts,
            policy.max_attempts,
            delay
        );
        if !shared.set_status(&shutdown, ConnectionStatus::Reconnecting) {
            return;
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_session(
    shared: &Shared,
    ws: WsStream,
    shutdown: &mut watch::Receiver<bool>,
    outgoing: &mut mpsc::Receiver<ClientAction>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    // The replayed join and the `Connected` status are published under the
    // same lock `join_team` takes, so a join goes out through exactly one of
    // the resync or the outgoing queue.
    let resync = {
        let joined_team = lock(&shared.joined_team);
        let actions = shared.resync_actions(joined_team.clone());
        if !shared.set_status(shutdown, ConnectionStatus::Connected) {
            return SessionEnd::Shutdown;
        }
        actions
    };

    for action in resync {
        if let Err(e) = send_action(&mut sink, &action).await {
            return SessionEnd::Lost(e.to_string());
        }
    }

    let interval = shared.config.liveness_interval;
    let liveness_timeout = shared.config.liveness_timeout;
    let mut probe = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }

            action = outgoing.recv() => {
                let Some(action) = action else {
                    return SessionEnd::Shutdown;
                };
                if let Err(e) = send_action(&mut sink, &action).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }

            _ = probe.tick() => {
                if last_seen.elapsed() > liveness_timeout {
                    return SessionEnd::Lost(format!("no traffic for {liveness_timeout:?}"));
                }
                if let Err(e) = send_action(&mut sink, &ClientAction::LivenessProbe).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if let ServerEvent::ConnectionConfirmed { connection_id, .. } = &event {
                                log::debug!("Server assigned connection {connection_id}");
                                *lock(&shared.connection_id) = Some(*connection_id);
                            }
                            shared.dispatch(&event);
                        }
                        Err(e) => log::warn!("Ignoring frame from server: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return SessionEnd::Lost("closed by server".to_string());
                }
                Some(Ok(_)) => {
                    last_seen = Instant::now();
                }
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
            }
        }
    }
}

async fn send_action(sink: &mut WsSink, action: &ClientAction) -> Result<(), PresenceError> {
    let frame = action.encode()?;
    log::trace!("Sending {}", action.name());
    sink.send(Message::Text(frame.into()))
        .await
        .map_err(|e| PresenceError::TransportFailure(e.to_string()))
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
