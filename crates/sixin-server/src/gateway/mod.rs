//! Connection gateway: authentication, lifecycle and event routing.
//!
//! Every accepted socket, whatever its framing, becomes a [`Connection`]
//! driven through the same state machine:
//!
//! ```text
//! Connecting → Authenticating → Active → Closing → Closed
//! ```
//!
//! - **Authenticating**: the transport hands over the bearer token. A bad
//!   token closes the connection without it ever reaching the registry.
//!   Failures are rate limited per remote IP.
//! - **Active**: the connection is registered, receives its initial snapshot
//!   (`receive`, `email`, `self`, `qrcode`), and inbound events are routed to
//!   the handlers in [`handlers`] one at a time, in arrival order. A handler
//!   runs under a deadline; the reply or fan-out it produces is emitted
//!   after it, each send bounded by its own timeout.
//! - **Closing**: client disconnect, idle timeout, exhausted protocol-error
//!   budget, or server shutdown. Cleanup always runs: the peer session is
//!   torn down and the registry binding removed.
//!
//! # Data Flow
//!
//! ```text
//! transport reader ──Inbound──▶ Gateway::run ──▶ handlers
//!                                                  ├─▶ Store
//!                                                  ├─▶ PeerConnectionManager
//!                                                  └─▶ FanoutDispatcher ──▶ registry ──▶ outbound queues
//! transport writer ◀──ServerEvent── outbound queue
//! ```

mod handlers;
pub mod sealer;

use handlers::Outcome;
pub use sealer::MessageSealer;

use crate::auth::{Authenticator, ServerRateLimits, StrikeCounter};
use crate::fanout::{FanoutDispatcher, SEND_TIMEOUT};
use crate::peer::PeerConnectionManager;
use crate::registry::{next_connection_id, ConnectionHandle, ConnectionId, SessionRegistry};
use crate::store::Store;
use sixin_core::{ClientEvent, ServerEvent, SixinError, SixinResult, TransportKind, UserId};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default idle timeout: 30 minutes without an inbound event.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default upper bound on a single handler invocation.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    IdleTimeout,
    ProtocolViolations,
}

/// What a transport reader hands to the gateway.
#[derive(Debug)]
pub enum Inbound {
    Event(ClientEvent),
    /// A frame that could not be decoded into an event.
    Malformed(SixinError),
}

/// One live transport session, owned by the task serving it.
pub struct Connection {
    pub id: ConnectionId,
    pub kind: TransportKind,
    pub remote: IpAddr,
    state: ConnState,
    user: Option<UserId>,
    created_at: Instant,
    last_activity: Instant,
    strikes: StrikeCounter,
    handle: Option<ConnectionHandle>,
}

impl Connection {
    fn new(kind: TransportKind, remote: IpAddr) -> Self {
        let now = Instant::now();
        Self {
            id: next_connection_id(),
            kind,
            remote,
            state: ConnState::Connecting,
            user: None,
            created_at: now,
            last_activity: now,
            strikes: StrikeCounter::default(),
            handle: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Process-wide device toggles and pairing code pushed in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceState {
    receive: bool,
    email: bool,
    qrcode: Option<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            receive: true,
            email: false,
            qrcode: None,
        }
    }
}

pub struct Gateway {
    registry: Arc<SessionRegistry>,
    peers: Arc<PeerConnectionManager>,
    fanout: Arc<FanoutDispatcher>,
    store: Arc<dyn Store>,
    authenticator: Arc<dyn Authenticator>,
    rate_limits: Mutex<ServerRateLimits>,
    device: RwLock<DeviceState>,
    sealer: Option<MessageSealer>,
    idle_timeout: Duration,
    handler_timeout: Duration,
}

impl Gateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        peers: Arc<PeerConnectionManager>,
        fanout: Arc<FanoutDispatcher>,
        store: Arc<dyn Store>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            registry,
            peers,
            fanout,
            store,
            authenticator,
            rate_limits: Mutex::new(ServerRateLimits::default()),
            device: RwLock::new(DeviceState::default()),
            sealer: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            handler_timeout: HANDLER_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_handler_timeout(mut self, handler_timeout: Duration) -> Self {
        self.handler_timeout = handler_timeout;
        self
    }

    pub fn with_sealer(mut self, sealer: MessageSealer) -> Self {
        self.sealer = Some(sealer);
        self
    }

    /// Pairing code advertised to every connection on activation.
    pub async fn set_pairing_code(&self, code: Option<String>) {
        self.device.write().await.qrcode = code;
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Begin tracking a freshly accepted socket.
    pub fn accept(&self, kind: TransportKind, remote: IpAddr) -> Connection {
        let mut conn = Connection::new(kind, remote);
        conn.state = ConnState::Authenticating;
        debug!(conn_id = conn.id, ?kind, %remote, "connection accepted");
        conn
    }

    /// Validate the bearer token. On failure the connection is `Closed` and
    /// must be dropped by the transport after reporting the error.
    pub async fn authenticate(&self, conn: &mut Connection, token: &str) -> SixinResult<UserId> {
        if conn.state != ConnState::Authenticating {
            return Err(SixinError::Protocol("connection is not awaiting authentication".into()));
        }

        if !self.rate_limits.lock().await.auth_allowed(&conn.remote) {
            conn.state = ConnState::Closed;
            warn!(conn_id = conn.id, remote = %conn.remote, "auth rate limited");
            return Err(SixinError::Authentication(
                "too many failed attempts, try again later".into(),
            ));
        }

        match self.authenticator.authenticate(token) {
            Ok(user) => {
                conn.user = Some(user);
                info!(conn_id = conn.id, user_id = user, "authenticated");
                Ok(user)
            }
            Err(e) => {
                self.rate_limits.lock().await.record_auth_failure(conn.remote);
                conn.state = ConnState::Closed;
                warn!(conn_id = conn.id, remote = %conn.remote, error = %e, "authentication failed");
                Err(match e {
                    SixinError::Authentication(_) => e,
                    other => SixinError::Authentication(other.to_string()),
                })
            }
        }
    }

    /// Register an authenticated connection and queue its initial snapshot.
    ///
    /// Returns the outbound queue the transport writer must drain.
    pub async fn activate(&self, conn: &mut Connection) -> SixinResult<mpsc::Receiver<ServerEvent>> {
        let user = match (conn.state, conn.user) {
            (ConnState::Authenticating, Some(user)) => user,
            _ => return Err(SixinError::Protocol("connection is not authenticated".into())),
        };

        let (handle, outbound) = ConnectionHandle::channel(conn.id, conn.kind);
        self.registry.register(user, handle.clone()).await;
        conn.handle = Some(handle);
        conn.state = ConnState::Active;
        conn.last_activity = Instant::now();

        let device = self.device.read().await.clone();
        let profile = match self.store.ensure_user(user).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(conn_id = conn.id, user_id = user, error = %e, "profile lookup failed");
                None
            }
        };

        self.reply(conn, ServerEvent::Receive(device.receive)).await;
        self.reply(conn, ServerEvent::Email(device.email)).await;
        self.reply(conn, ServerEvent::SelfProfile(profile)).await;
        if let Some(code) = device.qrcode {
            self.reply(conn, ServerEvent::Qrcode(code)).await;
        }

        Ok(outbound)
    }

    /// Process inbound traffic until the connection ends, then clean up.
    ///
    /// Only delivered events count as activity; transport heartbeats never
    /// reach this loop.
    pub async fn run(&self, mut conn: Connection, mut inbound: mpsc::Receiver<Inbound>) -> CloseReason {
        let reason = loop {
            let next = tokio::time::timeout(self.idle_timeout, inbound.recv()).await;
            match next {
                Ok(Some(item)) => {
                    if let Some(reason) = self.dispatch(&mut conn, item).await {
                        break reason;
                    }
                }
                Ok(None) => break CloseReason::ClientDisconnect,
                Err(_) => {
                    info!(conn_id = conn.id, idle_secs = conn.idle_for().as_secs(), "idle timeout");
                    break CloseReason::IdleTimeout;
                }
            }
        };
        self.close(&mut conn, reason).await;
        reason
    }

    /// Route one inbound item. Returns a close reason when the connection
    /// must be dropped.
    pub async fn dispatch(&self, conn: &mut Connection, item: Inbound) -> Option<CloseReason> {
        if conn.state != ConnState::Active {
            return Some(CloseReason::ClientDisconnect);
        }
        conn.last_activity = Instant::now();

        let result = match item {
            Inbound::Event(event) => {
                let name = event.name();
                debug!(conn_id = conn.id, event = name, "event received");
                match tokio::time::timeout(self.handler_timeout, self.handle_event(conn, event)).await {
                    Ok(Ok(outcome)) => {
                        self.emit(conn, outcome).await;
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => {
                        warn!(conn_id = conn.id, event = name, "handler timed out");
                        Err(SixinError::Timeout)
                    }
                }
            }
            Inbound::Malformed(e) => Err(e),
        };

        let Err(e) = result else {
            return None;
        };

        debug!(conn_id = conn.id, error = %e, "event failed");
        self.reply(conn, ServerEvent::Error(e.client_message())).await;

        if e.is_protocol_violation() && !conn.strikes.strike() {
            warn!(conn_id = conn.id, user_id = ?conn.user, "too many protocol errors, disconnecting");
            return Some(CloseReason::ProtocolViolations);
        }
        None
    }

    /// Tear down everything tied to the connection. Idempotent.
    pub async fn close(&self, conn: &mut Connection, reason: CloseReason) {
        if conn.state == ConnState::Closed {
            return;
        }
        conn.state = ConnState::Closing;

        let peer = self.peers.cleanup(conn.id).await;
        if let Some(user) = conn.user {
            self.registry.unregister(user, conn.id).await;
        }
        conn.handle = None;
        conn.state = ConnState::Closed;

        info!(
            conn_id = conn.id,
            user_id = ?conn.user,
            ?reason,
            ?peer,
            lifetime_secs = conn.created_at.elapsed().as_secs(),
            "connection closed"
        );
    }

    /// Periodic housekeeping for the auth limiter.
    pub async fn gc(&self) {
        self.rate_limits.lock().await.gc();
    }

    /// Send what a handler produced. Runs to completion: every fan-out
    /// target is attempted.
    async fn emit(&self, conn: &Connection, outcome: Outcome) {
        match outcome {
            Outcome::Done => {}
            Outcome::Reply(event) => self.reply(conn, event).await,
            Outcome::Fanout { event, recipients } => {
                let report = self.fanout.dispatch(&event, &recipients).await;
                if report.failed > 0 {
                    debug!(conn_id = conn.id, event = event.name(), failed = report.failed, "partial fan-out");
                }
            }
        }
    }

    /// Queue an event for this connection only.
    async fn reply(&self, conn: &Connection, event: ServerEvent) {
        let Some(handle) = &conn.handle else {
            return;
        };
        if let Err(e) = handle.tx.send_timeout(event, SEND_TIMEOUT).await {
            debug!(conn_id = conn.id, error = %e, "reply dropped");
        }
    }

    /// The user behind `conn`, as bound in the registry. Client-supplied
    /// identities are never trusted.
    async fn acting_user(&self, conn: &Connection) -> SixinResult<UserId> {
        self.registry
            .user_for(conn.id)
            .await
            .ok_or_else(|| SixinError::Protocol("connection is not registered".into()))
    }
}
