//! Session registry: every EA known to the broker, connected or not.
//!
//! Sessions are keyed by (userId, role, eaId) and survive disconnects as
//! Offline entries so cached snapshots and copy state outlive a flaky link.
//! The handshake's reserve/commit protocol lives here too: a connection
//! reserves its identity before any async validation, so two racing sockets
//! claiming the same EA can never both win.

pub mod handle;
pub mod handshake;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::protocol::{EaRole, PendingOrder, Position};
pub use handle::{ConnHandle, WriterCmd};

const MAX_CACHED_ERRORS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub user_id: String,
    pub role: EaRole,
    pub ea_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected under the NO_USER placeholder, not yet claimed an identity.
    Unvalidated,
    /// Handshake in flight.
    Validating,
    Online,
    Offline,
}

#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,
    pub state: SessionState,
    pub handle: Option<ConnHandle>,
    /// Connection id that has reserved this identity mid-handshake.
    pub reserved_conn: Option<u64>,
    pub account_number: Option<String>,
    pub broker: Option<String>,
    pub symbol: Option<String>,
    pub enabled: bool,
    pub blocked: bool,
    pub settings: Value,
    pub account_info: Option<Value>,
    pub trades_live: Option<LiveTrades>,
    pub trades_history: Option<Vec<Value>>,
    pub last_status: Option<String>,
    pub last_tick: Option<Value>,
    pub broker_time: Option<String>,
    pub errors: VecDeque<Value>,
    pub last_seen: Instant,
    pub connected_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct LiveTrades {
    pub positions: Vec<Position>,
    pub orders: Vec<PendingOrder>,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            state: SessionState::Validating,
            handle: None,
            reserved_conn: None,
            account_number: None,
            broker: None,
            symbol: None,
            enabled: true,
            blocked: false,
            settings: Value::Null,
            account_info: None,
            trades_live: None,
            trades_history: None,
            last_status: None,
            last_tick: None,
            broker_time: None,
            errors: VecDeque::new(),
            last_seen: Instant::now(),
            connected_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(ConnHandle::is_alive)
    }

    pub fn push_error(&mut self, err: Value) {
        if self.errors.len() >= MAX_CACHED_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(err);
    }
}

/// Read-only snapshot handed to the scheduler and status surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub user_id: String,
    pub role: EaRole,
    pub ea_id: String,
    pub state: SessionState,
    pub connected: bool,
    pub enabled: bool,
    pub account_number: Option<String>,
    #[serde(skip)]
    pub handle: Option<ConnHandle>,
    #[serde(skip)]
    pub trades_live: Option<LiveTrades>,
    #[serde(skip)]
    pub settings: Value,
}

#[derive(Debug)]
pub enum ReserveOutcome {
    Reserved,
    /// Another connection is mid-handshake for this identity.
    Busy,
}

#[derive(Debug)]
pub enum DuplicateCheck {
    /// No live peer holds this identity; any dead holder has been displaced.
    Clear,
    /// A live connection already owns this identity.
    AliveElsewhere,
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<SessionKey, Session>,
    by_conn: HashMap<u64, SessionKey>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step 1 of the handshake: claim the identity before any async I/O.
    /// Existing session fields are left untouched until commit.
    pub async fn reserve(&self, key: &SessionKey, conn_id: u64) -> ReserveOutcome {
        let mut inner = self.inner.write().await;
        match inner.by_key.get_mut(key) {
            Some(session) => {
                if session.reserved_conn.is_some_and(|c| c != conn_id) {
                    return ReserveOutcome::Busy;
                }
                session.reserved_conn = Some(conn_id);
                ReserveOutcome::Reserved
            }
            None => {
                let mut session = Session::new(key.clone());
                session.reserved_conn = Some(conn_id);
                inner.by_key.insert(key.clone(), session);
                ReserveOutcome::Reserved
            }
        }
    }

    /// Is a live connection (other than `conn_id`) already bound to this key?
    /// A dead holder is displaced on the spot so the newcomer can take over.
    pub async fn duplicate_check(&self, key: &SessionKey, conn_id: u64) -> DuplicateCheck {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.by_key.get_mut(key) else {
            return DuplicateCheck::Clear;
        };
        let holder = session
            .handle
            .as_ref()
            .filter(|h| h.id != conn_id)
            .map(|h| (h.id, h.is_alive()));
        match holder {
            Some((_, true)) => DuplicateCheck::AliveElsewhere,
            Some((old_conn, false)) => {
                debug!(ea_id = %key.ea_id, old_conn, "displacing dead holder");
                session.handle = None;
                session.state = SessionState::Offline;
                inner.by_conn.remove(&old_conn);
                DuplicateCheck::Clear
            }
            None => DuplicateCheck::Clear,
        }
    }

    /// Does a live session of the opposite role exist for this
    /// (userId, accountNumber) pair?
    pub async fn account_conflict(
        &self,
        user_id: &str,
        role: EaRole,
        account_number: &str,
    ) -> bool {
        let inner = self.inner.read().await;
        inner.by_key.values().any(|s| {
            s.key.user_id == user_id
                && s.key.role == role.opposite()
                && s.account_number.as_deref() == Some(account_number)
                && s.is_connected()
        })
    }

    /// Final handshake step: bind the connection handle and go Online.
    pub async fn commit(
        &self,
        key: &SessionKey,
        conn_id: u64,
        handle: ConnHandle,
        account_number: Option<String>,
        broker: Option<String>,
        symbol: Option<String>,
    ) {
        let mut inner = self.inner.write().await;
        // The same socket may have been bound to a placeholder key first.
        if let Some(old_key) = inner.by_conn.remove(&conn_id) {
            if &old_key != key {
                inner.by_key.remove(&old_key);
            }
        }
        inner.by_conn.insert(conn_id, key.clone());
        if let Some(session) = inner.by_key.get_mut(key) {
            session.reserved_conn = None;
            session.handle = Some(handle);
            session.state = SessionState::Online;
            session.account_number = account_number;
            session.broker = broker;
            session.symbol = symbol;
            session.last_seen = Instant::now();
            session.connected_at = Some(Instant::now());
            info!(
                user_id = %key.user_id,
                role = key.role.as_str(),
                ea_id = %key.ea_id,
                conn_id,
                "session online"
            );
        }
    }

    /// Undo a reservation after a failed handshake. A connection that never
    /// held the reservation (its reserve lost the race) must not touch the
    /// winner's in-flight entry. Only never-committed entries are removed;
    /// an Offline session with history is left in place.
    pub async fn abort_reservation(&self, key: &SessionKey, conn_id: u64) {
        let mut inner = self.inner.write().await;
        let remove = match inner.by_key.get_mut(key) {
            Some(session) if session.reserved_conn == Some(conn_id) => {
                session.reserved_conn = None;
                session.state == SessionState::Validating && session.handle.is_none()
            }
            _ => false,
        };
        if remove {
            inner.by_key.remove(key);
        }
    }

    /// Bind a connection that has not sent hello yet under the NO_USER
    /// placeholder so pre-handshake messages still have a session to land in.
    pub async fn bind_unvalidated(&self, conn_id: u64, handle: ConnHandle) {
        let key = SessionKey {
            user_id: "NO_USER".to_string(),
            role: EaRole::Prop,
            ea_id: format!("conn-{conn_id}"),
        };
        let mut inner = self.inner.write().await;
        let mut session = Session::new(key.clone());
        session.state = SessionState::Unvalidated;
        session.handle = Some(handle);
        inner.by_conn.insert(conn_id, key.clone());
        inner.by_key.insert(key, session);
    }

    /// Run `f` against the session currently bound to `conn_id`.
    pub async fn with_session_by_conn<F, T>(&self, conn_id: u64, f: F) -> Option<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        let mut inner = self.inner.write().await;
        let key = inner.by_conn.get(&conn_id)?.clone();
        inner.by_key.get_mut(&key).map(f)
    }

    pub async fn key_for_conn(&self, conn_id: u64) -> Option<SessionKey> {
        self.inner.read().await.by_conn.get(&conn_id).cloned()
    }

    /// Reader loop ended. Placeholder sessions are discarded; validated ones
    /// flip Offline and keep their caches. Returns the key that went offline.
    pub async fn mark_conn_disconnected(&self, conn_id: u64) -> Option<SessionKey> {
        let mut inner = self.inner.write().await;
        let key = inner.by_conn.remove(&conn_id)?;
        let Some(session) = inner.by_key.get_mut(&key) else {
            return None;
        };
        // A takeover may have rebound the key to a newer connection.
        if session.handle.as_ref().is_some_and(|h| h.id != conn_id) {
            return None;
        }
        if session.state == SessionState::Unvalidated {
            inner.by_key.remove(&key);
            return None;
        }
        session.handle = None;
        session.state = SessionState::Offline;
        info!(
            user_id = %key.user_id,
            role = key.role.as_str(),
            ea_id = %key.ea_id,
            "session offline"
        );
        Some(key)
    }

    /// Remove a session entirely (clean EA deinit).
    pub async fn purge(&self, key: &SessionKey) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.by_key.remove(key) {
            if let Some(h) = session.handle {
                inner.by_conn.remove(&h.id);
            }
            info!(ea_id = %key.ea_id, "session purged");
        }
    }

    /// Periodic liveness sweep: flip sessions whose socket died without a
    /// clean close, or that went silent past the offline threshold. Silent
    /// placeholder sessions (half-open sockets that never said hello) are
    /// discarded outright so they cannot accumulate.
    pub async fn watchdog_sweep(&self, offline_after: Duration) -> Vec<SessionKey> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let mut went_offline = Vec::new();
        let mut dead_conns = Vec::new();
        let mut reap = Vec::new();
        for (key, session) in inner.by_key.iter_mut() {
            let socket_dead = !session.is_connected();
            let silent = now.duration_since(session.last_seen) > offline_after;
            match session.state {
                SessionState::Online if socket_dead || silent => {
                    if let Some(h) = session.handle.take() {
                        dead_conns.push(h.id);
                    }
                    session.state = SessionState::Offline;
                    went_offline.push(key.clone());
                }
                SessionState::Unvalidated if socket_dead || silent => {
                    debug!(ea_id = %key.ea_id, "reaping silent unvalidated connection");
                    if let Some(h) = session.handle.take() {
                        dead_conns.push(h.id);
                    }
                    reap.push(key.clone());
                }
                _ => {}
            }
        }
        for conn_id in dead_conns {
            inner.by_conn.remove(&conn_id);
        }
        for key in reap {
            inner.by_key.remove(&key);
        }
        went_offline
    }

    fn view(session: &Session) -> SessionView {
        SessionView {
            user_id: session.key.user_id.clone(),
            role: session.key.role,
            ea_id: session.key.ea_id.clone(),
            state: session.state,
            connected: session.is_connected(),
            enabled: session.enabled,
            account_number: session.account_number.clone(),
            handle: session.handle.clone(),
            trades_live: session.trades_live.clone(),
            settings: session.settings.clone(),
        }
    }

    /// Connected controllers for one user, or for all users when `None`.
    pub async fn controller_snapshots(&self, user_id: Option<&str>) -> Vec<SessionView> {
        let inner = self.inner.read().await;
        inner
            .by_key
            .values()
            .filter(|s| {
                s.key.role == EaRole::Controller
                    && s.is_connected()
                    && user_id.is_none_or(|u| s.key.user_id == u)
            })
            .map(Self::view)
            .collect()
    }

    /// Connected, enabled props belonging to one user.
    pub async fn prop_snapshots(&self, user_id: &str) -> Vec<SessionView> {
        let inner = self.inner.read().await;
        inner
            .by_key
            .values()
            .filter(|s| {
                s.key.role == EaRole::Prop
                    && s.key.user_id == user_id
                    && s.is_connected()
                    && s.enabled
                    && !s.blocked
            })
            .map(Self::view)
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.by_key.len()
    }
}
