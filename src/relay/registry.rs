//! Server-side session registry
//!
//! Multiplexes named sessions identified by 6-digit join codes. Each
//! connection registers an outbound event sender; everything else flows
//! through a single `handle_event` dispatch point, so tests can feed a
//! sequence of synthetic messages and assert the resulting state.
//!
//! The registry owns all session state exclusively; clients never mutate
//! it directly, only via request/response events.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::protocol::{BreathData, ClientEvent, ConnId, ServerEvent, SessionCode, Snapshot};

/// Statistics about registry state (snapshot from atomic counters).
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub connections: usize,
    pub sessions_active: usize,
    pub sessions_created: u64,
    pub events_forwarded: u64,
    pub events_dropped: u64,
}

/// Lock-free counters, snapshotted for reporting.
struct AtomicStats {
    sessions_created: AtomicU64,
    events_forwarded: AtomicU64,
    events_dropped: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            sessions_created: AtomicU64::new(0),
            events_forwarded: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }
}

/// Role a connection currently holds. Mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnRole {
    Idle,
    Producer(SessionCode),
    Listener(SessionCode),
}

struct ConnState {
    tx: mpsc::UnboundedSender<ServerEvent>,
    role: ConnRole,
}

struct Session {
    producer: ConnId,
    listeners: HashSet<ConnId>,
}

/// Connections and sessions live under one lock so role transitions and
/// session teardown stay atomic.
struct State {
    conns: HashMap<ConnId, ConnState>,
    sessions: HashMap<SessionCode, Session>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            conns: HashMap::new(),
            sessions: HashMap::new(),
        }
    }
}

struct Inner {
    state: RwLock<State>,
    stats: AtomicStats,
    next_conn_id: AtomicU64,
}

/// The relay server's session registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                stats: AtomicStats::new(),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new connection with its outbound event sender.
    pub async fn register(&self, tx: mpsc::UnboundedSender<ServerEvent>) -> ConnId {
        let conn = ConnId(self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.inner.state.write().await;
        state.conns.insert(
            conn,
            ConnState {
                tx,
                role: ConnRole::Idle,
            },
        );
        info!(%conn, "Connection registered");
        conn
    }

    /// Remove a connection, releasing any role it held. A disconnecting
    /// producer ends its session; a disconnecting listener leaves it.
    pub async fn disconnect(&self, conn: ConnId) {
        let mut state = self.inner.state.write().await;
        release_role(&mut state, conn);
        if state.conns.remove(&conn).is_some() {
            info!(%conn, "Connection closed");
        }
    }

    /// Single dispatch point for all inbound client events.
    pub async fn handle_event(&self, conn: ConnId, event: ClientEvent) {
        match event {
            ClientEvent::CreateSession => self.create_session(conn).await,
            ClientEvent::JoinSession { code } => self.join_session(conn, code).await,
            ClientEvent::LeaveSession | ClientEvent::EndSession => {
                let mut state = self.inner.state.write().await;
                release_role(&mut state, conn);
            }
            ClientEvent::BreathData(data) => self.forward_breath_data(conn, data).await,
            ClientEvent::SessionSnapshot { to, snapshot } => {
                self.forward_snapshot(conn, to, snapshot).await
            }
        }
    }

    /// Current registry statistics.
    pub async fn stats(&self) -> RegistryStats {
        let state = self.inner.state.read().await;
        RegistryStats {
            connections: state.conns.len(),
            sessions_active: state.sessions.len(),
            sessions_created: self.inner.stats.sessions_created.load(Ordering::Relaxed),
            events_forwarded: self.inner.stats.events_forwarded.load(Ordering::Relaxed),
            events_dropped: self.inner.stats.events_dropped.load(Ordering::Relaxed),
        }
    }

    async fn create_session(&self, conn: ConnId) {
        let mut state = self.inner.state.write().await;
        if !state.conns.contains_key(&conn) {
            return;
        }
        // A connection can hold only one role; an existing one is released
        // first (a producer re-creating ends its previous session).
        release_role(&mut state, conn);

        let code = fresh_code(&state);
        state.sessions.insert(
            code.clone(),
            Session {
                producer: conn,
                listeners: HashSet::new(),
            },
        );
        if let Some(c) = state.conns.get_mut(&conn) {
            c.role = ConnRole::Producer(code.clone());
        }
        self.inner
            .stats
            .sessions_created
            .fetch_add(1, Ordering::Relaxed);
        info!(%conn, code = %code, "Session created");
        send_to(&state, conn, ServerEvent::SessionCreated { code });
    }

    async fn join_session(&self, conn: ConnId, code: SessionCode) {
        let mut state = self.inner.state.write().await;
        if !state.conns.contains_key(&conn) {
            return;
        }
        // Validate before touching the joiner's current role: a rejected
        // join must leave an existing producer session intact.
        if !state.sessions.contains_key(&code) {
            debug!(%conn, code = %code, "Join rejected: unknown code");
            send_to(
                &state,
                conn,
                ServerEvent::JoinError {
                    message: format!("no active session with code {}", code),
                },
            );
            return;
        }
        release_role(&mut state, conn);

        let producer = match state.sessions.get_mut(&code) {
            Some(session) => {
                session.listeners.insert(conn);
                session.producer
            }
            // The joiner was this session's own producer; releasing the
            // role tore the session down.
            None => {
                send_to(
                    &state,
                    conn,
                    ServerEvent::JoinError {
                        message: format!("no active session with code {}", code),
                    },
                );
                return;
            }
        };

        if let Some(c) = state.conns.get_mut(&conn) {
            c.role = ConnRole::Listener(code.clone());
        }
        info!(%conn, code = %code, "Listener joined");
        send_to(&state, conn, ServerEvent::Joined { code });
        // Tell the producer, and ask it to back-fill the newcomer so the
        // chart isn't empty until the next periodic broadcast.
        send_to(&state, producer, ServerEvent::ListenerJoined { listener: conn });
        send_to(&state, producer, ServerEvent::RequestSnapshot { to: conn });
    }

    async fn forward_breath_data(&self, conn: ConnId, data: BreathData) {
        let state = self.inner.state.read().await;
        let session = match state.sessions.get(&data.code) {
            Some(s) if s.producer == conn => s,
            _ => {
                // Not the bound producer of this code (or no such session):
                // drop, never crash.
                self.inner.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%conn, code = %data.code, "Dropping breath data from non-producer");
                return;
            }
        };
        // Broadcasting with zero audience is normal, not an error.
        for &listener in &session.listeners {
            send_to(&state, listener, ServerEvent::BreathData(data.clone()));
        }
        self.inner
            .stats
            .events_forwarded
            .fetch_add(session.listeners.len() as u64, Ordering::Relaxed);
    }

    async fn forward_snapshot(&self, conn: ConnId, to: Option<ConnId>, snapshot: Snapshot) {
        let state = self.inner.state.read().await;
        let session = match state
            .conns
            .get(&conn)
            .map(|c| &c.role)
        {
            Some(ConnRole::Producer(code)) => match state.sessions.get(code) {
                Some(s) => s,
                None => return,
            },
            _ => {
                self.inner.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%conn, "Dropping snapshot from non-producer");
                return;
            }
        };
        match to {
            Some(target) if session.listeners.contains(&target) => {
                send_to(&state, target, ServerEvent::SessionSnapshot { snapshot });
                self.inner.stats.events_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Some(target) => {
                debug!(%conn, %target, "Snapshot target is not a listener of this session");
                self.inner.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                for &listener in &session.listeners {
                    send_to(
                        &state,
                        listener,
                        ServerEvent::SessionSnapshot {
                            snapshot: snapshot.clone(),
                        },
                    );
                }
                self.inner
                    .stats
                    .events_forwarded
                    .fetch_add(session.listeners.len() as u64, Ordering::Relaxed);
            }
        }
    }
}

/// Release whatever role `conn` holds. Producer release destroys the
/// session and notifies all listeners; listener release notifies the
/// producer and leaves the session intact.
fn release_role(state: &mut State, conn: ConnId) {
    let role = match state.conns.get_mut(&conn) {
        Some(c) => std::mem::replace(&mut c.role, ConnRole::Idle),
        None => return,
    };
    match role {
        ConnRole::Idle => {}
        ConnRole::Producer(code) => {
            if let Some(session) = state.sessions.remove(&code) {
                info!(code = %code, listeners = session.listeners.len(), "Session ended");
                for listener in session.listeners {
                    if let Some(c) = state.conns.get_mut(&listener) {
                        c.role = ConnRole::Idle;
                    }
                    send_to(
                        state,
                        listener,
                        ServerEvent::SessionEnded { code: code.clone() },
                    );
                }
            }
        }
        ConnRole::Listener(code) => {
            if let Some(session) = state.sessions.get_mut(&code) {
                session.listeners.remove(&conn);
                let producer = session.producer;
                debug!(%conn, code = %code, "Listener left");
                send_to(state, producer, ServerEvent::ListenerLeft { listener: conn });
            }
        }
    }
}

/// Allocate a code not currently bound to any session.
fn fresh_code(state: &State) -> SessionCode {
    let mut rng = rand::thread_rng();
    loop {
        let code = SessionCode::random(&mut rng);
        if !state.sessions.contains_key(&code) {
            return code;
        }
    }
}

fn send_to(state: &State, conn: ConnId, event: ServerEvent) {
    if let Some(c) = state.conns.get(&conn) {
        if c.tx.send(event).is_err() {
            // Receiver gone; the disconnect path will clean up.
            warn!(%conn, "Outbound channel closed");
        }
    }
}
