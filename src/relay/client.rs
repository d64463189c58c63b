//! Client-side relay state machine
//!
//! An explicit tagged state (`Idle | Creating | Joining | Producing |
//! Listening`) replaces scattered role flags, so impossible combinations
//! (producer and listener at once) cannot be represented. All inbound
//! server events flow through one `handle_event` dispatch; the owning
//! orchestrator drains the resulting notices.
//!
//! The previously held role is tracked in durable local state so a
//! reconnecting client can re-establish it: a former producer re-creates
//! (accepting a new code, since the old one is not reserved), a former
//! listener re-joins its remembered code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::RelayError;
use crate::protocol::{
    BreathData, ClientEvent, ConnId, ServerEvent, SessionCode, Snapshot, JOIN_TIMEOUT,
};

/// Where this client currently stands in the session protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    /// Sent `create_session`, awaiting `session_created`
    Creating,
    /// Sent `join_session`, awaiting `joined`/`join_error`
    Joining { code: SessionCode },
    Producing { code: SessionCode },
    Listening { code: SessionCode },
}

/// Role remembered across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum StoredRole {
    Producer,
    Listener { code: SessionCode },
}

/// What the orchestrator should react to after an inbound event or a
/// watchdog check.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    SessionCreated { code: SessionCode },
    Joined { code: SessionCode },
    JoinFailed { message: String },
    /// The join/create watchdog fired; state returned to Idle.
    RequestTimedOut,
    ListenerJoined { listener: ConnId },
    ListenerLeft { listener: ConnId },
    /// The server asked us to back-fill a newly joined listener
    SnapshotRequested { to: ConnId },
    Data(BreathData),
    Snapshot(Snapshot),
    SessionEnded { code: SessionCode },
}

/// Client half of the relay protocol.
pub struct RelayClient {
    state: ClientState,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    /// One-shot watchdog deadline, armed while Creating/Joining
    deadline: Option<Instant>,
    /// Durable role memory; None disables persistence
    store_path: Option<PathBuf>,
}

impl RelayClient {
    pub fn new(outbound: mpsc::UnboundedSender<ClientEvent>, store_path: Option<PathBuf>) -> Self {
        Self {
            state: ClientState::Idle,
            outbound,
            deadline: None,
            store_path,
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Session code if currently producing or listening.
    pub fn session_code(&self) -> Option<&SessionCode> {
        match &self.state {
            ClientState::Producing { code } | ClientState::Listening { code } => Some(code),
            _ => None,
        }
    }

    pub fn is_producing(&self) -> bool {
        matches!(self.state, ClientState::Producing { .. })
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.state, ClientState::Listening { .. })
    }

    /// Deadline for the pending create/join watchdog, if armed.
    pub fn request_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Request a new producer session.
    pub fn create(&mut self) -> Result<(), RelayError> {
        self.send(ClientEvent::CreateSession)?;
        self.state = ClientState::Creating;
        self.deadline = Some(Instant::now() + JOIN_TIMEOUT);
        Ok(())
    }

    /// Request to listen to an existing session.
    pub fn join(&mut self, code: SessionCode) -> Result<(), RelayError> {
        self.send(ClientEvent::JoinSession { code: code.clone() })?;
        self.state = ClientState::Joining { code };
        self.deadline = Some(Instant::now() + JOIN_TIMEOUT);
        Ok(())
    }

    /// Release the current role (listener leaving, or abandoning a
    /// pending request).
    pub async fn leave(&mut self) -> Result<(), RelayError> {
        let result = self.send(ClientEvent::LeaveSession);
        self.state = ClientState::Idle;
        self.deadline = None;
        self.clear_stored_role().await;
        result
    }

    /// Explicitly end the session (producer).
    pub async fn end(&mut self) -> Result<(), RelayError> {
        let result = self.send(ClientEvent::EndSession);
        self.state = ClientState::Idle;
        self.deadline = None;
        self.clear_stored_role().await;
        result
    }

    /// Send live data or a snapshot. Only meaningful while producing.
    pub fn send(&self, event: ClientEvent) -> Result<(), RelayError> {
        self.outbound
            .send(event)
            .map_err(|_| RelayError::NotConnected)
    }

    /// Process one inbound server event, updating state and returning the
    /// notice the orchestrator should act on.
    pub async fn handle_event(&mut self, event: ServerEvent) -> Option<ClientNotice> {
        match event {
            ServerEvent::SessionCreated { code } => {
                self.deadline = None;
                self.state = ClientState::Producing { code: code.clone() };
                self.persist_role(&StoredRole::Producer).await;
                Some(ClientNotice::SessionCreated { code })
            }
            ServerEvent::Joined { code } => {
                self.deadline = None;
                self.state = ClientState::Listening { code: code.clone() };
                self.persist_role(&StoredRole::Listener { code: code.clone() })
                    .await;
                Some(ClientNotice::Joined { code })
            }
            ServerEvent::JoinError { message } => {
                self.deadline = None;
                self.state = ClientState::Idle;
                Some(ClientNotice::JoinFailed { message })
            }
            ServerEvent::ListenerJoined { listener } => {
                if self.is_producing() {
                    Some(ClientNotice::ListenerJoined { listener })
                } else {
                    None
                }
            }
            ServerEvent::ListenerLeft { listener } => {
                if self.is_producing() {
                    Some(ClientNotice::ListenerLeft { listener })
                } else {
                    None
                }
            }
            ServerEvent::RequestSnapshot { to } => {
                if self.is_producing() {
                    Some(ClientNotice::SnapshotRequested { to })
                } else {
                    None
                }
            }
            ServerEvent::BreathData(data) => {
                if self.is_listening() {
                    Some(ClientNotice::Data(data))
                } else {
                    debug!("Dropping breath data while not listening");
                    None
                }
            }
            ServerEvent::SessionSnapshot { snapshot } => {
                if self.is_listening() {
                    Some(ClientNotice::Snapshot(snapshot))
                } else {
                    None
                }
            }
            ServerEvent::SessionEnded { code } => {
                if self.session_code() == Some(&code) {
                    self.state = ClientState::Idle;
                    self.clear_stored_role().await;
                    Some(ClientNotice::SessionEnded { code })
                } else {
                    None
                }
            }
        }
    }

    /// One-shot watchdog: if a create/join request has been pending past
    /// its deadline, return to Idle and surface the timeout exactly once.
    pub fn check_request_timeout(&mut self, now: Instant) -> Option<ClientNotice> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.state = ClientState::Idle;
                Some(ClientNotice::RequestTimedOut)
            }
            _ => None,
        }
    }

    /// After reconnecting, attempt to re-establish the previously held
    /// role from durable state. Returns true if an attempt was started.
    /// Success is silent; failure surfaces through the normal notices.
    pub async fn resume(&mut self) -> Result<bool, RelayError> {
        let Some(role) = self.load_stored_role().await else {
            return Ok(false);
        };
        match role {
            // The old code is not guaranteed reserved; accept a new one.
            StoredRole::Producer => self.create()?,
            StoredRole::Listener { code } => self.join(code)?,
        }
        Ok(true)
    }

    async fn persist_role(&self, role: &StoredRole) {
        let Some(path) = &self.store_path else { return };
        match serde_json::to_vec(role) {
            Ok(bytes) => {
                if let Err(e) = fs::write(path, bytes).await {
                    warn!(path = %path.display(), error = %e, "Failed to persist relay role");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode relay role"),
        }
    }

    async fn clear_stored_role(&self) {
        if let Some(path) = &self.store_path {
            let _ = fs::remove_file(path).await;
        }
    }

    async fn load_stored_role(&self) -> Option<StoredRole> {
        let path = self.store_path.as_ref()?;
        let bytes = fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn client() -> (RelayClient, UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RelayClient::new(tx, None), rx)
    }

    fn code(s: &str) -> SessionCode {
        SessionCode::new(s).unwrap()
    }

    #[tokio::test]
    async fn create_transitions_to_producing() {
        let (mut client, mut rx) = client();
        client.create().unwrap();
        assert_eq!(rx.recv().await, Some(ClientEvent::CreateSession));
        assert_eq!(*client.state(), ClientState::Creating);

        let notice = client
            .handle_event(ServerEvent::SessionCreated { code: code("111111") })
            .await;
        assert_eq!(
            notice,
            Some(ClientNotice::SessionCreated { code: code("111111") })
        );
        assert!(client.is_producing());
        assert_eq!(client.session_code(), Some(&code("111111")));
        assert!(client.request_deadline().is_none());
    }

    #[tokio::test]
    async fn join_accepted_transitions_to_listening() {
        let (mut client, mut rx) = client();
        client.join(code("123456")).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::JoinSession { code: code("123456") })
        );
        assert!(client.request_deadline().is_some());

        let notice = client
            .handle_event(ServerEvent::Joined { code: code("123456") })
            .await;
        assert_eq!(notice, Some(ClientNotice::Joined { code: code("123456") }));
        assert!(client.is_listening());
    }

    #[tokio::test]
    async fn join_error_returns_to_idle() {
        let (mut client, _rx) = client();
        client.join(code("123456")).unwrap();
        let notice = client
            .handle_event(ServerEvent::JoinError {
                message: "nope".into(),
            })
            .await;
        assert_eq!(
            notice,
            Some(ClientNotice::JoinFailed { message: "nope".into() })
        );
        assert_eq!(*client.state(), ClientState::Idle);
        assert!(client.request_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn join_timeout_fires_exactly_once() {
        let (mut client, _rx) = client();
        client.join(code("123456")).unwrap();

        // Not yet expired
        assert_eq!(client.check_request_timeout(Instant::now()), None);

        tokio::time::advance(JOIN_TIMEOUT + std::time::Duration::from_millis(1)).await;
        assert_eq!(
            client.check_request_timeout(Instant::now()),
            Some(ClientNotice::RequestTimedOut)
        );
        assert_eq!(*client.state(), ClientState::Idle);

        // Watchdog is one-shot: a second check never fires again.
        tokio::time::advance(JOIN_TIMEOUT).await;
        assert_eq!(client.check_request_timeout(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn success_disarms_watchdog() {
        let (mut client, _rx) = client();
        client.join(code("123456")).unwrap();
        client
            .handle_event(ServerEvent::Joined { code: code("123456") })
            .await;

        tokio::time::advance(JOIN_TIMEOUT * 2).await;
        assert_eq!(client.check_request_timeout(Instant::now()), None);
        assert!(client.is_listening());
    }

    #[tokio::test]
    async fn data_dropped_unless_listening() {
        let (mut client, _rx) = client();
        let payload = BreathData {
            code: code("123456"),
            t: None,
            breath_in: Some(1),
            breath_out: None,
            bpm: None,
            point: None,
            samples: None,
        };
        assert_eq!(
            client
                .handle_event(ServerEvent::BreathData(payload.clone()))
                .await,
            None
        );

        client.join(code("123456")).unwrap();
        client
            .handle_event(ServerEvent::Joined { code: code("123456") })
            .await;
        assert_eq!(
            client
                .handle_event(ServerEvent::BreathData(payload.clone()))
                .await,
            Some(ClientNotice::Data(payload))
        );
    }

    #[tokio::test]
    async fn session_ended_matches_current_code_only() {
        let (mut client, _rx) = client();
        client.join(code("123456")).unwrap();
        client
            .handle_event(ServerEvent::Joined { code: code("123456") })
            .await;

        assert_eq!(
            client
                .handle_event(ServerEvent::SessionEnded { code: code("999999") })
                .await,
            None
        );
        assert!(client.is_listening());

        assert_eq!(
            client
                .handle_event(ServerEvent::SessionEnded { code: code("123456") })
                .await,
            Some(ClientNotice::SessionEnded { code: code("123456") })
        );
        assert_eq!(*client.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn send_fails_when_channel_closed() {
        let (mut client, rx) = client();
        drop(rx);
        assert!(matches!(client.create(), Err(RelayError::NotConnected)));
    }

    #[tokio::test]
    async fn resume_producer_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("role.json");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = RelayClient::new(tx, Some(path.clone()));
        client.create().unwrap();
        client
            .handle_event(ServerEvent::SessionCreated { code: code("111111") })
            .await;
        rx.recv().await.unwrap();

        // Simulate reconnection with a fresh client over the same store.
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let mut client2 = RelayClient::new(tx2, Some(path));
        assert!(client2.resume().await.unwrap());
        assert_eq!(rx2.recv().await, Some(ClientEvent::CreateSession));
    }

    #[tokio::test]
    async fn resume_listener_rejoins_remembered_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("role.json");

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut client = RelayClient::new(tx, Some(path.clone()));
        client.join(code("424242")).unwrap();
        client
            .handle_event(ServerEvent::Joined { code: code("424242") })
            .await;

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let mut client2 = RelayClient::new(tx2, Some(path));
        assert!(client2.resume().await.unwrap());
        assert_eq!(
            rx2.recv().await,
            Some(ClientEvent::JoinSession { code: code("424242") })
        );
    }

    #[tokio::test]
    async fn resume_without_stored_role_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut client = RelayClient::new(tx, Some(path));
        assert!(!client.resume().await.unwrap());
    }

    #[tokio::test]
    async fn leave_clears_stored_role() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("role.json");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut client = RelayClient::new(tx, Some(path.clone()));
        client.join(code("123456")).unwrap();
        client
            .handle_event(ServerEvent::Joined { code: code("123456") })
            .await;
        assert!(path.exists());

        client.leave().await.unwrap();
        assert!(!path.exists());
        assert_eq!(*client.state(), ClientState::Idle);
    }
}
