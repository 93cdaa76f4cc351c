//! Relay Coordinator
//!
//! Routes signaling messages, download requests, channel closures and expiry
//! to the task owning each session. Every session runs its own
//! [`SessionTask`](session_task::SessionTask) fed by a bounded queue, so
//! events for one code are handled one at a time in arrival order while
//! distinct sessions proceed in parallel.

pub mod events;
pub mod progress;
mod session_task;

pub use events::{SessionEvent, Teardown};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::code::RandomCodeGenerator;
use crate::config::{RelayConfig, RelaySettings, StorageSettings};
use crate::connections::{ConnectionTable, Outbound};
use crate::errors::{RelayError, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{FileBackend, MemoryBackend, SessionBackend, SessionRegistry};
use crate::sink::DownloadBody;
use crate::types::{ConnectionId, PickupCode};
use session_task::SessionTask;

/// Live session tasks and the sessions each connection takes part in
#[derive(Debug, Default)]
pub struct SessionDirectory {
    tasks: DashMap<PickupCode, mpsc::Sender<SessionEvent>>,
    memberships: DashMap<ConnectionId, HashSet<PickupCode>>,
}

impl SessionDirectory {
    fn task(&self, code: &PickupCode) -> Option<mpsc::Sender<SessionEvent>> {
        self.tasks.get(code).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove_task(&self, code: &PickupCode) {
        self.tasks.remove(code);
    }

    pub(crate) fn add_membership(&self, conn: ConnectionId, code: &PickupCode) {
        self.memberships.entry(conn).or_default().insert(code.clone());
    }

    pub(crate) fn remove_membership(&self, conn: ConnectionId, code: &PickupCode) {
        self.memberships.remove_if_mut(&conn, |_, codes| {
            codes.remove(code);
            codes.is_empty()
        });
    }

    pub(crate) fn has_memberships(&self, conn: ConnectionId) -> bool {
        self.memberships.contains_key(&conn)
    }

    fn take_memberships(&self, conn: ConnectionId) -> HashSet<PickupCode> {
        self.memberships
            .remove(&conn)
            .map(|(_, codes)| codes)
            .unwrap_or_default()
    }
}

/// Entry point for transports
#[derive(Clone)]
pub struct RelayCoordinator {
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionTable>,
    directory: Arc<SessionDirectory>,
    settings: RelaySettings,
    event_queue_capacity: usize,
}

impl RelayCoordinator {
    pub fn new(registry: SessionRegistry, config: &RelayConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            connections: Arc::new(ConnectionTable::new()),
            directory: Arc::new(SessionDirectory::default()),
            settings: config.relay.clone(),
            event_queue_capacity: config.session.event_queue_capacity.max(1),
        }
    }

    /// Build the registry described by `config` and purge stale sessions
    pub async fn from_config(config: &RelayConfig) -> Result<Self> {
        let backend: Arc<dyn SessionBackend> = match &config.storage {
            StorageSettings::Memory => Arc::new(MemoryBackend::new()),
            StorageSettings::File { path } => Arc::new(FileBackend::new(path)),
        };
        let codes = Arc::new(RandomCodeGenerator::from_settings(&config.session)?);
        info!(
            "Using {} session backend with {} possible pickup codes",
            backend.name(),
            codes.code_space()
        );

        let registry = SessionRegistry::new(backend, codes, config.session.max_code_attempts);
        let coordinator = Self::new(registry, config);
        coordinator.purge_restored().await?;
        Ok(coordinator)
    }

    /// Restored sessions have no live channels, and a lost sender is fatal
    async fn purge_restored(&self) -> Result<usize> {
        let restored = self.registry.recover().await?;
        for session in &restored {
            self.registry.delete(&session.code).await?;
        }
        if !restored.is_empty() {
            info!("Purged {} sessions left over from a previous run", restored.len());
        }
        Ok(restored.len())
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Register a new signaling channel
    pub fn open_connection(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (conn, rx) = self.connections.register();
        debug!("Signaling channel {} opened", conn);
        (conn, rx)
    }

    /// Parse and handle one text frame; malformed frames are dropped
    pub async fn handle_text(&self, conn: ConnectionId, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(conn, message).await,
            Err(e) => warn!("Dropping malformed frame from {}: {}", conn, e),
        }
    }

    pub async fn handle_message(&self, conn: ConnectionId, message: ClientMessage) {
        let Some(code) = message.pickup_code().cloned() else {
            self.create_session(conn).await;
            return;
        };

        let is_join = matches!(message, ClientMessage::JoinSession { .. });
        if self.dispatch(&code, SessionEvent::Client { conn, message }).await {
            return;
        }

        let err = RelayError::InvalidCode(code.clone());
        warn!("{} from {}: {}", if is_join { "Join" } else { "Message" }, conn, err);
        if is_join {
            self.connections.send(conn, ServerMessage::join_failed(code, &err));
            if !self.directory.has_memberships(conn) {
                self.connections.close(conn);
            }
        } else {
            self.connections.send(conn, ServerMessage::error(Some(code), &err));
        }
    }

    async fn create_session(&self, conn: ConnectionId) {
        let code = match self.registry.create(conn).await {
            Ok(code) => code,
            Err(e) => {
                warn!("Failed to create session for {}: {}", conn, e);
                self.connections.send(conn, ServerMessage::CreateSessionResponse {
                    success: false,
                    pickup_code: None,
                    message: Some(e.to_string()),
                });
                return;
            }
        };

        let (tx, rx) = mpsc::channel(self.event_queue_capacity);
        self.directory.tasks.insert(code.clone(), tx);
        let task = SessionTask::new(
            code.clone(),
            self.registry.clone(),
            self.connections.clone(),
            self.directory.clone(),
            self.settings.clone(),
            rx,
        );
        tokio::spawn(task.run());

        self.directory.add_membership(conn, &code);
        info!("Session {} created by {}", code, conn);
        self.connections.send(conn, ServerMessage::CreateSessionResponse {
            success: true,
            pickup_code: Some(code.clone()),
            message: None,
        });

        // The channel may have closed before its membership was visible
        if !self.connections.is_open(conn) {
            self.dispatch(&code, SessionEvent::ChannelClosed { conn }).await;
        }
    }

    /// Queue an event for a session's task; false if no such task
    async fn dispatch(&self, code: &PickupCode, event: SessionEvent) -> bool {
        match self.directory.task(code) {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Attach the receiver's download stream to a session
    pub async fn open_download(&self, code: &PickupCode) -> Result<DownloadBody> {
        let (reply, response) = oneshot::channel();
        if !self.dispatch(code, SessionEvent::OpenDownload { reply }).await {
            return Err(RelayError::InvalidCode(code.clone()));
        }
        response
            .await
            .unwrap_or_else(|_| Err(RelayError::InvalidCode(code.clone())))
    }

    /// Unregister a channel and notify every session it took part in
    pub async fn connection_closed(&self, conn: ConnectionId) {
        self.connections.unregister(conn);
        let codes = self.directory.take_memberships(conn);
        debug!("Signaling channel {} closed ({} sessions)", conn, codes.len());
        for code in codes {
            self.dispatch(&code, SessionEvent::ChannelClosed { conn }).await;
        }
    }

    /// Expire sessions idle since before `cutoff`; returns how many were flagged
    pub async fn expire_idle(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let idle = self.registry.idle_since(cutoff).await?;
        let mut expired = 0;
        for code in idle {
            if self.dispatch(&code, SessionEvent::Expire { cutoff }).await {
                expired += 1;
            } else if self.registry.delete(&code).await?.is_some() {
                // No task owns it; remove directly under the registry's key lock
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memberships() {
        let directory = SessionDirectory::default();
        let conn = ConnectionId::new();
        let first = PickupCode::from("AAAAAA");
        let second = PickupCode::from("BBBBBB");

        directory.add_membership(conn, &first);
        directory.add_membership(conn, &second);
        directory.remove_membership(conn, &first);
        assert!(directory.has_memberships(conn));

        directory.remove_membership(conn, &second);
        assert!(!directory.has_memberships(conn));

        directory.add_membership(conn, &first);
        assert_eq!(directory.take_memberships(conn).len(), 1);
        assert!(directory.take_memberships(conn).is_empty());
    }

    #[tokio::test]
    async fn test_from_config_purges_restored_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let mut config = RelayConfig::default();
        config.storage = StorageSettings::File { path: path.clone() };

        let first = RelayCoordinator::from_config(&config).await.unwrap();
        let (conn, mut rx) = first.open_connection();
        first.handle_message(conn, ClientMessage::CreateSession {}).await;
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Message(ServerMessage::CreateSessionResponse { success: true, .. }))
        ));
        assert_eq!(first.active_sessions(), 1);

        let second = RelayCoordinator::from_config(&config).await.unwrap();
        assert_eq!(second.active_sessions(), 0);
        let persisted = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(persisted.trim(), "[]");
    }

    #[tokio::test]
    async fn test_unknown_code_is_reported() {
        let coordinator = RelayCoordinator::new(
            SessionRegistry::in_memory(Arc::new(RandomCodeGenerator::default())),
            &RelayConfig::default(),
        );
        let (conn, mut rx) = coordinator.open_connection();
        coordinator
            .handle_text(conn, r#"{"type":"download-complete","data":{"pickupCode":"ZZ99ZZ"}}"#)
            .await;
        match rx.recv().await {
            Some(Outbound::Message(ServerMessage::Error { kind, .. })) => {
                assert_eq!(kind, crate::errors::ErrorKind::InvalidCode)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            coordinator.open_download(&PickupCode::from("ZZ99ZZ")).await,
            Err(RelayError::InvalidCode(_))
        ));
    }
}
