//! Core relay types
//!
//! Identifiers, file metadata and the [`Session`] record kept in the
//! registry. The session's transition rules live here so that every mutation
//! applied through the registry goes through the same checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{RelayError, Result};

/// Short human-typeable identifier naming an active session
///
/// Codes are normalized to trimmed upper case when built from strings, so a
/// receiver typing `ab12cd` reaches session `AB12CD`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PickupCode(String);

impl PickupCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for PickupCode {
    fn from(raw: String) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }
}

impl From<&str> for PickupCode {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<PickupCode> for String {
    fn from(code: PickupCode) -> Self {
        code.0
    }
}

impl fmt::Display for PickupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle for one signaling channel
///
/// Sessions store handles, never transports; the handle is resolved to a
/// live channel through the [`ConnectionTable`](crate::connections::ConnectionTable).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque handle for an attached download sink
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SinkId(pub Uuid);

impl SinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// Role of a connection within a session
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// Metadata of the file being transferred
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    /// Size in bytes, 0 when unknown
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Content type to advertise, falling back to a generic binary type
    pub fn content_type_or_default(&self) -> &str {
        match self.content_type.as_deref() {
            Some(ct) if !ct.trim().is_empty() => ct,
            _ => "application/octet-stream",
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Created,
    AwaitingReceiver,
    Paired,
    Transferring,
    Completed,
    Aborted,
}

impl SessionState {
    /// Whether a receiver may join in this state
    pub fn accepts_receiver(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::AwaitingReceiver)
    }

    /// Forward-only transitions, plus the receiver-loss revert
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Aborted, _) => false,
            (_, Aborted) => true,
            (Created, Paired) | (AwaitingReceiver, Paired) => true,
            (Paired, Transferring) | (Transferring, Completed) => true,
            (Paired, AwaitingReceiver) | (Transferring, AwaitingReceiver) => true,
            _ => false,
        }
    }
}

/// What detaching the receiver did to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverDetach {
    /// There was no receiver attached
    Absent,
    /// Transfer was unfinished; the session went back to `AwaitingReceiver`
    Reverted,
    /// Transfer had completed; only the handle was released
    Released,
}

/// The unit of a single file transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub code: PickupCode,
    pub sender: Option<ConnectionId>,
    pub receiver: Option<ConnectionId>,
    pub file_info: Option<FileInfo>,
    pub state: SessionState,
    pub next_expected_chunk: u64,
    pub bytes_relayed: u64,
    pub download_sink: Option<SinkId>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(code: PickupCode, sender: ConnectionId) -> Self {
        let now = Utc::now();
        Self {
            code,
            sender: Some(sender),
            receiver: None,
            file_info: None,
            state: SessionState::Created,
            next_expected_chunk: 0,
            bytes_relayed: 0,
            download_sink: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn role_of(&self, conn: ConnectionId) -> Option<Role> {
        if self.sender == Some(conn) {
            Some(Role::Sender)
        } else if self.receiver == Some(conn) {
            Some(Role::Receiver)
        } else {
            None
        }
    }

    /// Fail unless `conn` holds `role` in this session
    pub fn require(&self, conn: ConnectionId, role: Role) -> Result<()> {
        if self.role_of(conn) == Some(role) {
            Ok(())
        } else {
            Err(RelayError::NotParticipant {
                code: self.code.clone(),
                role,
            })
        }
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RelayError::invalid_state(format!(
                "session {} cannot move from {:?} to {:?}",
                self.code, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Store metadata once. Returns `false` when identical metadata was re-sent.
    pub fn set_file_info(&mut self, info: FileInfo) -> Result<bool> {
        match &self.file_info {
            None => {
                self.file_info = Some(info);
                Ok(true)
            }
            Some(existing) if *existing == info => Ok(false),
            Some(_) => Err(RelayError::MetadataAlreadySet(self.code.clone())),
        }
    }

    pub fn attach_receiver(&mut self, conn: ConnectionId) -> Result<()> {
        if self.receiver.is_some() || !self.state.accepts_receiver() {
            return Err(RelayError::CodeAlreadyClaimed(self.code.clone()));
        }
        self.transition(SessionState::Paired)?;
        self.receiver = Some(conn);
        Ok(())
    }

    /// Attach a download sink and start the transfer
    pub fn attach_sink(&mut self, sink: SinkId) -> Result<FileInfo> {
        let info = self
            .file_info
            .clone()
            .ok_or_else(|| RelayError::MissingMetadata(self.code.clone()))?;
        match self.state {
            SessionState::Paired if self.download_sink.is_none() => {}
            SessionState::Created | SessionState::AwaitingReceiver => {
                return Err(RelayError::invalid_state(format!(
                    "no receiver has joined session {}",
                    self.code
                )));
            }
            _ => {
                return Err(RelayError::invalid_state(format!(
                    "a download is already in progress for session {}",
                    self.code
                )));
            }
        }
        self.transition(SessionState::Transferring)?;
        self.download_sink = Some(sink);
        Ok(info)
    }

    /// Validate and account one chunk
    pub fn accept_chunk(&mut self, index: u64, len: u64) -> Result<()> {
        if self.file_info.is_none() {
            return Err(RelayError::MissingMetadata(self.code.clone()));
        }
        if self.state != SessionState::Transferring || self.download_sink.is_none() {
            return Err(RelayError::SinkUnavailable(self.code.clone()));
        }
        if index != self.next_expected_chunk {
            return Err(RelayError::OutOfOrderChunk {
                expected: self.next_expected_chunk,
                received: index,
            });
        }
        self.next_expected_chunk += 1;
        self.bytes_relayed += len;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(SessionState::Completed)?;
        self.download_sink = None;
        Ok(())
    }

    pub fn detach_receiver(&mut self) -> Result<ReceiverDetach> {
        if self.receiver.is_none() && self.download_sink.is_none() {
            return Ok(ReceiverDetach::Absent);
        }
        self.receiver = None;
        self.download_sink = None;
        match self.state {
            SessionState::Completed => Ok(ReceiverDetach::Released),
            SessionState::Paired | SessionState::Transferring => {
                self.transition(SessionState::AwaitingReceiver)?;
                self.next_expected_chunk = 0;
                self.bytes_relayed = 0;
                Ok(ReceiverDetach::Reverted)
            }
            _ => Ok(ReceiverDetach::Absent),
        }
    }

    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_activity_at < cutoff
    }
}
