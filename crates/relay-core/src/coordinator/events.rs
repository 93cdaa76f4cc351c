//! Events delivered to a session task

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::errors::Result;
use crate::protocol::ClientMessage;
use crate::sink::DownloadBody;
use crate::types::ConnectionId;

/// Everything that may change a session, serialized through its task queue
#[derive(Debug)]
pub enum SessionEvent {
    /// A signaling message from one of the parties
    Client {
        conn: ConnectionId,
        message: ClientMessage,
    },

    /// The receiver's download request
    OpenDownload {
        reply: oneshot::Sender<Result<DownloadBody>>,
    },

    /// A party's signaling channel closed
    ChannelClosed { conn: ConnectionId },

    /// Sweeper found the session idle before `cutoff`
    Expire { cutoff: DateTime<Utc> },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Client { message, .. } => message.kind(),
            SessionEvent::OpenDownload { .. } => "open-download",
            SessionEvent::ChannelClosed { .. } => "channel-closed",
            SessionEvent::Expire { .. } => "expire",
        }
    }
}

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Receiver confirmed the download
    Confirmed,
    SenderLeft,
    Expired,
}

impl Teardown {
    pub fn reason(&self) -> &'static str {
        match self {
            Teardown::Confirmed => "download confirmed",
            Teardown::SenderLeft => "sender disconnected",
            Teardown::Expired => "session expired",
        }
    }
}
