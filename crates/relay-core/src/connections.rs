//! Connection handle table
//!
//! Sessions refer to parties by [`ConnectionId`]; this table resolves a handle
//! to the outbound queue of the live transport. Transports register on open
//! and unregister on close, after which sends to the handle are dropped.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::ServerMessage;
use crate::types::ConnectionId;

/// Instruction for a transport's writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Close the channel after flushing what was queued before
    Close,
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
    channels: DashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle for a newly opened transport
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        self.channels.insert(id, tx);
        trace!("Registered {}", id);
        (id, rx)
    }

    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.channels.remove(&id).is_some()
    }

    /// Queue a message; returns false if the handle is gone
    pub fn send(&self, id: ConnectionId, message: ServerMessage) -> bool {
        self.push(id, Outbound::Message(message))
    }

    pub fn close(&self, id: ConnectionId) -> bool {
        self.push(id, Outbound::Close)
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.channels
            .get(&id)
            .map_or(false, |tx| !tx.is_closed())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    fn push(&self, id: ConnectionId, outbound: Outbound) -> bool {
        match self.channels.get(&id) {
            Some(tx) => tx.send(outbound).is_ok(),
            None => {
                trace!("Dropping outbound frame for closed {}", id);
                false
            }
        }
    }
}
