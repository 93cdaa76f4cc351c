//! Accumulate-then-serve sink
//!
//! Every chunk is accepted immediately. The body resolves to the whole file
//! once the session closes the sink after the last chunk.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use std::io;
use tokio::sync::oneshot;

use super::{DownloadSink, DownloadStream, SinkAccept};
use crate::errors::{RelayError, Result};
use crate::types::{Role, SinkId};

pub struct BufferingSink {
    id: SinkId,
    parts: Vec<Bytes>,
    done: Option<oneshot::Sender<io::Result<Bytes>>>,
}

impl BufferingSink {
    pub fn channel(id: SinkId) -> (Self, DownloadStream) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            id,
            parts: Vec::new(),
            done: Some(tx),
        };
        let stream = stream::once(async move {
            rx.await.unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "download ended before the transfer finished",
                ))
            })
        })
        .boxed();
        (sink, stream)
    }

    /// Bytes held so far
    pub fn buffered_len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }
}

#[async_trait]
impl DownloadSink for BufferingSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn accept(&mut self, chunk: Bytes) -> Result<SinkAccept> {
        match &self.done {
            Some(tx) if !tx.is_closed() => {
                self.parts.push(chunk);
                Ok(SinkAccept::Accepted)
            }
            _ => Err(RelayError::disconnected(Role::Receiver)),
        }
    }

    fn has_deferred(&self) -> bool {
        false
    }

    async fn ready(&mut self) -> Result<()> {
        Ok(())
    }

    async fn aborted(&mut self) {
        match self.done.as_mut() {
            Some(tx) => tx.closed().await,
            None => futures::future::pending().await,
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.done.take() {
            let mut body = BytesMut::with_capacity(self.buffered_len());
            for part in self.parts.drain(..) {
                body.extend_from_slice(&part);
            }
            let _ = tx.send(Ok(body.freeze()));
        }
    }

    fn abort(&mut self, reason: &str) {
        self.parts.clear();
        if let Some(tx) = self.done.take() {
            let _ = tx.send(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                reason.to_string(),
            )));
        }
    }
}
