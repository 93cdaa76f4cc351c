//! Push-through sink backed by a bounded queue
//!
//! The queue capacity is the sink's flow-control window. A full queue defers
//! the chunk; `ready` waits for the consumer to free a slot.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::io;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use super::{DownloadSink, DownloadStream, SinkAccept};
use crate::errors::{RelayError, Result};
use crate::types::{Role, SinkId};

pub struct StreamingSink {
    id: SinkId,
    chunks: Option<mpsc::Sender<Bytes>>,
    abort: Option<oneshot::Sender<String>>,
    deferred: Option<Bytes>,
}

/// Consumer half: queued chunks, ended early by an abort
struct BodyState {
    chunks: mpsc::Receiver<Bytes>,
    abort: Option<oneshot::Receiver<String>>,
}

impl StreamingSink {
    pub fn channel(id: SinkId, capacity: usize) -> (Self, DownloadStream) {
        let (chunk_tx, chunk_rx) = mpsc::channel(capacity.max(1));
        let (abort_tx, abort_rx) = oneshot::channel();
        let sink = Self {
            id,
            chunks: Some(chunk_tx),
            abort: Some(abort_tx),
            deferred: None,
        };
        let state = BodyState {
            chunks: chunk_rx,
            abort: Some(abort_rx),
        };
        (sink, body(state))
    }
}

fn body(state: BodyState) -> DownloadStream {
    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        let next = match state.abort.as_mut() {
            Some(abort) => tokio::select! {
                biased;
                reason = abort => match reason {
                    Ok(reason) => Err(reason),
                    // Closed cleanly: drain what is queued
                    Err(_) => {
                        state.abort = None;
                        Ok(state.chunks.recv().await)
                    }
                },
                chunk = state.chunks.recv() => Ok(chunk),
            },
            None => Ok(state.chunks.recv().await),
        };
        match next {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(state))),
            Ok(None) => None,
            Err(reason) => Some((
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, reason)),
                None,
            )),
        }
    })
    .boxed()
}

#[async_trait]
impl DownloadSink for StreamingSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn accept(&mut self, chunk: Bytes) -> Result<SinkAccept> {
        if self.deferred.is_some() {
            return Err(RelayError::invalid_state("a chunk is already waiting for the download stream"));
        }
        let tx = self
            .chunks
            .as_ref()
            .ok_or_else(|| RelayError::disconnected(Role::Receiver))?;
        match tx.try_send(chunk) {
            Ok(()) => Ok(SinkAccept::Accepted),
            Err(TrySendError::Full(chunk)) => {
                debug!("{} is full, deferring {} bytes", self.id, chunk.len());
                self.deferred = Some(chunk);
                Ok(SinkAccept::Deferred)
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::disconnected(Role::Receiver)),
        }
    }

    fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    async fn ready(&mut self) -> Result<()> {
        if self.deferred.is_none() {
            return Ok(());
        }
        let tx = self
            .chunks
            .as_ref()
            .ok_or_else(|| RelayError::disconnected(Role::Receiver))?;
        let permit = tx
            .reserve()
            .await
            .map_err(|_| RelayError::disconnected(Role::Receiver))?;
        if let Some(chunk) = self.deferred.take() {
            permit.send(chunk);
        }
        Ok(())
    }

    async fn aborted(&mut self) {
        match self.chunks.as_ref() {
            Some(tx) => tx.closed().await,
            None => futures::future::pending().await,
        }
    }

    fn close(&mut self) {
        self.deferred = None;
        self.chunks = None;
        self.abort = None;
    }

    fn abort(&mut self, reason: &str) {
        self.deferred = None;
        self.chunks = None;
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(reason.to_string());
        }
    }
}
