//! Per-session task
//!
//! Owns one session's state machine. Events are taken from the session's queue
//! one at a time; the only other thing the task waits on is its download
//! sink's readiness or abort signal, and both are folded into the same loop so
//! no event races a chunk relay.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::events::{SessionEvent, Teardown};
use super::progress;
use super::SessionDirectory;
use crate::config::RelaySettings;
use crate::connections::ConnectionTable;
use crate::errors::{RelayError, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::SessionRegistry;
use crate::sink::{self, DownloadBody, DownloadSink, FramingHeaders, SinkAccept};
use crate::types::{
    ConnectionId, FileInfo, PickupCode, ReceiverDetach, Role, Session, SessionState, SinkId,
};

/// Whether the task keeps running after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Step {
    Event(Option<SessionEvent>),
    Sink(SinkSignal),
}

enum SinkSignal {
    /// The deferred chunk was handed on
    Ready,
    /// The download consumer went away
    Aborted,
}

/// A relayed chunk whose acknowledgement is not yet sent
#[derive(Debug, Clone)]
struct ChunkReceipt {
    index: u64,
    is_last: bool,
    total_chunks: Option<u64>,
    bytes_relayed: u64,
    file_size: u64,
    sender: Option<ConnectionId>,
    receiver: Option<ConnectionId>,
}

struct ChunkFrame {
    index: u64,
    data: Bytes,
    total_chunks: Option<u64>,
    is_last: bool,
}

pub(crate) struct SessionTask {
    code: PickupCode,
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionTable>,
    directory: Arc<SessionDirectory>,
    settings: RelaySettings,
    events: mpsc::Receiver<SessionEvent>,
    sink: Option<Box<dyn DownloadSink>>,
    /// Set while the sink holds a deferred chunk
    pending_ack: Option<ChunkReceipt>,
}

impl SessionTask {
    pub(crate) fn new(
        code: PickupCode,
        registry: Arc<SessionRegistry>,
        connections: Arc<ConnectionTable>,
        directory: Arc<SessionDirectory>,
        settings: RelaySettings,
        events: mpsc::Receiver<SessionEvent>,
    ) -> Self {
        Self {
            code,
            registry,
            connections,
            directory,
            settings,
            events,
            sink: None,
            pending_ack: None,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Session task for {} started", self.code);
        loop {
            let step = tokio::select! {
                event = self.events.recv() => Step::Event(event),
                signal = sink_signal(self.sink.as_deref_mut()) => Step::Sink(signal),
            };

            let flow = match step {
                Step::Event(None) => Flow::Stop,
                Step::Event(Some(event)) => self.handle_event(event).await,
                Step::Sink(SinkSignal::Ready) => self.flush_pending_ack().await,
                Step::Sink(SinkSignal::Aborted) => self.receiver_lost("download stream closed").await,
            };
            if flow == Flow::Stop {
                break;
            }
        }

        // Events queued behind the teardown address a session that is gone
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            self.reject_stale(event);
        }
        debug!("Session task for {} stopped", self.code);
    }

    fn reject_stale(&self, event: SessionEvent) {
        let err = RelayError::InvalidCode(self.code.clone());
        match event {
            SessionEvent::Client {
                conn,
                message: ClientMessage::JoinSession { .. },
            } => self.reject_join(conn, &err),
            SessionEvent::Client { conn, .. } => {
                self.notify(Some(conn), ServerMessage::error(Some(self.code.clone()), &err));
            }
            SessionEvent::OpenDownload { reply } => {
                let _ = reply.send(Err(err));
            }
            SessionEvent::ChannelClosed { .. } | SessionEvent::Expire { .. } => {}
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Flow {
        debug!("Session {} handling {}", self.code, event.name());
        match event {
            SessionEvent::Client { conn, message } => {
                match self.handle_client(conn, message).await {
                    Ok(flow) => flow,
                    Err(e) => {
                        self.report(conn, &e);
                        Flow::Continue
                    }
                }
            }
            SessionEvent::OpenDownload { reply } => {
                let result = self.open_download().await;
                if let Err(e) = &result {
                    warn!("Download for {} refused: {}", self.code, e);
                }
                // A dropped request drops the body, which the sink reports as an abort
                let _ = reply.send(result);
                Flow::Continue
            }
            SessionEvent::ChannelClosed { conn } => self.channel_closed(conn).await,
            SessionEvent::Expire { cutoff } => match self.snapshot().await {
                Ok(session) if session.is_idle_since(cutoff) => {
                    self.destroy(Teardown::Expired).await
                }
                Ok(_) => Flow::Continue,
                Err(_) => self.destroy(Teardown::Expired).await,
            },
        }
    }

    async fn handle_client(&mut self, conn: ConnectionId, message: ClientMessage) -> Result<Flow> {
        match message {
            ClientMessage::CreateSession {} => Err(RelayError::invalid_state(
                "create-session does not address an existing session",
            )),
            ClientMessage::JoinSession { .. } => Ok(self.join(conn).await),
            ClientMessage::FileInfo { file_info, .. } => self.store_file_info(conn, file_info).await,
            ClientMessage::StartTransfer { .. } => self.start_transfer(conn).await,
            ClientMessage::AcceptTransfer { .. } => {
                self.snapshot().await?.require(conn, Role::Receiver)?;
                info!("Receiver accepted transfer for {}", self.code);
                Ok(Flow::Continue)
            }
            ClientMessage::FileChunk {
                chunk_index,
                chunk,
                total_chunks,
                is_last,
                ..
            } => {
                let frame = ChunkFrame {
                    index: chunk_index,
                    data: chunk,
                    total_chunks,
                    is_last,
                };
                self.relay_chunk(conn, frame).await
            }
            ClientMessage::DownloadComplete { .. } => self.download_complete(conn).await,
            ClientMessage::TransferSpeed { speed, .. } => self.forward_speed(conn, speed).await,
        }
    }

    async fn snapshot(&self) -> Result<Session> {
        self.registry
            .get(&self.code)
            .await?
            .ok_or_else(|| RelayError::InvalidCode(self.code.clone()))
    }

    fn notify(&self, conn: Option<ConnectionId>, message: ServerMessage) {
        if let Some(conn) = conn {
            self.connections.send(conn, message);
        }
    }

    fn report(&self, conn: ConnectionId, err: &RelayError) {
        warn!("Session {}: rejected request from {}: {}", self.code, conn, err);
        self.notify(Some(conn), ServerMessage::error(Some(self.code.clone()), err));
    }

    fn file_info_message(&self, info: FileInfo) -> ServerMessage {
        ServerMessage::FileInfo {
            pickup_code: self.code.clone(),
            file_info: info,
        }
    }

    async fn join(&mut self, conn: ConnectionId) -> Flow {
        let session = match self.snapshot().await {
            Ok(session) => session,
            Err(e) => {
                self.reject_join(conn, &e);
                return Flow::Continue;
            }
        };

        if session.receiver == Some(conn) {
            self.notify(Some(conn), ServerMessage::SessionJoined {
                success: true,
                pickup_code: Some(self.code.clone()),
                message: None,
            });
            if let Some(info) = session.file_info {
                self.notify(Some(conn), self.file_info_message(info));
            }
            return Flow::Continue;
        }
        if session.sender == Some(conn) {
            self.reject_join(conn, &RelayError::invalid_state("the sender cannot join its own session"));
            return Flow::Continue;
        }

        // Record membership before the liveness check so a concurrent close
        // either sees it or is seen here.
        self.directory.add_membership(conn, &self.code);
        if !self.connections.is_open(conn) {
            self.directory.remove_membership(conn, &self.code);
            return Flow::Continue;
        }

        let attached = self
            .registry
            .mutate(&self.code, |s| {
                s.attach_receiver(conn)?;
                Ok((s.sender, s.file_info.clone()))
            })
            .await;

        match attached {
            Ok((sender, file_info)) => {
                info!("Receiver {} joined session {}", conn, self.code);
                self.notify(sender, ServerMessage::ReceiverConnected {
                    pickup_code: self.code.clone(),
                });
                self.notify(Some(conn), ServerMessage::SessionJoined {
                    success: true,
                    pickup_code: Some(self.code.clone()),
                    message: None,
                });
                if let Some(info) = file_info {
                    self.notify(Some(conn), self.file_info_message(info));
                }
            }
            Err(e) => {
                self.directory.remove_membership(conn, &self.code);
                self.reject_join(conn, &e);
            }
        }
        Flow::Continue
    }

    /// Reply failure and close the joining channel unless it belongs to another session
    fn reject_join(&self, conn: ConnectionId, err: &RelayError) {
        warn!("Join of {} by {} refused: {}", self.code, conn, err);
        self.notify(Some(conn), ServerMessage::join_failed(self.code.clone(), err));
        if !self.directory.has_memberships(conn) {
            self.connections.close(conn);
        }
    }

    async fn store_file_info(&mut self, conn: ConnectionId, info: FileInfo) -> Result<Flow> {
        let (stored, receiver) = self
            .registry
            .mutate(&self.code, |s| {
                s.require(conn, Role::Sender)?;
                let stored = s.set_file_info(info.clone())?;
                Ok((stored, s.receiver))
            })
            .await?;

        if stored {
            info!(
                "Session {} offers {} ({} bytes)",
                self.code, info.name, info.size
            );
            self.notify(receiver, self.file_info_message(info));
        }
        Ok(Flow::Continue)
    }

    async fn start_transfer(&mut self, conn: ConnectionId) -> Result<Flow> {
        let session = self.snapshot().await?;
        session.require(conn, Role::Receiver)?;
        match session.state {
            SessionState::Transferring => {
                debug!("Transfer for {} already started by the download request", self.code);
                Ok(Flow::Continue)
            }
            SessionState::Paired => Err(RelayError::SinkUnavailable(self.code.clone())),
            state => Err(RelayError::invalid_state(format!(
                "cannot start a transfer while {:?}",
                state
            ))),
        }
    }

    async fn open_download(&mut self) -> Result<DownloadBody> {
        let sink_id = SinkId::new();
        let (sender, info) = self
            .registry
            .mutate(&self.code, |s| {
                let info = s.attach_sink(sink_id)?;
                Ok((s.sender, info))
            })
            .await?;

        let (sink, stream) = sink::open(
            self.settings.sink_mode,
            self.settings.sink_buffer_chunks,
            sink_id,
        );
        self.sink = Some(sink);
        self.pending_ack = None;

        info!(
            "Download {} opened for {}, signalling sender to begin",
            sink_id, self.code
        );
        self.notify(sender, ServerMessage::StartTransfer {
            pickup_code: self.code.clone(),
        });
        Ok(DownloadBody {
            headers: FramingHeaders::for_file(&info),
            stream,
        })
    }

    async fn relay_chunk(&mut self, conn: ConnectionId, frame: ChunkFrame) -> Result<Flow> {
        if let Some(pending) = &self.pending_ack {
            // Stop-and-wait: the sender must wait for the previous ack
            self.registry
                .get(&self.code)
                .await?
                .ok_or_else(|| RelayError::InvalidCode(self.code.clone()))?
                .require(conn, Role::Sender)?;
            return Err(RelayError::ChunkBeforeAck {
                pending: pending.index,
                received: frame.index,
            });
        }

        let sink_attached = self.sink.is_some();
        let len = frame.data.len() as u64;
        let receipt = self
            .registry
            .mutate_volatile(&self.code, |s| {
                s.require(conn, Role::Sender)?;
                s.accept_chunk(frame.index, len)?;
                if !sink_attached {
                    return Err(RelayError::SinkUnavailable(s.code.clone()));
                }
                Ok(ChunkReceipt {
                    index: frame.index,
                    is_last: frame.is_last,
                    total_chunks: frame.total_chunks,
                    bytes_relayed: s.bytes_relayed,
                    file_size: s.file_info.as_ref().map_or(0, |info| info.size),
                    sender: s.sender,
                    receiver: s.receiver,
                })
            })
            .await?;

        let Some(sink) = self.sink.as_mut() else {
            return Err(RelayError::SinkUnavailable(self.code.clone()));
        };
        let sink_id = sink.id();
        match sink.accept(frame.data) {
            Ok(SinkAccept::Accepted) => {
                debug!("Relayed chunk {} of {} ({} bytes)", receipt.index, self.code, len);
                self.commit_chunk(receipt).await
            }
            Ok(SinkAccept::Deferred) => {
                debug!("Chunk {} of {} deferred by the download stream", receipt.index, self.code);
                self.pending_ack = Some(receipt);
                Ok(Flow::Continue)
            }
            Err(e) if e.is_disconnect() => {
                warn!("{} for {} closed before chunk {}: {}", sink_id, self.code, receipt.index, e);
                Ok(self.receiver_lost("download stream closed").await)
            }
            Err(e) => {
                error!("{} for {} refused chunk {}: {}", sink_id, self.code, receipt.index, e);
                // Not delivered, so the sender may resend the same index
                self.registry
                    .mutate_volatile(&self.code, |s| {
                        s.next_expected_chunk = receipt.index;
                        s.bytes_relayed = s.bytes_relayed.saturating_sub(len);
                        Ok(())
                    })
                    .await?;
                Err(e)
            }
        }
    }

    /// Acknowledge a chunk the sink has accepted
    async fn commit_chunk(&mut self, receipt: ChunkReceipt) -> Result<Flow> {
        self.notify(receipt.sender, ServerMessage::ChunkAck {
            pickup_code: self.code.clone(),
            chunk_index: receipt.index,
        });

        if progress::should_report(receipt.index, receipt.is_last, self.settings.progress_interval) {
            let update = ServerMessage::TransferProgress {
                pickup_code: self.code.clone(),
                progress: progress::percent(
                    receipt.bytes_relayed,
                    receipt.file_size,
                    receipt.index,
                    receipt.total_chunks,
                    receipt.is_last,
                ),
                chunk_index: receipt.index,
                total_chunks: receipt.total_chunks,
                bytes_transferred: receipt.bytes_relayed,
            };
            self.notify(receipt.sender, update.clone());
            self.notify(receipt.receiver, update);
        }

        if receipt.is_last {
            self.complete().await?;
        }
        Ok(Flow::Continue)
    }

    async fn flush_pending_ack(&mut self) -> Flow {
        let Some(receipt) = self.pending_ack.take() else {
            return Flow::Continue;
        };
        debug!("Download stream for {} ready, acknowledging chunk {}", self.code, receipt.index);
        match self.commit_chunk(receipt).await {
            Ok(flow) => flow,
            Err(e) => {
                error!("Failed to finish chunk relay for {}: {}", self.code, e);
                Flow::Continue
            }
        }
    }

    async fn complete(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.close();
        }
        let (sender, receiver) = self
            .registry
            .mutate(&self.code, |s| {
                s.complete()?;
                Ok((s.sender, s.receiver))
            })
            .await?;

        info!("Transfer for session {} completed", self.code);
        for party in [sender, receiver] {
            self.notify(party, ServerMessage::TransferComplete {
                pickup_code: self.code.clone(),
            });
        }
        Ok(())
    }

    async fn download_complete(&mut self, conn: ConnectionId) -> Result<Flow> {
        let session = self.snapshot().await?;
        session.require(conn, Role::Receiver)?;
        if session.state != SessionState::Completed {
            return Err(RelayError::invalid_state("the transfer has not completed yet"));
        }
        Ok(self.destroy(Teardown::Confirmed).await)
    }

    async fn forward_speed(&mut self, conn: ConnectionId, speed: f64) -> Result<Flow> {
        let session = self.snapshot().await?;
        if session.role_of(conn) != Some(Role::Receiver) {
            warn!("Ignoring transfer speed for {} from non-receiver {}", self.code, conn);
            return Ok(Flow::Continue);
        }
        self.notify(session.sender, ServerMessage::TransferSpeed {
            pickup_code: self.code.clone(),
            speed,
        });
        Ok(Flow::Continue)
    }

    async fn channel_closed(&mut self, conn: ConnectionId) -> Flow {
        let role = match self.snapshot().await {
            Ok(session) => session.role_of(conn),
            Err(e) => {
                warn!("Session {} vanished while {} closed: {}", self.code, conn, e);
                return self.destroy(Teardown::SenderLeft).await;
            }
        };
        match role {
            Some(Role::Sender) => self.destroy(Teardown::SenderLeft).await,
            Some(Role::Receiver) => self.receiver_lost("receiver disconnected").await,
            None => Flow::Continue,
        }
    }

    /// Recoverable path: drop the receiver and its sink, revert if unfinished
    async fn receiver_lost(&mut self, reason: &str) -> Flow {
        self.pending_ack = None;
        if let Some(mut sink) = self.sink.take() {
            sink.abort(reason);
        }

        let detached = self
            .registry
            .mutate(&self.code, |s| {
                let former = s.receiver;
                let outcome = s.detach_receiver()?;
                Ok((outcome, former, s.sender))
            })
            .await;

        match detached {
            Ok((ReceiverDetach::Reverted, former, sender)) => {
                info!("Receiver of {} lost ({}), awaiting a new receiver", self.code, reason);
                self.notify(sender, ServerMessage::ReceiverDisconnected {
                    pickup_code: self.code.clone(),
                });
                if let Some(former) = former {
                    self.directory.remove_membership(former, &self.code);
                    self.notify(Some(former), ServerMessage::ConnectionLost {
                        pickup_code: self.code.clone(),
                    });
                }
            }
            Ok((ReceiverDetach::Released, former, _)) => {
                if let Some(former) = former {
                    self.directory.remove_membership(former, &self.code);
                }
            }
            Ok((ReceiverDetach::Absent, _, _)) => {}
            Err(e) => warn!("Failed to detach receiver of {}: {}", self.code, e),
        }
        Flow::Continue
    }

    /// Destructive path: abort any download and remove the session
    async fn destroy(&mut self, teardown: Teardown) -> Flow {
        // Unroutable from here on; later events are rejected by the caller
        self.directory.remove_task(&self.code);
        self.pending_ack = None;
        if let Some(mut sink) = self.sink.take() {
            sink.abort(teardown.reason());
        }

        let aborted = self
            .registry
            .mutate(&self.code, |s| {
                if s.state != SessionState::Completed {
                    s.transition(SessionState::Aborted)?;
                }
                Ok(())
            })
            .await;
        if let Err(e) = aborted {
            debug!("Session {} not marked aborted: {}", self.code, e);
        }

        match self.registry.delete(&self.code).await {
            Ok(Some(session)) => {
                let lost = ServerMessage::ConnectionLost {
                    pickup_code: self.code.clone(),
                };
                match teardown {
                    Teardown::SenderLeft => {
                        self.notify(session.receiver, ServerMessage::SenderDisconnected {
                            pickup_code: self.code.clone(),
                        });
                        self.notify(session.receiver, lost);
                    }
                    Teardown::Expired => {
                        self.notify(session.sender, lost.clone());
                        self.notify(session.receiver, lost);
                    }
                    Teardown::Confirmed => {}
                }
                for party in [session.sender, session.receiver].into_iter().flatten() {
                    self.directory.remove_membership(party, &self.code);
                }
                info!("Session {} destroyed: {}", self.code, teardown.reason());
            }
            Ok(None) => {}
            Err(e) => error!("Failed to delete session {}: {}", self.code, e),
        }
        Flow::Stop
    }
}

async fn sink_signal(sink: Option<&mut (dyn DownloadSink + 'static)>) -> SinkSignal {
    let Some(sink) = sink else {
        return futures::future::pending().await;
    };
    if sink.has_deferred() {
        match sink.ready().await {
            Ok(()) => SinkSignal::Ready,
            Err(_) => SinkSignal::Aborted,
        }
    } else {
        sink.aborted().await;
        SinkSignal::Aborted
    }
}
