//! Shared helpers for relay-core integration tests
#![allow(dead_code)]

use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use filerocket_relay_core::{
    ClientMessage, CodeGenerator, ConnectionId, DownloadStream, FileInfo, Outbound, PickupCode,
    RelayConfig, RelayCoordinator, ServerMessage, SessionRegistry,
};

pub const CODE: &str = "AB12CD";

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Hands out a fixed sequence of codes, then repeats the last one
pub struct ScriptedCodes(Mutex<VecDeque<&'static str>>);

impl ScriptedCodes {
    pub fn new(codes: &[&'static str]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(codes.iter().copied().collect())))
    }
}

impl CodeGenerator for ScriptedCodes {
    fn generate(&self) -> PickupCode {
        let mut codes = self.0.lock().unwrap();
        let code = if codes.len() > 1 {
            codes.pop_front().unwrap()
        } else {
            codes[0]
        };
        PickupCode::from(code)
    }
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("filerocket_relay_core=debug")
        .try_init();
}

/// Coordinator whose first session gets [`CODE`]
pub fn coordinator_with(config: RelayConfig) -> RelayCoordinator {
    init_logging();
    let registry = SessionRegistry::in_memory(ScriptedCodes::new(&[CODE, "CD34EF", "EF56GH"]));
    RelayCoordinator::new(registry, &config)
}

pub fn coordinator() -> RelayCoordinator {
    coordinator_with(RelayConfig::default())
}

pub fn code() -> PickupCode {
    PickupCode::from(CODE)
}

/// One signaling channel driven directly against the coordinator
pub struct TestClient {
    pub conn: ConnectionId,
    rx: mpsc::UnboundedReceiver<Outbound>,
    coordinator: RelayCoordinator,
}

impl TestClient {
    pub fn connect(coordinator: &RelayCoordinator) -> Self {
        let (conn, rx) = coordinator.open_connection();
        Self {
            conn,
            rx,
            coordinator: coordinator.clone(),
        }
    }

    pub async fn send(&self, message: ClientMessage) {
        self.coordinator.handle_message(self.conn, message).await;
    }

    pub async fn send_text(&self, text: &str) {
        self.coordinator.handle_text(self.conn, text).await;
    }

    /// Close the channel the way a transport would
    pub async fn disconnect(&self) {
        self.coordinator.connection_closed(self.conn).await;
    }

    pub async fn next_outbound(&mut self) -> Outbound {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("connection table dropped the channel")
    }

    pub async fn next(&mut self) -> ServerMessage {
        match self.next_outbound().await {
            Outbound::Message(message) => message,
            Outbound::Close => panic!("channel closed while a message was expected"),
        }
    }

    /// Next message that is not a progress broadcast
    pub async fn next_event(&mut self) -> ServerMessage {
        loop {
            match self.next().await {
                ServerMessage::TransferProgress { .. } => continue,
                message => return message,
            }
        }
    }

    /// Assert nothing but progress arrives within `ms`
    pub async fn expect_quiet(&mut self, ms: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return,
                Ok(Some(Outbound::Message(ServerMessage::TransferProgress { .. }))) => continue,
                Ok(other) => panic!("expected no messages, got {:?}", other),
            }
        }
    }
}

pub fn create() -> ClientMessage {
    ClientMessage::CreateSession {}
}

pub fn join(code: &str) -> ClientMessage {
    ClientMessage::JoinSession {
        pickup_code: PickupCode::from(code),
    }
}

pub fn file_info(name: &str, size: u64) -> ClientMessage {
    ClientMessage::FileInfo {
        pickup_code: code(),
        file_info: FileInfo::new(name, size),
    }
}

pub fn chunk(index: u64, data: &'static str, is_last: bool) -> ClientMessage {
    ClientMessage::FileChunk {
        pickup_code: code(),
        chunk_index: index,
        chunk: Bytes::from_static(data.as_bytes()),
        total_chunks: None,
        is_last,
    }
}

pub fn download_complete(code: &str) -> ClientMessage {
    ClientMessage::DownloadComplete {
        pickup_code: PickupCode::from(code),
    }
}

pub fn chunk_ack(index: u64) -> ServerMessage {
    ServerMessage::ChunkAck {
        pickup_code: code(),
        chunk_index: index,
    }
}

/// Sender with metadata for "a.txt" (11 bytes) and a joined receiver
pub async fn paired(coordinator: &RelayCoordinator) -> (TestClient, TestClient) {
    let mut sender = TestClient::connect(coordinator);
    sender.send(create()).await;
    assert_eq!(
        sender.next().await,
        ServerMessage::CreateSessionResponse {
            success: true,
            pickup_code: Some(code()),
            message: None,
        }
    );
    sender.send(file_info("a.txt", 11)).await;

    let mut receiver = TestClient::connect(coordinator);
    receiver.send(join(CODE)).await;
    assert!(matches!(
        receiver.next().await,
        ServerMessage::SessionJoined { success: true, .. }
    ));
    assert!(matches!(receiver.next().await, ServerMessage::FileInfo { .. }));
    assert_eq!(
        sender.next().await,
        ServerMessage::ReceiverConnected {
            pickup_code: code()
        }
    );
    (sender, receiver)
}

/// Paired session with the download open and the sender told to start
pub async fn transferring(
    coordinator: &RelayCoordinator,
) -> (TestClient, TestClient, DownloadStream) {
    let (mut sender, receiver) = paired(coordinator).await;
    let body = coordinator
        .open_download(&code())
        .await
        .expect("download opens");
    assert_eq!(
        sender.next().await,
        ServerMessage::StartTransfer {
            pickup_code: code()
        }
    );
    (sender, receiver, body.stream)
}

/// Drain a download body
pub async fn collect(mut stream: DownloadStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let read = async {
        while let Some(part) = stream.next().await {
            out.extend_from_slice(&part?);
        }
        Ok::<(), io::Error>(())
    };
    tokio::time::timeout(RECV_TIMEOUT, read)
        .await
        .expect("download body stalled")?;
    Ok(out)
}
