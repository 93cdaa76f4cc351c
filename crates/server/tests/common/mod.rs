//! Test server and WebSocket client helpers
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::info;

use filerocket_relay_core::{CodeGenerator, PickupCode, RelayConfig, RelayCoordinator, SessionRegistry};
use filerocket_server::AppState;

pub const CODE: &str = "AB12CD";

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ScriptedCodes(Mutex<VecDeque<&'static str>>);

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

/// Coordinator whose first session gets [`CODE`]
pub fn test_coordinator(config: &RelayConfig) -> RelayCoordinator {
    let codes = Arc::new(ScriptedCodes(Mutex::new(
        [CODE, "CD34EF", "EF56GH"].into_iter().collect(),
    )));
    RelayCoordinator::new(SessionRegistry::in_memory(codes), config)
}

pub fn test_state() -> AppState {
    let config = RelayConfig::default();
    AppState::new(test_coordinator(&config), &config.server)
}

/// Test server handle
pub struct TestServer {
    pub url: String,
    pub ws_url: String,
    pub coordinator: RelayCoordinator,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Start the relay on an OS-assigned port
pub async fn start_test_server() -> anyhow::Result<TestServer> {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter("filerocket_relay_core=debug,filerocket_server=debug")
        .with_test_writer()
        .try_init();

    let state = test_state();
    let coordinator = state.coordinator.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let url = format!("http://{}", addr);
    let ws_url = format!("ws://{}/ws", addr);
    info!("Test server starting on {}", url);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = filerocket_server::serve(listener, state, shutdown).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(TestServer {
        url,
        ws_url,
        coordinator,
        shutdown_tx,
    })
}

/// One signaling client over a real WebSocket
pub struct WsClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(server: &TestServer) -> Self {
        let (socket, _) = connect_async(server.ws_url.as_str())
            .await
            .expect("websocket handshake");
        Self { socket }
    }

    pub async fn send(&mut self, kind: &str, data: Value) {
        let frame = json!({ "type": kind, "data": data }).to_string();
        self.socket
            .send(Message::Text(frame))
            .await
            .expect("send frame");
    }

    /// Next signaling message; `None` once the server closed the socket
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(&text).expect("server sent JSON"))
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next message that is not a progress broadcast
    pub async fn recv_event(&mut self) -> Value {
        loop {
            let message = self.recv().await.expect("socket closed");
            if message["type"] != "transfer-progress" {
                return message;
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

pub fn chunk(index: u64, data: &[u8], is_last: bool) -> Value {
    json!({
        "pickupCode": CODE,
        "chunkIndex": index,
        "chunk": data,
        "isLast": is_last,
    })
}
