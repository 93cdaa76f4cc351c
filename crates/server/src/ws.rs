//! WebSocket signaling channel
//!
//! Each socket is registered with the coordinator's connection table. A writer
//! task drains the connection's outbound queue into the socket while the
//! reader feeds text frames to the coordinator in arrival order.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use filerocket_relay_core::{Outbound, RelayCoordinator};

use crate::AppState;

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state.coordinator))
}

async fn handle_socket(socket: WebSocket, coordinator: RelayCoordinator) {
    let (conn, mut outbound) = coordinator.open_connection();
    let (mut sink, mut stream) = socket.split();

    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Message(message) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode outbound message: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => coordinator.handle_text(conn, &text).await,
            Ok(Message::Binary(_)) => warn!("Ignoring binary frame from {}", conn),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Signaling channel {} failed: {}", conn, e);
                break;
            }
        }
    }

    coordinator.connection_closed(conn).await;
}
