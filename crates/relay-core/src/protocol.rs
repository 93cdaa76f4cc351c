//! Signaling protocol
//!
//! Every frame is a JSON envelope `{"type": "...", "data": {...}}`. Client and
//! server messages are closed enums so the coordinator matches them
//! exhaustively.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, RelayError, Result};
use crate::types::{FileInfo, PickupCode};

/// Messages a party sends to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Register a new transfer as its sender
    CreateSession {},

    #[serde(rename_all = "camelCase")]
    JoinSession { pickup_code: PickupCode },

    #[serde(rename_all = "camelCase")]
    FileInfo {
        pickup_code: PickupCode,
        file_info: FileInfo,
    },

    #[serde(rename_all = "camelCase")]
    StartTransfer { pickup_code: PickupCode },

    /// Receiver accepted the offer; informational only
    #[serde(rename_all = "camelCase")]
    AcceptTransfer { pickup_code: PickupCode },

    /// One chunk of file bytes; `chunk` travels as a JSON array of octets
    #[serde(rename_all = "camelCase")]
    FileChunk {
        pickup_code: PickupCode,
        chunk_index: u64,
        chunk: Bytes,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u64>,
        #[serde(default)]
        is_last: bool,
    },

    #[serde(rename_all = "camelCase")]
    DownloadComplete { pickup_code: PickupCode },

    /// Receiver-measured throughput, forwarded to the sender
    #[serde(rename_all = "camelCase")]
    TransferSpeed { pickup_code: PickupCode, speed: f64 },
}

impl ClientMessage {
    /// Parse one signaling frame
    ///
    /// A missing or null `data` member is read as an empty object, so
    /// `{"type":"create-session"}` is accepted.
    pub fn parse(text: &str) -> Result<Self> {
        let mut envelope: serde_json::Value = serde_json::from_str(text)?;
        if let Some(object) = envelope.as_object_mut() {
            match object.get("data") {
                None | Some(serde_json::Value::Null) => {
                    object.insert("data".to_string(), serde_json::json!({}));
                }
                Some(_) => {}
            }
        }
        Ok(serde_json::from_value(envelope)?)
    }

    /// Session this message addresses, `None` for `create-session`
    pub fn pickup_code(&self) -> Option<&PickupCode> {
        match self {
            Self::CreateSession {} => None,
            Self::JoinSession { pickup_code }
            | Self::FileInfo { pickup_code, .. }
            | Self::StartTransfer { pickup_code }
            | Self::AcceptTransfer { pickup_code }
            | Self::FileChunk { pickup_code, .. }
            | Self::DownloadComplete { pickup_code }
            | Self::TransferSpeed { pickup_code, .. } => Some(pickup_code),
        }
    }

    /// Wire name of the message type, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateSession {} => "create-session",
            Self::JoinSession { .. } => "join-session",
            Self::FileInfo { .. } => "file-info",
            Self::StartTransfer { .. } => "start-transfer",
            Self::AcceptTransfer { .. } => "accept-transfer",
            Self::FileChunk { .. } => "file-chunk",
            Self::DownloadComplete { .. } => "download-complete",
            Self::TransferSpeed { .. } => "transfer-speed",
        }
    }
}

/// Messages the relay sends to a party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    CreateSessionResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pickup_code: Option<PickupCode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    SessionJoined {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pickup_code: Option<PickupCode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    FileInfo {
        pickup_code: PickupCode,
        file_info: FileInfo,
    },

    #[serde(rename_all = "camelCase")]
    StartTransfer { pickup_code: PickupCode },

    /// Permits the sender to transmit the next chunk
    #[serde(rename_all = "camelCase")]
    ChunkAck {
        pickup_code: PickupCode,
        chunk_index: u64,
    },

    #[serde(rename_all = "camelCase")]
    TransferProgress {
        pickup_code: PickupCode,
        progress: f64,
        chunk_index: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u64>,
        bytes_transferred: u64,
    },

    #[serde(rename_all = "camelCase")]
    TransferComplete { pickup_code: PickupCode },

    #[serde(rename_all = "camelCase")]
    ReceiverConnected { pickup_code: PickupCode },

    #[serde(rename_all = "camelCase")]
    ReceiverDisconnected { pickup_code: PickupCode },

    #[serde(rename_all = "camelCase")]
    SenderDisconnected { pickup_code: PickupCode },

    #[serde(rename_all = "camelCase")]
    ConnectionLost { pickup_code: PickupCode },

    #[serde(rename_all = "camelCase")]
    TransferSpeed { pickup_code: PickupCode, speed: f64 },

    /// A request was rejected; session state is unchanged
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pickup_code: Option<PickupCode>,
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(pickup_code: Option<PickupCode>, err: &RelayError) -> Self {
        Self::Error {
            pickup_code,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn join_failed(pickup_code: PickupCode, err: &RelayError) -> Self {
        Self::SessionJoined {
            success: false,
            pickup_code: Some(pickup_code),
            message: Some(err.to_string()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_create_session_with_or_without_data() {
        let expected = ClientMessage::CreateSession {};
        assert_eq!(ClientMessage::parse(r#"{"type":"create-session"}"#).unwrap(), expected);
        assert_eq!(
            ClientMessage::parse(r#"{"type":"create-session","data":{}}"#).unwrap(),
            expected
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"create-session","data":null}"#).unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_file_info() {
        let message = ClientMessage::parse(
            r#"{"type":"file-info","data":{"pickupCode":"ab12cd","fileInfo":{"name":"a.txt","size":11,"type":"text/plain"}}}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            ClientMessage::FileInfo {
                pickup_code: PickupCode::from("AB12CD"),
                file_info: FileInfo::new("a.txt", 11).with_content_type("text/plain"),
            }
        );
        assert_eq!(message.pickup_code().unwrap().as_str(), "AB12CD");
    }

    #[test]
    fn test_parse_file_chunk_byte_array() {
        let message = ClientMessage::parse(
            r#"{"type":"file-chunk","data":{"pickupCode":"AB12CD","chunkIndex":2,"chunk":[104,105,33],"isLast":true}}"#,
        )
        .unwrap();
        match message {
            ClientMessage::FileChunk {
                chunk_index,
                chunk,
                total_chunks,
                is_last,
                ..
            } => {
                assert_eq!(chunk_index, 2);
                assert_eq!(&chunk[..], b"hi!");
                assert_eq!(total_chunks, None);
                assert!(is_last);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_is_last_defaults_to_false() {
        let message = ClientMessage::parse(
            r#"{"type":"file-chunk","data":{"pickupCode":"AB12CD","chunkIndex":0,"chunk":[1],"totalChunks":3}}"#,
        )
        .unwrap();
        assert!(matches!(
            message,
            ClientMessage::FileChunk {
                is_last: false,
                total_chunks: Some(3),
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"type":"launch-rocket","data":{}}"#).is_err());
        assert!(ClientMessage::parse(r#"{"type":"join-session","data":{}}"#).is_err());
        assert!(ClientMessage::parse(r#"[1,2,3]"#).is_err());
    }

    #[test]
    fn test_server_message_envelope() {
        let message = ServerMessage::CreateSessionResponse {
            success: true,
            pickup_code: Some(PickupCode::from("AB12CD")),
            message: None,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "create-session-response", "data": {"success": true, "pickupCode": "AB12CD"}})
        );

        let ack = ServerMessage::ChunkAck {
            pickup_code: PickupCode::from("AB12CD"),
            chunk_index: 4,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "chunk-ack", "data": {"pickupCode": "AB12CD", "chunkIndex": 4}})
        );
    }

    #[test]
    fn test_error_notification_carries_kind() {
        let err = RelayError::OutOfOrderChunk { expected: 1, received: 3 };
        let message = ServerMessage::error(Some(PickupCode::from("AB12CD")), &err);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["kind"], "out-of-order-chunk");
        assert_eq!(value["data"]["message"], "Out of order chunk: expected index 1, got 3");
    }
}
