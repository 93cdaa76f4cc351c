//! Stop-and-wait relay: ordering, deferred acknowledgements and rejections

mod common;

use common::*;
use filerocket_relay_core::config::SinkMode;
use filerocket_relay_core::{ClientMessage, ErrorKind, RelayConfig, RelayError, ServerMessage};
use futures::StreamExt;
use pretty_assertions::assert_eq;

fn expect_error(message: ServerMessage, expected: ErrorKind) {
    match message {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, expected),
        other => panic!("expected {:?} error, got {:?}", expected, other),
    }
}

#[tokio::test]
async fn test_ack_waits_for_download_capacity() {
    let mut config = RelayConfig::default();
    config.relay.sink_buffer_chunks = 1;
    let coordinator = coordinator_with(config);
    let (mut sender, _receiver, mut stream) = transferring(&coordinator).await;

    sender.send(chunk(0, "hell", false)).await;
    assert_eq!(sender.next_event().await, chunk_ack(0));

    // The queue holds chunk 0, so chunk 1 is deferred and not acknowledged
    sender.send(chunk(1, "o wo", false)).await;
    sender.expect_quiet(100).await;

    // Ignoring stop-and-wait is rejected without touching the stream
    sender.send(chunk(2, "rld", true)).await;
    expect_error(sender.next_event().await, ErrorKind::OutOfOrderChunk);

    assert_eq!(&stream.next().await.unwrap().unwrap()[..], b"hell");
    assert_eq!(sender.next_event().await, chunk_ack(1));

    sender.send(chunk(2, "rld", true)).await;
    sender.expect_quiet(50).await;
    assert_eq!(&stream.next().await.unwrap().unwrap()[..], b"o wo");
    assert_eq!(sender.next_event().await, chunk_ack(2));
    assert!(matches!(
        sender.next_event().await,
        ServerMessage::TransferComplete { .. }
    ));

    assert_eq!(&stream.next().await.unwrap().unwrap()[..], b"rld");
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_out_of_order_chunks_do_not_advance() {
    let coordinator = coordinator();
    let (mut sender, _receiver, _stream) = transferring(&coordinator).await;

    sender.send(chunk(1, "o wo", false)).await;
    expect_error(sender.next_event().await, ErrorKind::OutOfOrderChunk);

    sender.send(chunk(0, "hell", false)).await;
    assert_eq!(sender.next_event().await, chunk_ack(0));

    // Duplicate
    sender.send(chunk(0, "hell", false)).await;
    expect_error(sender.next_event().await, ErrorKind::OutOfOrderChunk);

    let session = coordinator.registry().get(&code()).await.unwrap().unwrap();
    assert_eq!(session.next_expected_chunk, 1);
    assert_eq!(session.bytes_relayed, 4);
}

#[tokio::test]
async fn test_chunk_before_metadata_is_rejected() {
    let coordinator = coordinator();
    let mut sender = TestClient::connect(&coordinator);
    sender.send(create()).await;
    sender.next().await;

    let mut receiver = TestClient::connect(&coordinator);
    receiver.send(join(CODE)).await;
    assert!(matches!(
        receiver.next().await,
        ServerMessage::SessionJoined { success: true, .. }
    ));
    sender.next().await;

    sender.send(chunk(0, "hell", false)).await;
    expect_error(sender.next().await, ErrorKind::MissingMetadata);

    assert!(matches!(
        coordinator.open_download(&code()).await,
        Err(RelayError::MissingMetadata(_))
    ));
    let session = coordinator.registry().get(&code()).await.unwrap().unwrap();
    assert_eq!(session.next_expected_chunk, 0);
}

#[tokio::test]
async fn test_chunk_without_download_is_rejected() {
    let coordinator = coordinator();
    let (mut sender, mut receiver) = paired(&coordinator).await;

    sender.send(chunk(0, "hell", false)).await;
    expect_error(sender.next().await, ErrorKind::SinkUnavailable);

    receiver
        .send(ClientMessage::StartTransfer {
            pickup_code: code(),
        })
        .await;
    expect_error(receiver.next().await, ErrorKind::SinkUnavailable);
}

#[tokio::test]
async fn test_download_requires_single_paired_receiver() {
    let coordinator = coordinator();
    let mut sender = TestClient::connect(&coordinator);
    sender.send(create()).await;
    sender.next().await;
    sender.send(file_info("a.txt", 11)).await;

    assert!(matches!(
        coordinator.open_download(&code()).await,
        Err(RelayError::InvalidState { .. })
    ));

    let mut receiver = TestClient::connect(&coordinator);
    receiver.send(join(CODE)).await;
    receiver.next().await;
    let body = coordinator.open_download(&code()).await.unwrap();
    assert_eq!(body.headers.content_length, Some(11));
    assert_eq!(body.headers.content_type, "application/octet-stream");

    assert!(matches!(
        coordinator.open_download(&code()).await,
        Err(RelayError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_start_transfer_after_download_is_a_no_op() {
    let coordinator = coordinator();
    let (mut sender, mut receiver, _stream) = transferring(&coordinator).await;

    receiver
        .send(ClientMessage::StartTransfer {
            pickup_code: code(),
        })
        .await;
    receiver.expect_quiet(50).await;
    sender.expect_quiet(0).await;
}

#[tokio::test]
async fn test_buffering_sink_serves_whole_file() {
    let mut config = RelayConfig::default();
    config.relay.sink_mode = SinkMode::Buffering;
    let coordinator = coordinator_with(config);
    let (mut sender, mut receiver, stream) = transferring(&coordinator).await;

    for (index, part) in ["hell", "o wo", "rld"].into_iter().enumerate() {
        sender.send(chunk(index as u64, part, index == 2)).await;
        assert_eq!(sender.next_event().await, chunk_ack(index as u64));
    }
    assert!(matches!(
        receiver.next_event().await,
        ServerMessage::TransferComplete { .. }
    ));
    assert_eq!(collect(stream).await.unwrap(), b"hello world".to_vec());
}
