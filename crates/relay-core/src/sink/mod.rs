//! Download sinks
//!
//! A sink is the session task's end of the receiver's HTTP download body.
//! Two strategies sit behind the same [`DownloadSink`] trait:
//!
//! - [`StreamingSink`] pushes each chunk through a bounded queue into the open
//!   response and defers when the queue is full.
//! - [`BufferingSink`] accumulates every chunk and releases the whole body once
//!   the last chunk has arrived.
//!
//! The HTTP side only ever sees a [`DownloadStream`].

pub mod buffering;
pub mod streaming;

pub use buffering::BufferingSink;
pub use streaming::StreamingSink;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::io;

use crate::config::SinkMode;
use crate::errors::Result;
use crate::types::{FileInfo, SinkId};

/// Body handed to the HTTP layer
pub type DownloadStream = BoxStream<'static, io::Result<Bytes>>;

/// Outcome of offering a chunk to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkAccept {
    /// The chunk was handed to the consumer
    Accepted,
    /// The sink holds the chunk until [`DownloadSink::ready`] completes
    Deferred,
}

/// Session task side of a download body
#[async_trait]
pub trait DownloadSink: Send + Sync {
    fn id(&self) -> SinkId;

    /// Offer the next chunk. At most one chunk may be deferred at a time.
    fn accept(&mut self, chunk: Bytes) -> Result<SinkAccept>;

    /// Whether a deferred chunk is waiting for capacity
    fn has_deferred(&self) -> bool;

    /// Resolve once the deferred chunk (if any) has been handed on
    ///
    /// Cancel safe: dropping the future keeps the deferred chunk in place.
    /// Fails if the consumer went away meanwhile.
    async fn ready(&mut self) -> Result<()>;

    /// Resolve when the consumer stops reading; pending forever once closed
    async fn aborted(&mut self);

    /// End the body after the last chunk
    fn close(&mut self);

    /// End the body with an error
    fn abort(&mut self, reason: &str);
}

/// Characters left intact by `encodeURIComponent`
const FILENAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Transfer framing sent once, before the first byte of the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingHeaders {
    pub content_disposition: String,
    pub content_type: String,
    /// Only set when the size is known
    pub content_length: Option<u64>,
}

impl FramingHeaders {
    pub fn for_file(info: &FileInfo) -> Self {
        let encoded = utf8_percent_encode(&info.name, FILENAME).to_string();
        Self {
            content_disposition: format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                encoded, encoded
            ),
            content_type: info.content_type_or_default().to_string(),
            content_length: (info.size > 0).then_some(info.size),
        }
    }
}

/// What the receiver's download request gets back
pub struct DownloadBody {
    pub headers: FramingHeaders,
    pub stream: DownloadStream,
}

impl std::fmt::Debug for DownloadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadBody")
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Create a sink of the configured strategy and the body it feeds
pub fn open(
    mode: SinkMode,
    capacity: usize,
    id: SinkId,
) -> (Box<dyn DownloadSink>, DownloadStream) {
    match mode {
        SinkMode::Streaming => {
            let (sink, stream) = StreamingSink::channel(id, capacity);
            (Box::new(sink), stream)
        }
        SinkMode::Buffering => {
            let (sink, stream) = BufferingSink::channel(id);
            (Box::new(sink), stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_headers_for_known_size() {
        let info = FileInfo::new("a.txt", 11).with_content_type("text/plain");
        let headers = FramingHeaders::for_file(&info);
        assert_eq!(
            headers,
            FramingHeaders {
                content_disposition: "attachment; filename=\"a.txt\"; filename*=UTF-8''a.txt"
                    .to_string(),
                content_type: "text/plain".to_string(),
                content_length: Some(11),
            }
        );
    }

    #[test]
    fn test_headers_encode_unsafe_names() {
        let info = FileInfo::new("my report \"final\"(1).pdf", 0);
        let headers = FramingHeaders::for_file(&info);
        assert_eq!(
            headers.content_disposition,
            "attachment; filename=\"my%20report%20%22final%22(1).pdf\"; filename*=UTF-8''my%20report%20%22final%22(1).pdf"
        );
        assert_eq!(headers.content_type, "application/octet-stream");
        assert_eq!(headers.content_length, None);
    }

    #[tokio::test]
    async fn test_opened_sinks_are_shareable() {
        fn assert_send_sync<T: Send + Sync + ?Sized>(_: &T) {}

        for mode in [SinkMode::Streaming, SinkMode::Buffering] {
            let id = SinkId::new();
            let (sink, _stream) = open(mode, 2, id);
            assert_send_sync(&sink);
            assert_eq!(sink.id(), id);
        }
    }

    #[test]
    fn test_headers_encode_utf8_names() {
        let info = FileInfo::new("résumé.txt", 3);
        let headers = FramingHeaders::for_file(&info);
        assert!(headers.content_disposition.contains("r%C3%A9sum%C3%A9.txt"));
    }
}
