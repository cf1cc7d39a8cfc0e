//! Byte-stream plumbing shared by both proxy roles.

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use multer::{Field, Multipart};
use std::io;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// A body on its way to a caller or a service.
pub struct BodyStream {
    pub content_type: String,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Moves `source` behind a bounded channel. The returned stream is `Sync`,
/// which the HTTP client requires of request bodies. When the receiver is
/// dropped the pumping task stops reading.
pub fn channel_stream(
    mut source: BoxStream<'static, io::Result<Bytes>>,
    capacity: usize,
) -> ReceiverStream<io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        while let Some(chunk) = source.next().await {
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Streams the content of one multipart field. The multipart reader is kept
/// alive alongside the field until the field is exhausted.
pub fn field_stream(multipart: Multipart<'static>, field: Field<'static>) -> BoxStream<'static, io::Result<Bytes>> {
    stream::unfold(Some((multipart, field)), |state| async move {
        let (multipart, mut field) = state?;
        match field.chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some((multipart, field)))),
            Ok(None) => None,
            Err(e) => Some((Err(io::Error::other(e)), None)),
        }
    })
    .boxed()
}

/// Builds a `multipart/related` document from a JSON envelope and an
/// attachment stream. Returns the content type and the document stream.
pub fn related_document(envelope: Bytes, attachment: BodyStream) -> (String, BoxStream<'static, io::Result<Bytes>>) {
    let boundary = format!("rel{}", uuid::Uuid::new_v4().simple());
    let head = Bytes::from(format!(
        "--{boundary}\r\nContent-Type: application/json\r\n\r\n"
    ));
    let attachment_head = Bytes::from(format!(
        "\r\n--{boundary}\r\nContent-Type: {}\r\n\r\n",
        attachment.content_type.replace(['\r', '\n'], "")
    ));
    let tail = Bytes::from(format!("\r\n--{boundary}--\r\n"));
    let document = stream::iter([Ok(head), Ok(envelope), Ok(attachment_head)])
        .chain(attachment.stream)
        .chain(stream::once(async move { Ok(tail) }))
        .boxed();
    (
        format!("multipart/related; boundary={boundary}"),
        document,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_codec::collect;

    #[tokio::test]
    async fn channel_stream_preserves_chunks_and_errors() {
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
            Err(io::Error::other("broken")),
            Ok(Bytes::from_static(b"never")),
        ])
        .boxed();
        let mut out = channel_stream(source, 1);
        assert_eq!(out.next().await.unwrap().unwrap(), "ab");
        assert_eq!(out.next().await.unwrap().unwrap(), "cd");
        assert!(out.next().await.unwrap().is_err());
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn related_document_parses_back() {
        let attachment = BodyStream {
            content_type: "text/plain".into(),
            stream: stream::iter(vec![
                Ok(Bytes::from_static(b"hello ")),
                Ok(Bytes::from_static(b"world")),
            ])
            .boxed(),
        };
        let (content_type, document) = related_document(Bytes::from_static(b"{\"a\":1}"), attachment);
        let raw = collect(document, usize::MAX).await.unwrap();

        let boundary = trustgate_codec::parse_boundary(&content_type).unwrap();
        let mut multipart = Multipart::new(
            stream::once(async move { Ok::<_, io::Error>(raw) }),
            boundary,
        );
        let first = multipart.next_field().await.unwrap().unwrap();
        assert_eq!(first.bytes().await.unwrap(), "{\"a\":1}");
        let second = multipart.next_field().await.unwrap().unwrap();
        assert_eq!(second.content_type().unwrap().essence_str(), "text/plain");
        let body = collect(field_stream(multipart, second), usize::MAX).await.unwrap();
        assert_eq!(body, "hello world");
    }
}
