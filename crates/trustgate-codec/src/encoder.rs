//! Streaming encoder for transport units.
//!
//! Parts are framed as `multipart/mixed` and written into a bounded channel
//! as they are produced. The HTTP layer drains the receiving half, so a body
//! never has to be held in memory as a whole. Dropping the receiver makes
//! every further write fail with [`CodecError::Closed`].

use crate::digest::{encode_b64, request_hash, DigestAlgorithm, Digester};
use crate::headers::{
    CONTENT_TYPE_BODY, CONTENT_TYPE_FAULT, CONTENT_TYPE_OCSP, CONTENT_TYPE_SIGNATURE,
    HEADER_ORIGINAL_CONTENT_TYPE,
};
use crate::message::Message;
use crate::signature::{create_signature, PartDigest, SignatureData, PART_BODY, PART_FAULT, PART_MESSAGE};
use crate::CodecError;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::io;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use trustgate_conf::SigningCtx;
use trustgate_types::{Fault, FaultDocument, OcspResponse};

/// Bytes read ahead from a body source to decide whether a body exists.
pub const BODY_LOOKAHEAD: usize = 4096;

/// Default number of chunks buffered between encoder and sender.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Receiving half of an encoder: the content type to send and the stream of
/// encoded bytes.
pub struct EncodedBody {
    pub content_type: String,
    pub stream: ReceiverStream<io::Result<Bytes>>,
}

/// Writes one transport unit.
///
/// Call order: [`message`](Self::message) or [`fault`](Self::fault) first,
/// then optionally [`body`](Self::body) and [`ocsp`](Self::ocsp), then
/// [`sign`](Self::sign) or [`finish_unsigned`](Self::finish_unsigned).
pub struct ProxyMessageEncoder {
    algorithm: DigestAlgorithm,
    boundary: String,
    tx: mpsc::Sender<io::Result<Bytes>>,
    parts: Vec<PartDigest>,
    message_digest: Option<Vec<u8>>,
    body_digest: Option<Vec<u8>>,
    bytes_written: u64,
}

impl ProxyMessageEncoder {
    /// Creates an encoder and the stream it writes into.
    pub fn new(algorithm: DigestAlgorithm, capacity: usize) -> (Self, EncodedBody) {
        let boundary = format!("tg{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let body = EncodedBody {
            content_type: format!("multipart/mixed; boundary={boundary}"),
            stream: ReceiverStream::new(rx),
        };
        let encoder = Self {
            algorithm,
            boundary,
            tx,
            parts: Vec::new(),
            message_digest: None,
            body_digest: None,
            bytes_written: 0,
        };
        (encoder, body)
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Total bytes handed to the channel so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Request hash over the message and body written so far. `None` until
    /// the message part is written.
    pub fn request_hash(&self) -> Option<Vec<u8>> {
        let message = self.message_digest.as_deref()?;
        Some(request_hash(self.algorithm, message, self.body_digest.as_deref()))
    }

    /// Writes the message part.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Closed`] if the receiver is gone.
    pub async fn message(&mut self, message: &Message) -> Result<(), CodecError> {
        let raw = message.raw().clone();
        let digest = self.algorithm.digest(&raw);
        self.write_part(message.kind().content_type(), &[], raw).await?;
        self.parts.push(PartDigest::new(PART_MESSAGE, &digest));
        self.message_digest = Some(digest);
        Ok(())
    }

    /// Streams a body part from `source`.
    ///
    /// Returns `false` without writing anything if the source turns out to be
    /// empty. A source error is forwarded into the output stream so the
    /// receiving side fails too.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Body`] if the source fails and
    /// [`CodecError::Closed`] if the receiver is gone.
    pub async fn body<S, E>(&mut self, content_type: &str, mut source: S) -> Result<bool, CodecError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut lookahead = Vec::new();
        let mut buffered = 0;
        let mut exhausted = false;
        while buffered < BODY_LOOKAHEAD {
            match source.next().await {
                Some(Ok(chunk)) => {
                    buffered += chunk.len();
                    if !chunk.is_empty() {
                        lookahead.push(chunk);
                    }
                }
                Some(Err(e)) => return Err(self.fail_source(e).await),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        if buffered == 0 {
            return Ok(false);
        }

        let mut digester: Digester = self.algorithm.digester();
        let content_type = content_type.replace(['\r', '\n'], "");
        self.write_head(CONTENT_TYPE_BODY, &[(HEADER_ORIGINAL_CONTENT_TYPE, &content_type)])
            .await?;
        for chunk in lookahead {
            digester.update(&chunk);
            self.send(chunk).await?;
        }
        if !exhausted {
            while let Some(item) = source.next().await {
                match item {
                    Ok(chunk) => {
                        digester.update(&chunk);
                        self.send(chunk).await?;
                    }
                    Err(e) => return Err(self.fail_source(e).await),
                }
            }
        }
        self.send(Bytes::from_static(b"\r\n")).await?;
        let digest = digester.finalize();
        self.parts.push(PartDigest::new(PART_BODY, &digest));
        self.body_digest = Some(digest);
        Ok(true)
    }

    /// Writes an OCSP evidence part. OCSP parts are not covered by the
    /// signature.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if serialization fails or the receiver is gone.
    pub async fn ocsp(&mut self, response: &OcspResponse) -> Result<(), CodecError> {
        let raw = Bytes::from(serde_json::to_vec(response)?);
        self.write_part(CONTENT_TYPE_OCSP, &[], raw).await
    }

    /// Writes a fault part.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if serialization fails or the receiver is gone.
    pub async fn fault(&mut self, fault: &Fault) -> Result<(), CodecError> {
        let raw = Bytes::from(serde_json::to_vec(&FaultDocument {
            fault: fault.clone(),
        })?);
        let digest = self.algorithm.digest(&raw);
        self.write_part(CONTENT_TYPE_FAULT, &[], raw).await?;
        self.parts.push(PartDigest::new(PART_FAULT, &digest));
        Ok(())
    }

    /// Signs everything written so far, writes the signature part and closes
    /// the unit.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if signing fails or the receiver is gone.
    pub async fn sign(mut self, ctx: &dyn SigningCtx) -> Result<SignatureData, CodecError> {
        let signature = create_signature(ctx, self.algorithm, std::mem::take(&mut self.parts))?;
        let raw = Bytes::from(serde_json::to_vec(&signature)?);
        self.write_part(CONTENT_TYPE_SIGNATURE, &[], raw).await?;
        self.close().await?;
        Ok(signature)
    }

    /// Closes the unit without a signature. Only valid after a fault part.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Closed`] if the receiver is gone.
    pub async fn finish_unsigned(mut self) -> Result<(), CodecError> {
        self.close().await
    }

    /// Fails the output stream so the receiving side aborts the transfer.
    pub async fn abort(self, reason: &str) {
        let _ = self.tx.send(Err(io::Error::other(reason.to_string()))).await;
    }

    async fn fail_source<E: std::fmt::Display>(&mut self, e: E) -> CodecError {
        let message = e.to_string();
        let _ = self.tx.send(Err(io::Error::other(message.clone()))).await;
        CodecError::Body(message)
    }

    async fn write_part(&mut self, content_type: &str, extra: &[(&str, &str)], content: Bytes) -> Result<(), CodecError> {
        self.write_head(content_type, extra).await?;
        self.send(content).await?;
        self.send(Bytes::from_static(b"\r\n")).await
    }

    async fn write_head(&mut self, content_type: &str, extra: &[(&str, &str)]) -> Result<(), CodecError> {
        let mut head = format!("--{}\r\nContent-Type: {content_type}\r\n", self.boundary);
        for (name, value) in extra {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        self.send(Bytes::from(head)).await
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        let tail = Bytes::from(format!("--{}--\r\n", self.boundary));
        self.send(tail).await
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), CodecError> {
        self.bytes_written += chunk.len() as u64;
        self.tx.send(Ok(chunk)).await.map_err(|_| CodecError::Closed)
    }
}

/// Encodes a digest for the `requestHash` fields.
pub fn encode_request_hash(algorithm: DigestAlgorithm, hash: &[u8]) -> crate::RequestHashValue {
    crate::RequestHashValue {
        algorithm: algorithm.as_str().to_string(),
        value: encode_b64(hash),
    }
}
