//! Streaming decoder for transport units.
//!
//! Parts are pulled in arrival order. Part order is enforced as it arrives:
//!
//! ```text
//! message [body] ocsp* (signature | fault)
//! fault [signature]
//! ```
//!
//! Anything after the final part, or a part of unknown type, is rejected.

use crate::body::{BodySpooler, DEFAULT_SPOOL_THRESHOLD};
use crate::digest::DigestAlgorithm;
use crate::headers::{
    essence, CONTENT_TYPE_BODY, CONTENT_TYPE_FAULT, CONTENT_TYPE_OCSP, CONTENT_TYPE_SIGNATURE,
    HEADER_ORIGINAL_CONTENT_TYPE,
};
use crate::message::{Message, MessageKind};
use crate::proxy_message::ProxyMessage;
use crate::signature::{PartDigest, SignatureData, PART_BODY, PART_FAULT, PART_MESSAGE};
use crate::CodecError;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use multer::Multipart;
use trustgate_types::{Fault, FaultDocument, OcspResponse};

/// Kind of the part just decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Message,
    Body,
    Ocsp,
    Fault,
    Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    AfterMessage,
    AfterBody,
    AfterOcsp,
    AfterLeadingFault,
    Done,
}

/// Pulls parts of one transport unit off a byte stream.
pub struct ProxyMessageDecoder {
    multipart: Multipart<'static>,
    expected: MessageKind,
    spool_threshold: usize,
    stage: Stage,
    unit: ProxyMessage,
}

impl ProxyMessageDecoder {
    /// Starts decoding a `multipart/mixed` stream.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidContentType`] if `content_type` is not a
    /// multipart type with a boundary.
    pub fn new<S, E>(
        content_type: &str,
        stream: S,
        algorithm: DigestAlgorithm,
        expected: MessageKind,
    ) -> Result<Self, CodecError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let boundary = parse_boundary(content_type)?;
        Ok(Self {
            multipart: Multipart::new(stream, boundary),
            expected,
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
            stage: Stage::Start,
            unit: ProxyMessage::empty(algorithm),
        })
    }

    /// Sets the in-memory limit for the body part.
    pub fn with_spool_threshold(mut self, threshold: usize) -> Self {
        self.spool_threshold = threshold;
        self
    }

    /// The message part, once it has been decoded.
    pub fn message(&self) -> Option<&Message> {
        self.unit.message.as_ref()
    }

    /// The fault part, once it has been decoded.
    pub fn fault(&self) -> Option<&Fault> {
        self.unit.fault.as_ref()
    }

    /// Decodes the next part. Returns `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidMessage`] for malformed, unknown or
    /// out-of-order parts, and transport errors as they occur.
    pub async fn next_part(&mut self) -> Result<Option<PartKind>, CodecError> {
        let Some(mut field) = self.multipart.next_field().await? else {
            return Ok(None);
        };
        let content_type = field
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .map(essence)
            .ok_or_else(|| CodecError::InvalidMessage("part without content type".into()))?;

        if self.stage == Stage::Done {
            return Err(CodecError::InvalidMessage(format!(
                "unexpected {content_type} part after the end of the message"
            )));
        }

        if let Some(kind) = MessageKind::from_content_type(&content_type) {
            if self.stage != Stage::Start {
                return Err(CodecError::InvalidMessage("duplicate message part".into()));
            }
            if kind != self.expected {
                return Err(CodecError::InvalidMessage(format!(
                    "expected a {} message part, got {content_type}",
                    self.expected.content_type()
                )));
            }
            let raw = field.bytes().await?;
            let digest = self.unit.algorithm.digest(&raw);
            self.unit.message = Some(Message::parse(kind, raw)?);
            self.unit.parts.push(PartDigest::new(PART_MESSAGE, &digest));
            self.unit.message_digest = Some(digest);
            self.stage = Stage::AfterMessage;
            return Ok(Some(PartKind::Message));
        }

        match content_type.as_str() {
            CONTENT_TYPE_BODY => {
                if self.stage != Stage::AfterMessage {
                    return Err(CodecError::InvalidMessage("unexpected body part".into()));
                }
                let original = field
                    .headers()
                    .get(HEADER_ORIGINAL_CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let mut spooler = BodySpooler::new(self.unit.algorithm, self.spool_threshold);
                while let Some(chunk) = field.chunk().await? {
                    spooler.write(&chunk).await?;
                }
                let body = spooler.finish(original).await?;
                self.unit.parts.push(PartDigest::new(PART_BODY, body.digest()));
                self.unit.body_digest = Some(body.digest().to_vec());
                self.unit.body = Some(body);
                self.stage = Stage::AfterBody;
                Ok(Some(PartKind::Body))
            }
            CONTENT_TYPE_OCSP => {
                if !matches!(self.stage, Stage::AfterMessage | Stage::AfterBody | Stage::AfterOcsp) {
                    return Err(CodecError::InvalidMessage("unexpected OCSP part".into()));
                }
                let raw = field.bytes().await?;
                let response: OcspResponse = serde_json::from_slice(&raw)?;
                self.unit.ocsp.push(response);
                self.stage = Stage::AfterOcsp;
                Ok(Some(PartKind::Ocsp))
            }
            CONTENT_TYPE_FAULT => {
                if self.stage == Stage::AfterLeadingFault {
                    return Err(CodecError::InvalidMessage("duplicate fault part".into()));
                }
                let raw = field.bytes().await?;
                let document: FaultDocument = serde_json::from_slice(&raw)?;
                let digest = self.unit.algorithm.digest(&raw);
                self.unit.fault = Some(document.fault);
                self.unit.parts.push(PartDigest::new(PART_FAULT, &digest));
                // A fault in place of the signature ends the unit unsigned.
                self.stage = if self.stage == Stage::Start {
                    Stage::AfterLeadingFault
                } else {
                    Stage::Done
                };
                Ok(Some(PartKind::Fault))
            }
            CONTENT_TYPE_SIGNATURE => {
                if self.stage == Stage::Start {
                    return Err(CodecError::InvalidMessage("signature before message".into()));
                }
                let raw = field.bytes().await?;
                let signature: SignatureData = serde_json::from_slice(&raw)?;
                self.unit.signature = Some(signature);
                self.stage = Stage::Done;
                Ok(Some(PartKind::Signature))
            }
            other => Err(CodecError::InvalidMessage(format!("unknown part type {other}"))),
        }
    }

    /// Reads the remaining parts and returns the complete unit.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`next_part`](Self::next_part):
    /// [`CodecError::MissingMessage`] if neither message nor fault arrived,
    /// [`CodecError::MissingSignature`] if a message arrived unsigned.
    pub async fn decode_all(mut self) -> Result<ProxyMessage, CodecError> {
        while self.next_part().await?.is_some() {}
        let unit = self.unit;
        if unit.message.is_none() && unit.fault.is_none() {
            return Err(CodecError::MissingMessage(self.expected));
        }
        if unit.fault.is_none() && unit.signature.is_none() {
            return Err(CodecError::MissingSignature);
        }
        Ok(unit)
    }
}

/// Extracts the boundary parameter of a multipart content type.
///
/// # Errors
///
/// Returns [`CodecError::InvalidContentType`] for non-multipart types or a
/// missing boundary.
pub fn parse_boundary(content_type: &str) -> Result<String, CodecError> {
    let invalid = || CodecError::InvalidContentType(content_type.to_string());
    if !essence(content_type).starts_with("multipart/") {
        return Err(invalid());
    }
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
        .ok_or_else(invalid)
}

/// Largest whole-response fault document accepted from a peer.
pub const MAX_FAULT_DOCUMENT: usize = 64 * 1024;

/// Reads a whole-response fault document (a non-multipart fault answer).
///
/// # Errors
///
/// Returns [`CodecError`] if the stream fails, exceeds
/// [`MAX_FAULT_DOCUMENT`] or the document does not parse.
pub async fn decode_fault_document<S, E>(stream: S) -> Result<Fault, CodecError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let raw = collect(stream, MAX_FAULT_DOCUMENT).await?;
    let document: FaultDocument = serde_json::from_slice(&raw)?;
    Ok(document.fault)
}

/// Collects a byte stream into one buffer of at most `limit` bytes.
///
/// # Errors
///
/// Returns [`CodecError::Body`] if the stream fails and
/// [`CodecError::TooLarge`] once more than `limit` bytes arrive.
pub async fn collect<S, E>(mut stream: S, limit: usize) -> Result<Bytes, CodecError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CodecError::Body(e.to_string()))?;
        if chunk.len() > limit - out.len() {
            return Err(CodecError::TooLarge(limit));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_is_extracted() {
        assert_eq!(parse_boundary("multipart/mixed; boundary=abc").unwrap(), "abc");
        assert_eq!(parse_boundary("Multipart/Mixed; charset=x; Boundary=\"q r\"").unwrap(), "q r");
    }

    #[test]
    fn non_multipart_types_are_rejected() {
        for ct in ["application/json", "multipart/mixed", "multipart/mixed; boundary="] {
            assert!(matches!(parse_boundary(ct), Err(CodecError::InvalidContentType(_))));
        }
    }
}
