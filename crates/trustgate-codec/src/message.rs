//! Message parts: envelopes, REST requests and REST responses.
//!
//! Every parsed message keeps the exact bytes it was parsed from. Digests and
//! signatures are always computed over those bytes, never over a
//! re-serialization.

use crate::headers::{CONTENT_TYPE_ENVELOPE, CONTENT_TYPE_REST_REQUEST, CONTENT_TYPE_REST_RESPONSE};
use crate::CodecError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use trustgate_types::{PartyId, SecurityServerId, ServiceId};

/// Which kind of message a part carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Envelope,
    RestRequest,
    RestResponse,
}

impl MessageKind {
    /// Part content type for this kind.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Envelope => CONTENT_TYPE_ENVELOPE,
            Self::RestRequest => CONTENT_TYPE_REST_REQUEST,
            Self::RestResponse => CONTENT_TYPE_REST_RESPONSE,
        }
    }

    /// Kind for a part content type.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            CONTENT_TYPE_ENVELOPE => Some(Self::Envelope),
            CONTENT_TYPE_REST_REQUEST => Some(Self::RestRequest),
            CONTENT_TYPE_REST_RESPONSE => Some(Self::RestResponse),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Envelope => "envelope",
            Self::RestRequest | Self::RestResponse => "REST",
        })
    }
}

/// Echoed request hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHashValue {
    /// Digest algorithm identifier.
    pub algorithm: String,
    /// Base64 digest value.
    pub value: String,
}

/// Envelope header fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    pub client: PartyId,
    pub service: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_server: Option<SecurityServerId>,
    /// Query id.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    /// Present on responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<RequestHashValue>,
}

#[derive(Deserialize)]
struct EnvelopeDoc {
    header: EnvelopeHeader,
}

/// An envelope message: `{"header": {...}, "body": ...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    raw: Bytes,
    header: EnvelopeHeader,
}

impl Envelope {
    /// Parses an envelope from its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidMessage`] if the document is not an
    /// envelope.
    pub fn parse(raw: Bytes) -> Result<Self, CodecError> {
        let doc: EnvelopeDoc = serde_json::from_slice(&raw)
            .map_err(|e| CodecError::InvalidMessage(format!("malformed envelope: {e}")))?;
        Ok(Self {
            raw,
            header: doc.header,
        })
    }

    /// Builds an envelope from a header and a body.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if serialization fails.
    pub fn build(header: EnvelopeHeader, body: serde_json::Value) -> Result<Self, CodecError> {
        let raw = serde_json::to_vec(&serde_json::json!({ "header": header, "body": body }))?;
        Ok(Self {
            raw: Bytes::from(raw),
            header,
        })
    }

    /// Returns a copy with `requestHash` set in the header. Everything else
    /// in the document is kept as sent.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the document cannot be rewritten.
    pub fn with_request_hash(&self, hash: RequestHashValue) -> Result<Self, CodecError> {
        let mut doc: serde_json::Value = serde_json::from_slice(&self.raw)?;
        let header = doc
            .get_mut("header")
            .and_then(serde_json::Value::as_object_mut)
            .ok_or_else(|| CodecError::InvalidMessage("envelope has no header".into()))?;
        header.insert("requestHash".to_string(), serde_json::to_value(&hash)?);
        Self::parse(Bytes::from(serde_json::to_vec(&doc)?))
    }

    /// Exact bytes of the message.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Parsed header.
    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// The envelope body.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the raw bytes no longer parse.
    pub fn body(&self) -> Result<serde_json::Value, CodecError> {
        let mut doc: serde_json::Value = serde_json::from_slice(&self.raw)?;
        Ok(doc
            .get_mut("body")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }
}

/// One HTTP header carried inside a REST message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// REST request metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestRequest {
    pub client: PartyId,
    pub service: ServiceId,
    pub query_id: String,
    pub x_request_id: String,
    pub verb: String,
    /// Path below the service, always starting with `/` (may be just `/`).
    pub service_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: Vec<HeaderField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_security_server: Option<SecurityServerId>,
}

/// REST response metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestResponse {
    pub client: PartyId,
    pub service: ServiceId,
    pub query_id: String,
    pub x_request_id: String,
    pub request_hash: RequestHashValue,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub headers: Vec<HeaderField>,
}

/// A JSON message together with the bytes it was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    raw: Bytes,
    value: T,
}

impl<T: Serialize + DeserializeOwned> Parsed<T> {
    /// Serializes `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if serialization fails.
    pub fn new(value: T) -> Result<Self, CodecError> {
        Ok(Self {
            raw: Bytes::from(serde_json::to_vec(&value)?),
            value,
        })
    }

    /// Parses `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidMessage`] if the bytes do not parse.
    pub fn parse(raw: Bytes) -> Result<Self, CodecError> {
        let value = serde_json::from_slice(&raw)
            .map_err(|e| CodecError::InvalidMessage(format!("malformed REST message: {e}")))?;
        Ok(Self { raw, value })
    }

    /// Exact bytes.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

impl<T> Deref for Parsed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Any message part.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Envelope(Envelope),
    RestRequest(Parsed<RestRequest>),
    RestResponse(Parsed<RestResponse>),
}

impl Message {
    /// Parses a message part of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidMessage`] if the bytes do not parse.
    pub fn parse(kind: MessageKind, raw: Bytes) -> Result<Self, CodecError> {
        Ok(match kind {
            MessageKind::Envelope => Self::Envelope(Envelope::parse(raw)?),
            MessageKind::RestRequest => Self::RestRequest(Parsed::parse(raw)?),
            MessageKind::RestResponse => Self::RestResponse(Parsed::parse(raw)?),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Envelope(_) => MessageKind::Envelope,
            Self::RestRequest(_) => MessageKind::RestRequest,
            Self::RestResponse(_) => MessageKind::RestResponse,
        }
    }

    pub fn raw(&self) -> &Bytes {
        match self {
            Self::Envelope(m) => m.raw(),
            Self::RestRequest(m) => m.raw(),
            Self::RestResponse(m) => m.raw(),
        }
    }

    pub fn client(&self) -> &PartyId {
        match self {
            Self::Envelope(m) => &m.header().client,
            Self::RestRequest(m) => &m.client,
            Self::RestResponse(m) => &m.client,
        }
    }

    pub fn service(&self) -> &ServiceId {
        match self {
            Self::Envelope(m) => &m.header().service,
            Self::RestRequest(m) => &m.service,
            Self::RestResponse(m) => &m.service,
        }
    }

    pub fn query_id(&self) -> &str {
        match self {
            Self::Envelope(m) => &m.header().id,
            Self::RestRequest(m) => &m.query_id,
            Self::RestResponse(m) => &m.query_id,
        }
    }

    /// Security server the request was addressed to, if named.
    pub fn target_security_server(&self) -> Option<&SecurityServerId> {
        match self {
            Self::Envelope(m) => m.header().security_server.as_ref(),
            Self::RestRequest(m) => m.target_security_server.as_ref(),
            Self::RestResponse(_) => None,
        }
    }

    /// Request hash echoed by a response.
    pub fn request_hash(&self) -> Option<&RequestHashValue> {
        match self {
            Self::Envelope(m) => m.header().request_hash.as_ref(),
            Self::RestRequest(_) => None,
            Self::RestResponse(m) => Some(&m.request_hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> EnvelopeHeader {
        EnvelopeHeader {
            client: PartyId::subsystem("EE", "GOV", "2", "app"),
            service: ServiceId::new(PartyId::subsystem("EE", "GOV", "1", "reg"), "getPerson"),
            security_server: None,
            id: "EE-123".into(),
            user_id: Some("EE38001010000".into()),
            issue: None,
            request_hash: None,
        }
    }

    #[test]
    fn envelope_keeps_raw_bytes() {
        let raw = Bytes::from_static(
            br#"{"header":{"client":{"instance":"EE","memberClass":"GOV","memberCode":"2"},"service":{"instance":"EE","memberClass":"GOV","memberCode":"1","serviceCode":"s"},"id":"q1"},  "body":{"x":1}}"#,
        );
        let envelope = Envelope::parse(raw.clone()).unwrap();
        assert_eq!(envelope.raw(), &raw);
        assert_eq!(envelope.header().id, "q1");
        assert_eq!(envelope.body().unwrap()["x"], 1);
    }

    #[test]
    fn envelope_without_header_is_invalid() {
        assert!(matches!(
            Envelope::parse(Bytes::from_static(br#"{"body":{}}"#)),
            Err(CodecError::InvalidMessage(_))
        ));
    }

    #[test]
    fn request_hash_insertion_preserves_body() {
        let envelope = Envelope::build(header(), serde_json::json!({"name": "Mari"})).unwrap();
        let hash = RequestHashValue {
            algorithm: "SHA-512".into(),
            value: "abc=".into(),
        };
        let with_hash = envelope.with_request_hash(hash.clone()).unwrap();
        assert_eq!(with_hash.header().request_hash.as_ref(), Some(&hash));
        assert_eq!(with_hash.body().unwrap()["name"], "Mari");
        assert_eq!(with_hash.header().user_id, envelope.header().user_id);
    }

    #[test]
    fn message_accessors_cover_rest() {
        let request = Parsed::new(RestRequest {
            client: PartyId::subsystem("EE", "GOV", "2", "app"),
            service: ServiceId::new(PartyId::subsystem("EE", "GOV", "1", "reg"), "people"),
            query_id: "q".into(),
            x_request_id: "x".into(),
            verb: "GET".into(),
            service_path: "/people/1".into(),
            query: Some("full=true".into()),
            headers: vec![HeaderField::new("accept", "application/json")],
            target_security_server: None,
        })
        .unwrap();
        let message = Message::RestRequest(request);
        assert_eq!(message.kind(), MessageKind::RestRequest);
        assert_eq!(message.query_id(), "q");
        assert!(message.request_hash().is_none());
        let reparsed = Message::parse(MessageKind::RestRequest, message.raw().clone()).unwrap();
        assert_eq!(reparsed, message);
    }
}
