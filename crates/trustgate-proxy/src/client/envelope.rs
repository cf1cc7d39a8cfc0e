//! Consumer-side processing of envelope requests.

use super::{authorize_caller, check_consistency, exchange, Outbound};
use crate::headers::header_str;
use crate::listener::PeerInfo;
use crate::processor::MessageProcessor;
use crate::streams::{field_stream, related_document, BodyStream};
use crate::AppState;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use multer::Multipart;
use std::sync::Arc;
use trustgate_codec::{essence, parse_boundary, CodecError, Envelope, Message, MessageKind};
use trustgate_observe::{MessageProtocol, OpMonitoringData, ProxyRole};
use trustgate_types::{CodedError, ErrorCode};

const CONTENT_TYPE_JSON: &str = "application/json";

/// Largest envelope accepted from a caller.
const MAX_ENVELOPE_BYTES: usize = 32 * 1024 * 1024;

/// Handles one envelope request from a local information system.
pub struct EnvelopeConsumer {
    state: Arc<AppState>,
    peer: PeerInfo,
    request: Option<Request>,
    monitoring: OpMonitoringData,
    succeeded: bool,
}

impl EnvelopeConsumer {
    pub fn new(state: Arc<AppState>, peer: PeerInfo, request: Request) -> Self {
        let mut monitoring = OpMonitoringData::new(ProxyRole::Client);
        monitoring.protocol = Some(MessageProtocol::Envelope);
        Self {
            state,
            peer,
            request: Some(request),
            monitoring,
            succeeded: false,
        }
    }
}

/// Reads the envelope, and the attachment stream if the caller sent a
/// `multipart/related` document. The attachment is left unread.
async fn read_request(request: Request) -> Result<(Envelope, Option<BodyStream>), CodedError> {
    let content_type = header_str(request.headers(), header::CONTENT_TYPE.as_str())
        .unwrap_or_default()
        .to_string();
    match essence(&content_type).as_str() {
        CONTENT_TYPE_JSON => {
            let raw = axum::body::to_bytes(request.into_body(), MAX_ENVELOPE_BYTES)
                .await
                .map_err(|e| {
                    CodedError::new(ErrorCode::InvalidMessage, format!("Could not read envelope: {e}"))
                })?;
            Ok((Envelope::parse(raw)?, None))
        }
        "multipart/related" => {
            let boundary = parse_boundary(&content_type)?;
            let mut multipart = Multipart::new(request.into_body().into_data_stream(), boundary);
            let first = multipart
                .next_field()
                .await
                .map_err(CodecError::from)?
                .ok_or(CodecError::MissingMessage(MessageKind::Envelope))?;
            let envelope = Envelope::parse(first.bytes().await.map_err(CodecError::from)?)?;
            let attachment = match multipart.next_field().await.map_err(CodecError::from)? {
                Some(field) => {
                    let content_type = field
                        .content_type()
                        .map(|mime| mime.to_string())
                        .unwrap_or_else(|| "application/octet-stream".to_string());
                    Some(BodyStream {
                        content_type,
                        stream: field_stream(multipart, field),
                    })
                }
                None => None,
            };
            Ok((envelope, attachment))
        }
        other => Err(CodedError::new(
            ErrorCode::InvalidContentType,
            format!("Invalid content type: {other}"),
        )),
    }
}

#[async_trait]
impl MessageProcessor for EnvelopeConsumer {
    async fn process(&mut self) -> Result<Response, CodedError> {
        let request = self.request.take().ok_or_else(|| {
            CodedError::new(ErrorCode::InternalError, "request already processed")
        })?;
        let state = self.state.clone();

        let wait = state.config.client.envelope_wait();
        let (envelope, attachment) = tokio::time::timeout(wait, read_request(request))
            .await
            .map_err(|_| {
                CodedError::new(
                    ErrorCode::IoError,
                    format!("Envelope was not received within {} ms", wait.as_millis()),
                )
            })??;

        let header = envelope.header().clone();
        let x_request_id = uuid::Uuid::new_v4().to_string();
        self.monitoring.client = Some(header.client.clone());
        self.monitoring.service = Some(header.service.clone());
        self.monitoring.message_id = Some(header.id.clone());
        self.monitoring.x_request_id = Some(x_request_id.clone());

        header
            .client
            .validate()
            .map_err(|e| CodedError::new(ErrorCode::InvalidClientIdentifier, e.to_string()))?;
        header
            .service
            .validate()
            .map_err(|e| CodedError::new(ErrorCode::InvalidServiceIdentifier, e.to_string()))?;
        if let Some(server) = &header.security_server {
            server
                .validate()
                .map_err(|e| CodedError::new(ErrorCode::InvalidSecurityServer, e.to_string()))?;
        }
        authorize_caller(&state, &header.client, &self.peer)?;

        let request_message = Message::Envelope(envelope);
        let mut inbound = exchange(
            &state,
            Outbound {
                message: request_message.clone(),
                body: attachment,
                x_request_id: x_request_id.clone(),
            },
            &mut self.monitoring,
        )
        .await?;
        check_consistency(
            &request_message,
            &inbound.message,
            &inbound.request_hash,
            &x_request_id,
            inbound.x_request_id.as_deref(),
        )?;

        let Message::Envelope(response_envelope) = &inbound.message else {
            return Err(CodecError::MissingMessage(MessageKind::Envelope).into());
        };
        let raw = response_envelope.raw().clone();
        let mut response_size = raw.len() as u64;
        let response = match inbound.unit.take_body() {
            Some(body) => {
                response_size += body.len();
                let attachment = BodyStream {
                    content_type: body.content_type().to_string(),
                    stream: body.into_stream().map_err(CodecError::from)?,
                };
                let (content_type, document) = related_document(raw, attachment);
                ([(header::CONTENT_TYPE, content_type)], Body::from_stream(document)).into_response()
            }
            None => ([(header::CONTENT_TYPE, CONTENT_TYPE_JSON)], raw).into_response(),
        };
        inbound.unit.consume();

        self.succeeded = true;
        self.monitoring.succeeded = true;
        self.monitoring.response_size = response_size;
        self.monitoring.response_out_ts = Some(Utc::now());
        state.store_monitoring(&self.monitoring);
        Ok(response)
    }

    fn verify_exchange_succeeded(&self) -> bool {
        self.succeeded
    }

    fn monitoring(&mut self) -> &mut OpMonitoringData {
        &mut self.monitoring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use trustgate_types::{PartyId, ServiceId};

    fn envelope_json() -> String {
        serde_json::json!({
            "header": {
                "client": PartyId::subsystem("EE", "GOV", "2", "app"),
                "service": ServiceId::new(PartyId::subsystem("EE", "GOV", "1", "reg"), "getPerson"),
                "id": "q1",
            },
            "body": {"personCode": "123"}
        })
        .to_string()
    }

    fn request(content_type: &str, body: impl Into<Body>) -> Request {
        Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, content_type)
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn reads_plain_json_envelope() {
        let (envelope, attachment) = read_request(request("application/json; charset=utf-8", envelope_json()))
            .await
            .unwrap();
        assert_eq!(envelope.header().id, "q1");
        assert!(attachment.is_none());
    }

    #[tokio::test]
    async fn reads_envelope_with_attachment() {
        let body = format!(
            "--b1\r\nContent-Type: application/json\r\n\r\n{}\r\n--b1\r\nContent-Type: image/png\r\n\r\nPNGDATA\r\n--b1--\r\n",
            envelope_json()
        );
        let (envelope, attachment) = read_request(request("multipart/related; boundary=b1", body))
            .await
            .unwrap();
        assert_eq!(envelope.header().id, "q1");
        let attachment = attachment.unwrap();
        assert_eq!(attachment.content_type, "image/png");
        let data: Bytes = trustgate_codec::collect(attachment.stream, usize::MAX).await.unwrap();
        assert_eq!(data, "PNGDATA");
    }

    #[tokio::test]
    async fn rejects_other_content_types() {
        let err = read_request(request("text/xml", "<a/>")).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::InvalidContentType));
    }

    #[tokio::test]
    async fn empty_related_document_has_no_envelope() {
        let err = read_request(request("multipart/related; boundary=b1", "--b1--\r\n"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::MissingEnvelope));
    }
}
