//! Service handlers: what the provider side does with a verified request.
//!
//! Handlers named in `server.service_handlers` are tried in order; the
//! forwarder that calls the configured service address handles everything
//! else.

use crate::config::ConfigError;
use crate::error::network_error;
use crate::headers::{insert, to_fields, to_header_map, X_ROAD_CLIENT, X_ROAD_ID, X_ROAD_REQUEST_ID, X_ROAD_SERVICE};
use super::checked_path;
use crate::streams::{channel_stream, field_stream, related_document, BodyStream};
use crate::AppState;
use async_trait::async_trait;
use axum::http::header;
use bytes::Bytes;
use futures_util::{stream, StreamExt, TryStreamExt};
use multer::Multipart;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use trustgate_codec::{
    essence, parse_boundary, CodecError, Envelope, EnvelopeHeader, HeaderField, Message,
    MessageKind, RestRequest, SpooledBody,
};
use trustgate_types::{CodedError, ErrorCode, FaultDocument, ServiceId, PREFIX_SERVICE_FAILED};
use url::Url;

/// Service code answered by [`ListMethodsHandler`].
pub const LIST_METHODS: &str = "listMethods";

/// A verified request on its way to a handler.
#[derive(Debug)]
pub struct ServiceRequest {
    pub message: Message,
    pub body: Option<SpooledBody>,
    /// REST service path with dot segments resolved, as access was checked
    /// against it.
    pub service_path: Option<String>,
    pub x_request_id: String,
}

/// What a handler produced. The provider turns it into the response message
/// of the exchange.
#[derive(Debug)]
pub enum ServiceResponse {
    Envelope {
        envelope: Envelope,
        attachment: Option<BodyStream>,
    },
    Rest {
        status: u16,
        reason: Option<String>,
        headers: Vec<HeaderField>,
        body: Option<BodyStream>,
    },
}

#[async_trait]
pub trait ServiceHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, service: &ServiceId, kind: MessageKind) -> bool;

    /// Whether access rights and the service registration are checked.
    fn should_verify_access(&self) -> bool {
        true
    }

    fn should_verify_signature(&self) -> bool {
        true
    }

    /// Whether the request signature goes into the exchange log.
    fn should_log_signature(&self) -> bool {
        true
    }

    async fn start_handling(
        &self,
        state: &AppState,
        request: &mut ServiceRequest,
    ) -> Result<ServiceResponse, CodedError>;

    /// Called once the response has been produced.
    fn finish_handling(&self) -> Result<(), CodedError> {
        Ok(())
    }
}

/// Handler lookup in configuration order.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ServiceHandler>>,
    fallback: Arc<dyn ServiceHandler>,
}

impl HandlerRegistry {
    /// Builds the registry from handler names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownHandler`] for a name no handler has.
    pub fn from_names(names: &[String]) -> Result<Self, ConfigError> {
        let handlers = names
            .iter()
            .map(|name| match name.as_str() {
                "list-methods" => Ok(Arc::new(ListMethodsHandler) as Arc<dyn ServiceHandler>),
                other => Err(ConfigError::UnknownHandler(other.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            handlers,
            fallback: Arc::new(ForwardingHandler),
        })
    }

    /// The first handler that takes `service`, or the forwarder.
    pub fn find(&self, service: &ServiceId, kind: MessageKind) -> Arc<dyn ServiceHandler> {
        self.handlers
            .iter()
            .find(|handler| handler.can_handle(service, kind))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Lists the services a provider has registered on this server.
pub struct ListMethodsHandler;

#[async_trait]
impl ServiceHandler for ListMethodsHandler {
    fn name(&self) -> &'static str {
        "list-methods"
    }

    fn can_handle(&self, service: &ServiceId, _kind: MessageKind) -> bool {
        service.service_code == LIST_METHODS
    }

    fn should_verify_access(&self) -> bool {
        false
    }

    async fn start_handling(
        &self,
        state: &AppState,
        request: &mut ServiceRequest,
    ) -> Result<ServiceResponse, CodedError> {
        let service = request.message.service();
        let mut services = state.server.services(&service.provider);
        services.retain(|s| s.service_code != LIST_METHODS);
        let listing = serde_json::json!({ "service": services });

        match &request.message {
            Message::Envelope(envelope) => {
                let header = envelope.header();
                let response = Envelope::build(
                    EnvelopeHeader {
                        request_hash: None,
                        ..header.clone()
                    },
                    listing,
                )?;
                Ok(ServiceResponse::Envelope {
                    envelope: response,
                    attachment: None,
                })
            }
            Message::RestRequest(_) => {
                let body = Bytes::from(serde_json::to_vec(&listing).map_err(CodecError::from)?);
                Ok(ServiceResponse::Rest {
                    status: 200,
                    reason: Some("OK".into()),
                    headers: vec![HeaderField::new("content-type", "application/json")],
                    body: Some(BodyStream {
                        content_type: "application/json".into(),
                        stream: stream::once(async move { Ok(body) }).boxed(),
                    }),
                })
            }
            Message::RestResponse(_) => Err(CodecError::MissingMessage(MessageKind::RestRequest).into()),
        }
    }
}

/// Calls the service address registered for the service.
pub struct ForwardingHandler;

fn service_failed(err: CodedError) -> CodedError {
    err.with_prefix(PREFIX_SERVICE_FAILED)
}

fn service_url(state: &AppState, service: &ServiceId) -> Result<(Url, Duration), CodedError> {
    let address = state.server.service_address(service).ok_or_else(|| {
        CodedError::new(
            ErrorCode::ServiceMissingUrl,
            format!("Service address not specified for {service}"),
        )
    })?;
    let url = Url::parse(&address).map_err(|e| {
        CodedError::new(
            ErrorCode::MalformedServiceAddress,
            format!("Malformed service address {address}: {e}"),
        )
    })?;
    Ok((url, state.server.service_timeout(service)))
}

/// Appends the request path and query to the service base URL without
/// doubling the separating slash.
/// Appends a normalized service path to the service's base address.
fn rest_target(mut base: Url, service_path: &str, query: Option<&str>) -> Url {
    let path = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        service_path.trim_start_matches('/')
    );
    base.set_path(&path);
    base.set_query(query);
    base
}

fn check_envelope_header(request: &EnvelopeHeader, response: &EnvelopeHeader) -> Result<(), CodedError> {
    let mismatch = if response.client != request.client {
        Some("client identifier")
    } else if response.service != request.service {
        Some("service identifier")
    } else if response.id != request.id {
        Some("query id")
    } else {
        None
    };
    match mismatch {
        Some(what) => Err(service_failed(CodedError::new(
            ErrorCode::InconsistentResponse,
            format!("Service response {what} does not match the request"),
        ))),
        None => Ok(()),
    }
}

/// A JSON answer from an envelope service: either an envelope or a fault
/// document, which is relayed as is.
fn parse_service_envelope(raw: Bytes) -> Result<Envelope, CodedError> {
    if let Ok(document) = serde_json::from_slice::<FaultDocument>(&raw) {
        return Err(CodedError::from_fault(&document.fault));
    }
    Envelope::parse(raw).map_err(|e| service_failed(e.into()))
}

impl ForwardingHandler {
    async fn forward_envelope(
        &self,
        state: &AppState,
        request: &mut ServiceRequest,
        envelope: Envelope,
    ) -> Result<ServiceResponse, CodedError> {
        let (url, timeout) = service_url(state, request.message.service())?;
        let builder = state.service_client.post(url).timeout(timeout);
        let builder = match request.body.take() {
            Some(body) => {
                let attachment = BodyStream {
                    content_type: body.content_type().to_string(),
                    stream: body.into_stream().map_err(CodecError::from)?,
                };
                let (content_type, document) = related_document(envelope.raw().clone(), attachment);
                builder.header(header::CONTENT_TYPE, content_type).body(reqwest::Body::wrap_stream(
                    channel_stream(document, state.config.client.channel_capacity),
                ))
            }
            None => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(envelope.raw().clone()),
        };
        let response = builder
            .send()
            .await
            .map_err(|e| service_failed(network_error(&e)))?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let (response_envelope, attachment) = match essence(&content_type).as_str() {
            "application/json" => {
                let raw = response
                    .bytes()
                    .await
                    .map_err(|e| service_failed(network_error(&e)))?;
                (parse_service_envelope(raw)?, None)
            }
            "multipart/related" => {
                let boundary = parse_boundary(&content_type).map_err(|e| service_failed(e.into()))?;
                let mut multipart = Multipart::new(response.bytes_stream(), boundary);
                let invalid = |e: multer::Error| service_failed(CodecError::from(e).into());
                let first = multipart.next_field().await.map_err(invalid)?.ok_or_else(|| {
                    service_failed(CodecError::MissingMessage(MessageKind::Envelope).into())
                })?;
                let envelope = parse_service_envelope(first.bytes().await.map_err(invalid)?)?;
                let attachment = match multipart.next_field().await.map_err(invalid)? {
                    Some(field) => Some(BodyStream {
                        content_type: field
                            .content_type()
                            .map(|mime| mime.to_string())
                            .unwrap_or_else(|| "application/octet-stream".into()),
                        stream: field_stream(multipart, field),
                    }),
                    None => None,
                };
                (envelope, attachment)
            }
            other => {
                return Err(service_failed(CodedError::new(
                    ErrorCode::InvalidContentType,
                    format!("Invalid content type from service: {other}"),
                )))
            }
        };
        check_envelope_header(envelope.header(), response_envelope.header())?;
        Ok(ServiceResponse::Envelope {
            envelope: response_envelope,
            attachment,
        })
    }

    async fn forward_rest(
        &self,
        state: &AppState,
        request: &mut ServiceRequest,
        rest: RestRequest,
    ) -> Result<ServiceResponse, CodedError> {
        let (base, timeout) = service_url(state, &rest.service)?;
        let service_path = match request.service_path.clone() {
            Some(path) => path,
            None => checked_path(&rest.service_path)?.encoded,
        };
        let url = rest_target(base, &service_path, rest.query.as_deref());
        let method = reqwest::Method::from_bytes(rest.verb.as_bytes()).map_err(|e| {
            CodedError::new(ErrorCode::InvalidHttpMethod, format!("Invalid method {}: {e}", rest.verb))
        })?;

        let mut headers = to_header_map(&rest.headers);
        insert(&mut headers, X_ROAD_CLIENT, &rest.client.to_string());
        insert(&mut headers, X_ROAD_SERVICE, &rest.service.to_string());
        insert(&mut headers, X_ROAD_ID, &rest.query_id);
        insert(&mut headers, X_ROAD_REQUEST_ID, &request.x_request_id);

        let mut builder = state.service_client.request(method, url).timeout(timeout);
        if let Some(body) = request.body.take() {
            if let Ok(value) = header::HeaderValue::from_str(body.content_type()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            let stream = body.into_stream().map_err(CodecError::from)?;
            builder = builder.body(reqwest::Body::wrap_stream(channel_stream(
                stream,
                state.config.client.channel_capacity,
            )));
        }
        let response = builder
            .headers(headers)
            .send()
            .await
            .map_err(|e| service_failed(network_error(&e)))?;

        let status = response.status();
        let headers = to_fields(response.headers());
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(ServiceResponse::Rest {
            status: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
            headers,
            body: Some(BodyStream {
                content_type,
                stream: response.bytes_stream().map_err(io::Error::other).boxed(),
            }),
        })
    }
}

#[async_trait]
impl ServiceHandler for ForwardingHandler {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn can_handle(&self, _service: &ServiceId, _kind: MessageKind) -> bool {
        true
    }

    async fn start_handling(
        &self,
        state: &AppState,
        request: &mut ServiceRequest,
    ) -> Result<ServiceResponse, CodedError> {
        match request.message.clone() {
            Message::Envelope(envelope) => self.forward_envelope(state, request, envelope).await,
            Message::RestRequest(rest) => {
                let rest = RestRequest::clone(&rest);
                self.forward_rest(state, request, rest).await
            }
            Message::RestResponse(_) => Err(CodecError::MissingMessage(MessageKind::RestRequest).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_types::PartyId;

    fn service(code: &str) -> ServiceId {
        ServiceId::new(PartyId::subsystem("EE", "GOV", "1", "reg"), code)
    }

    #[test]
    fn registry_prefers_named_handlers() {
        let registry = HandlerRegistry::from_names(&["list-methods".to_string()]).unwrap();
        assert_eq!(registry.find(&service(LIST_METHODS), MessageKind::Envelope).name(), "list-methods");
        assert_eq!(registry.find(&service("getPerson"), MessageKind::RestRequest).name(), "forward");

        let bare = HandlerRegistry::from_names(&[]).unwrap();
        assert_eq!(bare.find(&service(LIST_METHODS), MessageKind::Envelope).name(), "forward");
    }

    #[test]
    fn unknown_handler_names_are_rejected() {
        let err = HandlerRegistry::from_names(&["metadata".to_string()]).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownHandler(name) if name == "metadata"));
    }

    #[test]
    fn rest_target_joins_paths_once() {
        let base = Url::parse("http://svc.local:8000/api/").unwrap();
        let url = rest_target(base.clone(), "/persons/5", Some("full=true"));
        assert_eq!(url.as_str(), "http://svc.local:8000/api/persons/5?full=true");

        let url = rest_target(Url::parse("http://svc.local:8000/api").unwrap(), "/", None);
        assert_eq!(url.as_str(), "http://svc.local:8000/api/");
    }

    #[test]
    fn rest_target_stays_under_the_base_path() {
        let base = Url::parse("http://svc.local:8000/api/").unwrap();
        let err = checked_path("/persons/../%2e%2e/admin").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::AccessDenied));

        let path = checked_path("/persons/x/../7%20b").unwrap().encoded;
        let url = rest_target(base, &path, None);
        assert_eq!(url.as_str(), "http://svc.local:8000/api/persons/7%20b");
    }

    #[test]
    fn service_fault_documents_are_relayed() {
        let raw = Bytes::from_static(br#"{"fault":{"faultCode":"Server.Db","faultString":"down"}}"#);
        let err = parse_service_envelope(raw).unwrap_err();
        assert!(err.is_relayed());
        assert_eq!(err.code(), "Server.Db");

        let err = parse_service_envelope(Bytes::from_static(b"{\"x\":1}")).unwrap_err();
        assert_eq!(err.code(), "ServiceFailed.InvalidMessage");
    }

    #[test]
    fn mismatched_service_header_is_inconsistent() {
        let request = EnvelopeHeader {
            client: PartyId::subsystem("EE", "GOV", "2", "app"),
            service: service("getPerson"),
            security_server: None,
            id: "q1".into(),
            user_id: None,
            issue: None,
            request_hash: None,
        };
        assert!(check_envelope_header(&request, &request).is_ok());
        let other = EnvelopeHeader {
            id: "q2".into(),
            ..request.clone()
        };
        let err = check_envelope_header(&request, &other).unwrap_err();
        assert_eq!(err.code(), "ServiceFailed.InconsistentResponse");
    }
}
