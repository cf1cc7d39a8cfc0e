//! Provider side: transport units from peer security servers, verified and
//! handed to the local service.
//!
//! Failures found before the provider's signing context is known are
//! answered with a bare fault document. From then on every fault goes back
//! as a signed transport unit.

pub mod envelope;
pub mod handlers;
pub mod rest;

use crate::client::transport::server_url;
use crate::error::{conf_error, peer_fault};
use crate::headers::{header_str, insert};
use crate::listener::PeerInfo;
use crate::processor::MessageProcessor;
use crate::streams::BodyStream;
use crate::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Extension, Request};
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use chrono::Utc;
use handlers::{ServiceHandler, ServiceRequest, ServiceResponse};
use std::sync::Arc;
use trustgate_codec::{
    CodecError, DigestAlgorithm, EncodedBody, Message, MessageKind, PartKind, ProxyMessageDecoder,
    ProxyMessageEncoder, HEADER_HASH_ALGORITHM, HEADER_MESSAGE_TYPE, HEADER_REQUEST_ID,
    HEADER_VERSION, MESSAGE_TYPE_REST, PROTOCOL_VERSION,
};
use trustgate_conf::{normalize_path, NormalizedPath, SigningCtx};
use trustgate_observe::{MessageRecord, OpMonitoringData, ProxyRole};
use trustgate_trust::cert_hash;
use trustgate_types::{CodedError, ErrorCode, OcspResponse, PartyId, PREFIX_SERVER_PROXY};

/// Entry point of the provider listener.
pub async fn provider_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<PeerInfo>,
    request: Request,
) -> Response {
    let requested_algorithm = header_str(request.headers(), HEADER_HASH_ALGORITHM).map(str::to_string);
    let incoming = match accept(&state, peer, request).await {
        Ok(incoming) => incoming,
        Err(err) => {
            let err = err.with_prefix(PREFIX_SERVER_PROXY);
            tracing::warn!(code = err.code(), message = err.message(), "rejected peer request");
            let mut monitoring = OpMonitoringData::new(ProxyRole::Producer);
            monitoring.set_fault(&err);
            monitoring.response_out_ts = Some(Utc::now());
            state.store_monitoring(&monitoring);
            return peer_fault(&err, requested_algorithm.as_deref());
        }
    };

    let algorithm = incoming.algorithm;
    let signing = incoming.signing.clone();
    let is_rest = incoming.message.kind() == MessageKind::RestRequest;
    let x_request_id = incoming.x_request_id.clone();
    let mut processor: Box<dyn MessageProcessor> = if is_rest {
        Box::new(rest::RestProvider::new(state.clone(), incoming))
    } else {
        Box::new(envelope::EnvelopeProvider::new(state.clone(), incoming))
    };

    match processor.process().await {
        Ok(response) => response,
        Err(err) => {
            let err = err.with_prefix(PREFIX_SERVER_PROXY);
            tracing::warn!(code = err.code(), message = err.message(), "peer request failed");
            let monitoring = processor.monitoring();
            monitoring.set_fault(&err);
            monitoring.response_out_ts = Some(Utc::now());
            state.store_monitoring(monitoring);
            signed_fault(&state, algorithm, is_rest, signing, &x_request_id, &err)
        }
    }
}

/// A request that passed the checks made before its unit is read in full.
pub(crate) struct Incoming {
    pub decoder: ProxyMessageDecoder,
    pub message: Message,
    pub algorithm: DigestAlgorithm,
    pub signing: Arc<dyn SigningCtx>,
    pub x_request_id: String,
    pub peer: PeerInfo,
}

async fn accept(state: &AppState, peer: PeerInfo, request: Request) -> Result<Incoming, CodedError> {
    if request.method() != Method::POST {
        return Err(CodedError::new(
            ErrorCode::InvalidHttpMethod,
            format!("Must use POST request method instead of {}", request.method()),
        ));
    }
    check_version(
        state.config.server.min_client_version.as_deref(),
        header_str(request.headers(), HEADER_VERSION),
    )?;
    state.global.verify_validity().map_err(conf_error)?;

    let algorithm = header_str(request.headers(), HEADER_HASH_ALGORITHM)
        .ok_or_else(|| CodedError::new(ErrorCode::InvalidProtocol, "Request has no hash algorithm"))?
        .parse::<DigestAlgorithm>()
        .map_err(|e| CodedError::new(ErrorCode::InvalidProtocol, e.to_string()))?;
    let kind = if header_str(request.headers(), HEADER_MESSAGE_TYPE)
        .is_some_and(|value| value.eq_ignore_ascii_case(MESSAGE_TYPE_REST))
    {
        MessageKind::RestRequest
    } else {
        MessageKind::Envelope
    };
    let x_request_id = header_str(request.headers(), HEADER_REQUEST_ID)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let content_type = header_str(request.headers(), header::CONTENT_TYPE.as_str())
        .unwrap_or_default()
        .to_string();

    let mut decoder = ProxyMessageDecoder::new(
        &content_type,
        request.into_body().into_data_stream(),
        algorithm,
        kind,
    )?
    .with_spool_threshold(state.config.server.spool_threshold_bytes);
    if decoder.next_part().await? != Some(PartKind::Message) {
        return Err(CodecError::MissingMessage(kind).into());
    }
    let message = decoder
        .message()
        .cloned()
        .ok_or(CodecError::MissingMessage(kind))?;

    let own = state.server.identifier();
    if let Some(target) = message.target_security_server() {
        if *target != own {
            return Err(CodedError::new(
                ErrorCode::InvalidSecurityServer,
                format!("Request is addressed to security server {target}, this is {own}"),
            ));
        }
    }
    if !state.global.member_exists(message.client()) {
        return Err(CodedError::new(
            ErrorCode::UnknownMember,
            format!("Client '{}' not found", message.client()),
        ));
    }
    let provider = &message.service().provider;
    let signing = state.keys.signing_ctx(provider).ok_or_else(|| {
        CodedError::new(
            ErrorCode::UnknownMember,
            format!("No signing key available for service provider '{provider}'"),
        )
    })?;

    Ok(Incoming {
        decoder,
        message,
        algorithm,
        signing,
        x_request_id,
        peer,
    })
}

fn parse_version(version: &str) -> Option<Vec<u64>> {
    version.trim().split('.').map(|part| part.parse().ok()).collect()
}

/// Rejects peers older than `minimum`. Versions compare by numeric dotted
/// segments, missing segments counting as zero.
fn check_version(minimum: Option<&str>, version: Option<&str>) -> Result<(), CodedError> {
    let Some(minimum) = minimum else {
        return Ok(());
    };
    let unsupported = || {
        CodedError::new(
            ErrorCode::ClientProxyVersionNotSupported,
            format!(
                "The version of the client security server ({}) is not supported, the minimum is {minimum}",
                version.unwrap_or("unknown")
            ),
        )
    };
    let (Some(mut required), Some(mut actual)) = (parse_version(minimum), version.and_then(parse_version)) else {
        return Err(unsupported());
    };
    let len = required.len().max(actual.len());
    required.resize(len, 0);
    actual.resize(len, 0);
    if actual < required {
        Err(unsupported())
    } else {
        Ok(())
    }
}

/// Checks the TLS client certificate of the sending security server: it must
/// belong to a server that serves the client, chain to a trusted CA and
/// carry fresh OCSP evidence.
async fn verify_peer(
    state: &AppState,
    peer: &PeerInfo,
    client: &PartyId,
    ocsp: &[OcspResponse],
) -> Result<(), CodedError> {
    let failed = |message: String| CodedError::new(ErrorCode::SslAuthFailed, message);
    let leaf = peer
        .leaf()
        .ok_or_else(|| failed("Client security server did not present a TLS certificate".into()))?;
    let hash = cert_hash(leaf);
    let server = state
        .global
        .server_by_auth_cert(&hash)
        .ok_or_else(|| failed(format!("Unknown authentication certificate {hash}")))?;
    let serves_client = state
        .global
        .provider_addresses(client)
        .into_iter()
        .chain(state.global.provider_addresses(&client.member_id()))
        .any(|address| address.server == server);
    if !serves_client {
        return Err(failed(format!(
            "Security server {server} does not serve client {client}"
        )));
    }

    let relay = state
        .global
        .security_server_address(&server)
        .and_then(|address| server_url(&address, state.config.client.server_port, true).ok());
    state
        .trust
        .verify(&client.instance, &[leaf.to_vec()], ocsp, relay.as_ref())
        .await?;
    Ok(())
}

/// Resolves dot segments once so access checks and forwarding see the same
/// path.
pub(crate) fn checked_path(raw: &str) -> Result<NormalizedPath, CodedError> {
    normalize_path(raw).ok_or_else(|| {
        CodedError::new(ErrorCode::AccessDenied, format!("Request path is not allowed: {raw}"))
    })
}

/// Service registration and access checks, in this order: the service
/// exists, its type matches the request, it is enabled, the client may call
/// it.
fn verify_access(
    state: &AppState,
    message: &Message,
    method: Option<&str>,
    path: Option<&str>,
) -> Result<(), CodedError> {
    let service = message.service();
    if !state.server.service_exists(service) {
        return Err(CodedError::new(
            ErrorCode::UnknownService,
            format!("Unknown service: {service}"),
        ));
    }
    let is_rest = message.kind() != MessageKind::Envelope;
    match state.server.description_type(service) {
        Some(description) if description.is_rest() == is_rest => {}
        _ => {
            return Err(CodedError::new(
                ErrorCode::InvalidServiceType,
                format!("Service type of {service} does not match the request"),
            ))
        }
    }
    if let Some(notice) = state.server.disabled_notice(service) {
        return Err(CodedError::new(
            ErrorCode::ServiceDisabled,
            format!("Service {service} is disabled: {notice}"),
        ));
    }
    if !state
        .server
        .is_query_allowed(message.client(), service, method, path)
    {
        return Err(CodedError::new(
            ErrorCode::AccessDenied,
            format!("Request is not allowed: {service}"),
        ));
    }
    Ok(())
}

/// Result of running a handler on a verified request.
pub(crate) struct Handled {
    pub response: ServiceResponse,
    pub request_hash: Vec<u8>,
    pub handler: Arc<dyn ServiceHandler>,
}

/// State shared by both provider processors.
pub(crate) struct ProviderExchange {
    state: Arc<AppState>,
    pending: Option<(ProxyMessageDecoder, PeerInfo)>,
    pub request: Message,
    pub algorithm: DigestAlgorithm,
    signing: Arc<dyn SigningCtx>,
    pub x_request_id: String,
    pub monitoring: OpMonitoringData,
}

impl ProviderExchange {
    pub(crate) fn new(state: Arc<AppState>, incoming: Incoming) -> Self {
        let mut monitoring = OpMonitoringData::new(ProxyRole::Producer);
        monitoring.client = Some(incoming.message.client().clone());
        monitoring.service = Some(incoming.message.service().clone());
        monitoring.message_id = Some(incoming.message.query_id().to_string());
        monitoring.x_request_id = Some(incoming.x_request_id.clone());
        Self {
            state,
            pending: Some((incoming.decoder, incoming.peer)),
            request: incoming.message,
            algorithm: incoming.algorithm,
            signing: incoming.signing,
            x_request_id: incoming.x_request_id,
            monitoring,
        }
    }

    /// Reads the rest of the unit, authenticates the sender, authorizes the
    /// request and runs the handler for it.
    pub(crate) async fn handle(&mut self, method: Option<&str>, path: Option<&str>) -> Result<Handled, CodedError> {
        let (decoder, peer) = self.pending.take().ok_or_else(|| {
            CodedError::new(ErrorCode::InternalError, "request already processed")
        })?;
        let state = self.state.clone();
        let client = self.request.client().clone();

        let mut unit = decoder.decode_all().await?;
        if unit.fault().is_some() {
            return Err(CodedError::new(
                ErrorCode::InvalidMessage,
                "Request must not carry a fault",
            ));
        }
        self.monitoring.request_size = self.request.raw().len() as u64 + unit.body().map_or(0, |body| body.len());

        if state.tls.is_enabled() {
            verify_peer(&state, &peer, &client, unit.ocsp_responses()).await?;
        }
        let handler = state.handlers.find(self.request.service(), self.request.kind());
        if handler.should_verify_signature() {
            unit.verify(&client, state.global.as_ref())?;
        }
        let path = path.map(checked_path).transpose()?;
        if handler.should_verify_access() {
            verify_access(&state, &self.request, method, path.as_ref().map(|p| p.decoded.as_str()))?;
        }

        state.log_message(&MessageRecord {
            role: ProxyRole::Producer,
            response: false,
            query_id: self.request.query_id().to_string(),
            x_request_id: self.x_request_id.clone(),
            client,
            service: self.request.service().clone(),
            message: String::from_utf8_lossy(self.request.raw()).into_owned(),
            signature: handler
                .should_log_signature()
                .then(|| unit.signature().and_then(|s| serde_json::to_string(s).ok()))
                .flatten(),
            created_at: Utc::now(),
        })?;

        let request_hash = unit.request_hash().unwrap_or_default();
        let mut service_request = ServiceRequest {
            message: self.request.clone(),
            body: unit.take_body(),
            service_path: path.map(|p| p.encoded),
            x_request_id: self.x_request_id.clone(),
        };
        tracing::debug!(
            handler = handler.name(),
            service = %self.request.service(),
            x_request_id = %self.x_request_id,
            "handling request"
        );
        self.monitoring.request_out_ts = Some(Utc::now());
        let response = handler.start_handling(&state, &mut service_request).await;
        self.monitoring.response_in_ts = Some(Utc::now());
        if let Some(mut body) = service_request.body.take() {
            body.release();
        }
        unit.consume();
        let response = response?;
        handler.finish_handling()?;

        Ok(Handled {
            response,
            request_hash,
            handler,
        })
    }

    /// Streams the signed response unit. Encoding continues in the
    /// background while the peer reads; the monitoring record is stored once
    /// the unit is complete.
    pub(crate) fn respond(&self, message: Message, body: Option<BodyStream>, succeeded: bool) -> Response {
        let state = self.state.clone();
        let signing = self.signing.clone();
        let (mut encoder, encoded) = ProxyMessageEncoder::new(self.algorithm, state.config.client.channel_capacity);
        let ocsp = if state.tls.is_enabled() {
            state.keys.auth_ocsp_responses()
        } else {
            Vec::new()
        };
        let mut monitoring = self.monitoring.clone();
        let x_request_id = self.x_request_id.clone();
        let is_rest = message.kind() != MessageKind::Envelope;

        tokio::spawn(async move {
            let written = async {
                encoder.message(&message).await?;
                if let Some(body) = body {
                    encoder.body(&body.content_type, body.stream).await?;
                }
                for response in &ocsp {
                    encoder.ocsp(response).await?;
                }
                Ok::<_, CodecError>(())
            }
            .await;
            monitoring.response_size = encoder.bytes_written();

            let outcome = match written {
                Ok(()) => match encoder.sign(signing.as_ref()).await {
                    Ok(signature) => state
                        .log_message(&MessageRecord {
                            role: ProxyRole::Producer,
                            response: true,
                            query_id: message.query_id().to_string(),
                            x_request_id,
                            client: message.client().clone(),
                            service: message.service().clone(),
                            message: String::from_utf8_lossy(message.raw()).into_owned(),
                            signature: serde_json::to_string(&signature).ok(),
                            created_at: Utc::now(),
                        }),
                    Err(e) => Err(e.into()),
                },
                // The receiving side already saw the stream fail or close.
                Err(e @ (CodecError::Body(_) | CodecError::Closed)) => Err(e.into()),
                Err(e) => {
                    let err = CodedError::from(e);
                    let fault = err.clone().with_prefix(PREFIX_SERVER_PROXY).to_fault(None);
                    if encoder.fault(&fault).await.is_ok() {
                        let _ = encoder.finish_unsigned().await;
                    }
                    Err(err)
                }
            };
            match outcome {
                Ok(()) => monitoring.succeeded = succeeded,
                Err(err) => {
                    tracing::warn!(code = err.code(), message = err.message(), "response unit failed");
                    monitoring.set_fault(&err.with_prefix(PREFIX_SERVER_PROXY));
                }
            }
            monitoring.response_out_ts = Some(Utc::now());
            state.store_monitoring(&monitoring);
        });

        transport_response(StatusCode::OK, encoded, self.algorithm, is_rest, &self.x_request_id)
    }
}

fn transport_response(
    status: StatusCode,
    encoded: EncodedBody,
    algorithm: DigestAlgorithm,
    is_rest: bool,
    x_request_id: &str,
) -> Response {
    let EncodedBody { content_type, stream } = encoded;
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    insert(headers, "content-type", &content_type);
    insert(headers, HEADER_HASH_ALGORITHM, algorithm.as_str());
    insert(headers, HEADER_VERSION, PROTOCOL_VERSION);
    insert(headers, HEADER_REQUEST_ID, x_request_id);
    if is_rest {
        insert(headers, HEADER_MESSAGE_TYPE, MESSAGE_TYPE_REST);
    }
    response
}

/// A signed transport unit carrying only `err`.
fn signed_fault(
    state: &AppState,
    algorithm: DigestAlgorithm,
    is_rest: bool,
    signing: Arc<dyn SigningCtx>,
    x_request_id: &str,
    err: &CodedError,
) -> Response {
    let (mut encoder, encoded) = ProxyMessageEncoder::new(algorithm, state.config.client.channel_capacity);
    let fault = err.to_fault(None);
    tokio::spawn(async move {
        if let Err(e) = encoder.fault(&fault).await {
            tracing::debug!(error = %e, "peer went away before the fault was sent");
            return;
        }
        if let Err(e) = encoder.sign(signing.as_ref()).await {
            tracing::warn!(error = %e, "failed to sign fault");
        }
    });
    transport_response(StatusCode::INTERNAL_SERVER_ERROR, encoded, algorithm, is_rest, x_request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_compare_numerically() {
        assert!(check_version(None, None).is_ok());
        assert!(check_version(Some("1.2"), Some("1.10.0")).is_ok());
        assert!(check_version(Some("1.2.0"), Some("1.2")).is_ok());

        for version in [Some("1.1.9"), Some("garbage"), None] {
            let err = check_version(Some("1.2"), version).unwrap_err();
            assert_eq!(err.kind(), Some(ErrorCode::ClientProxyVersionNotSupported));
        }
    }
}
