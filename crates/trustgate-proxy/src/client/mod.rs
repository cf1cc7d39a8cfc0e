//! Consumer side: requests from local information systems, sent on to the
//! security server of the service provider.

pub mod envelope;
pub mod rest;
pub mod transport;

use crate::error::{conf_error, envelope_fault, rest_fault};
use crate::headers::insert;
use crate::listener::PeerInfo;
use crate::processor::MessageProcessor;
use crate::streams::BodyStream;
use crate::tls::AddressSet;
use crate::AppState;
use axum::extract::{ConnectInfo, Extension, Request};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use transport::{receive, resolve_targets, select_target, send, send_failure};
use trustgate_codec::{
    encode_request_hash, CodecError, Message, MessageKind, ProxyMessage, ProxyMessageEncoder,
    RequestHashValue, SignatureData, HEADER_HASH_ALGORITHM, HEADER_MESSAGE_TYPE,
    HEADER_REQUEST_ID, HEADER_VERSION, MESSAGE_TYPE_REST, PROTOCOL_VERSION,
};
use trustgate_conf::IsAuthentication;
use trustgate_observe::{MessageRecord, OpMonitoringData, ProxyRole};
use trustgate_types::{CodedError, ErrorCode, PartyId, PREFIX_CLIENT_PROXY, PREFIX_SERVICE_FAILED};

/// Path prefix of REST requests on the consumer listener.
pub const REST_PATH_PREFIX: &str = "/r1/";

/// How long the encoder task may take to report after a failed send.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Entry point of the consumer listener.
pub async fn consumer_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<PeerInfo>,
    request: Request,
) -> Response {
    let is_rest = request.uri().path().starts_with(REST_PATH_PREFIX);
    if !is_rest && request.method() != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Must use POST request method instead of {}", request.method()),
        )
            .into_response();
    }

    let mut processor: Box<dyn MessageProcessor> = if is_rest {
        Box::new(rest::RestConsumer::new(state.clone(), peer, request))
    } else {
        Box::new(envelope::EnvelopeConsumer::new(state.clone(), peer, request))
    };

    match processor.process().await {
        Ok(response) => response,
        Err(err) => {
            let err = err.with_prefix(PREFIX_CLIENT_PROXY);
            tracing::warn!(code = err.code(), message = err.message(), "consumer request failed");
            let monitoring = processor.monitoring();
            monitoring.set_fault(&err);
            monitoring.response_out_ts = Some(Utc::now());
            state.store_monitoring(monitoring);
            if is_rest {
                rest_fault(&err)
            } else {
                envelope_fault(&err)
            }
        }
    }
}

/// Checks that the caller is an active local client and authenticated the
/// way its registration demands.
pub(crate) fn authorize_caller(
    state: &AppState,
    client: &PartyId,
    peer: &PeerInfo,
) -> Result<(), CodedError> {
    match state.server.member_status(client) {
        Some(status) if status.is_active() => {}
        _ => {
            return Err(CodedError::new(
                ErrorCode::UnknownMember,
                format!("Client '{client}' not found"),
            ))
        }
    }
    let identity = state.tls.current();
    verify_client_authentication(
        state.server.is_authentication(client),
        &state.server.is_certs(client),
        identity.leaf(),
        client,
        peer,
    )
}

fn verify_client_authentication(
    mode: IsAuthentication,
    registered: &[Vec<u8>],
    own_certificate: Option<&[u8]>,
    client: &PartyId,
    peer: &PeerInfo,
) -> Result<(), CodedError> {
    let failed = |message: String| CodedError::new(ErrorCode::SslAuthFailed, message);
    match mode {
        IsAuthentication::NoSsl => Ok(()),
        IsAuthentication::SslNoAuth if peer.tls => Ok(()),
        IsAuthentication::SslNoAuth => Err(failed(format!("Client ({client}) must use HTTPS"))),
        IsAuthentication::SslAuth => {
            if !peer.tls {
                return Err(failed(format!("Client ({client}) must use HTTPS")));
            }
            let Some(leaf) = peer.leaf() else {
                return Err(failed(format!("Client ({client}) has not presented a TLS certificate")));
            };
            // Internal callers may use this server's own certificate.
            if own_certificate == Some(leaf) || registered.iter().any(|cert| cert.as_slice() == leaf) {
                Ok(())
            } else {
                Err(failed(format!(
                    "Client ({client}) TLS certificate does not match any registered IS certificate"
                )))
            }
        }
    }
}

/// Request half of an exchange as built by a consumer processor.
pub(crate) struct Outbound {
    pub message: Message,
    pub body: Option<BodyStream>,
    pub x_request_id: String,
}

/// Verified response half of an exchange.
pub(crate) struct Inbound {
    pub unit: ProxyMessage,
    pub message: Message,
    pub request_hash: RequestHashValue,
    /// Correlation id from the response transport headers.
    pub x_request_id: Option<String>,
}

struct Signed {
    request_hash: Vec<u8>,
    signature: SignatureData,
    size: u64,
}

/// Signs and sends `outbound` to one of the provider's servers and returns
/// the verified response.
///
/// The message and body are encoded by a separate task while the HTTP
/// client drains the encoder's channel; a failure on either side ends the
/// other.
pub(crate) async fn exchange(
    state: &AppState,
    outbound: Outbound,
    monitoring: &mut OpMonitoringData,
) -> Result<Inbound, CodedError> {
    let Outbound {
        message,
        body,
        x_request_id,
    } = outbound;
    let client = message.client().clone();
    let service = message.service().clone();

    state.global.verify_validity().map_err(conf_error)?;
    let signing = state.keys.signing_ctx(&client).ok_or_else(|| {
        CodedError::new(
            ErrorCode::UnknownMember,
            format!("No signing key available for client '{client}'"),
        )
    })?;

    let tls = state.tls.is_enabled();
    let targets = resolve_targets(
        state.global.as_ref(),
        &service.provider,
        message.target_security_server(),
        state.config.client.server_port,
        tls,
    )?;
    let addresses = AddressSet::new(targets.iter().map(|target| &target.url));
    let target = select_target(targets, state.config.client.connect_timeout()).await?;
    monitoring.service_security_server_address = target.url.host_str().map(str::to_string);

    let algorithm = state.config.client.digest_algorithm();
    let is_rest = message.kind() != MessageKind::Envelope;
    let (mut encoder, encoded) = ProxyMessageEncoder::new(algorithm, state.config.client.channel_capacity);
    let ocsp = if tls { state.keys.auth_ocsp_responses() } else { Vec::new() };
    let request_message = message.clone();
    let mut writer = tokio::spawn(async move {
        encoder.message(&request_message).await?;
        if let Some(body) = body {
            encoder.body(&body.content_type, body.stream).await?;
        }
        let request_hash = encoder.request_hash().unwrap_or_default();
        for response in &ocsp {
            encoder.ocsp(response).await?;
        }
        let size = encoder.bytes_written();
        let signature = encoder.sign(signing.as_ref()).await?;
        Ok::<_, CodecError>(Signed {
            request_hash,
            signature,
            size,
        })
    });

    let mut headers = HeaderMap::new();
    insert(&mut headers, HEADER_HASH_ALGORITHM, algorithm.as_str());
    insert(&mut headers, HEADER_VERSION, PROTOCOL_VERSION);
    insert(&mut headers, HEADER_REQUEST_ID, &x_request_id);
    if is_rest {
        insert(&mut headers, HEADER_MESSAGE_TYPE, MESSAGE_TYPE_REST);
    }

    let peer_client = state.tls.current().peer_client(&addresses)?;
    monitoring.request_out_ts = Some(Utc::now());
    let response = match send(&peer_client, &target, headers, encoded).await {
        Ok(response) => response,
        Err(e) => {
            let writer_error = match tokio::time::timeout(WRITER_GRACE, &mut writer).await {
                Ok(Ok(Err(err))) => Some(err),
                Ok(_) => None,
                Err(_) => {
                    writer.abort();
                    None
                }
            };
            return Err(send_failure(&e, writer_error));
        }
    };
    monitoring.response_in_ts = Some(Utc::now());

    // The provider may answer before it has read the whole request, in which
    // case the encoder only sees its channel close.
    let signed = match writer.await {
        Ok(Ok(signed)) => Some(signed),
        Ok(Err(CodecError::Closed)) => None,
        Ok(Err(e)) => return Err(e.into()),
        Err(e) => {
            return Err(CodedError::new(
                ErrorCode::InternalError,
                format!("request encoder failed: {e}"),
            ))
        }
    };

    let x_request_id_header = response
        .headers()
        .get(HEADER_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let expected = if is_rest {
        MessageKind::RestResponse
    } else {
        MessageKind::Envelope
    };
    let unit = receive(state, response, &target, algorithm, expected, &service.provider).await?;
    let Some(signed) = signed else {
        return Err(CodedError::new(
            ErrorCode::IoError,
            "Provider answered before the request was sent completely",
        ));
    };
    monitoring.request_size = signed.size;

    let response_message = unit
        .message()
        .cloned()
        .ok_or(CodecError::MissingMessage(expected))?;
    state.log_message(&MessageRecord {
        role: ProxyRole::Client,
        response: false,
        query_id: message.query_id().to_string(),
        x_request_id: x_request_id.clone(),
        client: client.clone(),
        service: service.clone(),
        message: String::from_utf8_lossy(message.raw()).into_owned(),
        signature: serde_json::to_string(&signed.signature).ok(),
        created_at: Utc::now(),
    })?;
    state.log_message(&MessageRecord {
        role: ProxyRole::Client,
        response: true,
        query_id: response_message.query_id().to_string(),
        x_request_id: x_request_id.clone(),
        client,
        service,
        message: String::from_utf8_lossy(response_message.raw()).into_owned(),
        signature: unit
            .signature()
            .and_then(|signature| serde_json::to_string(signature).ok()),
        created_at: Utc::now(),
    })?;

    tracing::debug!(
        server = %target.server,
        query_id = message.query_id(),
        x_request_id = %x_request_id,
        "exchange completed"
    );
    Ok(Inbound {
        unit,
        message: response_message,
        request_hash: encode_request_hash(algorithm, &signed.request_hash),
        x_request_id: x_request_id_header,
    })
}

/// Checks that a response answers exactly the request that was sent.
pub(crate) fn check_consistency(
    request: &Message,
    response: &Message,
    request_hash: &RequestHashValue,
    x_request_id: &str,
    response_x_request_id: Option<&str>,
) -> Result<(), CodedError> {
    let mismatch = if response.client() != request.client() {
        Some("client identifier")
    } else if response.query_id() != request.query_id() {
        Some("query id")
    } else if response.service() != request.service() {
        Some("service identifier")
    } else if response.request_hash() != Some(request_hash) {
        Some("request hash")
    } else if response_x_request_id != Some(x_request_id) {
        Some("correlation id")
    } else {
        None
    };
    match mismatch {
        Some(what) => Err(CodedError::new(
            ErrorCode::InconsistentResponse,
            format!("Response {what} does not match the request"),
        )
        .with_prefix(PREFIX_SERVICE_FAILED)),
        None => Ok(()),
    }
}
