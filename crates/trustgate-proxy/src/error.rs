//! Fault responses and the conversions into [`CodedError`] that the
//! processors need beyond the ones the lower crates provide.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use crate::config::ConfigError;
use trustgate_codec::{CONTENT_TYPE_FAULT, HEADER_HASH_ALGORITHM};
use trustgate_conf::ConfError;
use trustgate_observe::ObserveError;
use trustgate_types::{CodedError, ErrorCode, FaultDocument};

/// Errors that stop the proxy from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Settings that load but contradict each other.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("configuration snapshot error: {0}")]
    Conf(#[from] ConfError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("message log error: {0}")]
    Observe(#[from] ObserveError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while building or rotating TLS identities.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// The key subsystem holds no authentication key yet.
    #[error("no authentication key configured")]
    NoAuthKey,

    /// rustls rejected the key material or the configuration.
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    /// The HTTP client could not be built around the TLS configuration.
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl From<TlsError> for CodedError {
    fn from(err: TlsError) -> Self {
        CodedError::new(ErrorCode::InternalError, err.to_string())
    }
}

/// Maps a configuration collaborator failure to its fault code.
pub fn conf_error(err: ConfError) -> CodedError {
    match err {
        ConfError::Outdated { .. } => CodedError::new(ErrorCode::OutdatedGlobalConf, err.to_string()),
        other => CodedError::new(ErrorCode::InternalError, other.to_string()),
    }
}

/// Maps a transport failure towards a peer or a service.
pub fn network_error(err: &reqwest::Error) -> CodedError {
    let code = if err.is_builder() {
        ErrorCode::MalformedServiceAddress
    } else {
        ErrorCode::NetworkError
    };
    CodedError::new(code, err.to_string())
}

/// Fault answer to an envelope caller: `{"fault": {...}}` with status 500.
pub fn envelope_fault(err: &CodedError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(FaultDocument {
            fault: err.to_fault(None),
        }),
    )
        .into_response()
}

/// Fault answer to a REST caller: `{"type", "message", "detail"}` with
/// status 500.
pub fn rest_fault(err: &CodedError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "type": err.code(),
            "message": err.message(),
            "detail": err.detail(),
        })),
    )
        .into_response()
}

/// Unsigned fault document returned to a peer when the failure happens
/// before a signing context exists.
pub fn peer_fault(err: &CodedError, hash_algorithm: Option<&str>) -> Response {
    let body = match serde_json::to_vec(&FaultDocument {
        fault: err.to_fault(None),
    }) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize fault document");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_FAULT));
    if let Some(value) = hash_algorithm.and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(HEADER_HASH_ALGORITHM, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_types::PREFIX_CLIENT_PROXY;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn envelope_fault_has_fault_document_shape() {
        let err = CodedError::new(ErrorCode::UnknownMember, "who?").with_prefix(PREFIX_CLIENT_PROXY);
        let response = envelope_fault(&err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["fault"]["faultCode"], "Server.ClientProxy.UnknownMember");
        assert_eq!(json["fault"]["faultString"], "who?");
    }

    #[tokio::test]
    async fn rest_fault_has_type_message_detail() {
        let err = CodedError::new(ErrorCode::AccessDenied, "no").with_detail("id-1");
        let json = body_json(rest_fault(&err)).await;
        assert_eq!(json["type"], "AccessDenied");
        assert_eq!(json["message"], "no");
        assert_eq!(json["detail"], "id-1");
    }

    #[test]
    fn outdated_configuration_keeps_its_code() {
        let err = conf_error(ConfError::Outdated {
            valid_until: chrono::Utc::now(),
        });
        assert_eq!(err.kind(), Some(ErrorCode::OutdatedGlobalConf));
        let err = conf_error(ConfError::Key("bad".into()));
        assert_eq!(err.kind(), Some(ErrorCode::InternalError));
    }

    #[test]
    fn peer_fault_is_a_fault_document() {
        let err = CodedError::new(ErrorCode::InvalidHttpMethod, "POST only");
        let response = peer_fault(&err, Some("SHA-512"));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_FAULT
        );
        assert_eq!(response.headers().get(HEADER_HASH_ALGORITHM).unwrap(), "SHA-512");
    }
}
