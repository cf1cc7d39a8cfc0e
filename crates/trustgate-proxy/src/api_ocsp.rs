//! OCSP relay: `GET /ocsp?cert=<hash>&...` on the peer-facing listener.
//!
//! Answers with the evidence this server holds for its own authentication
//! chain, restricted to the requested certificate hashes.

use crate::AppState;
use axum::extract::{Extension, RawQuery};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use trustgate_types::OcspResponse;

fn is_cert_hash(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Requested hashes, lowercased. `None` when the query is malformed.
fn requested_hashes(query: Option<&str>) -> Option<Vec<String>> {
    let hashes: Vec<String> = url::form_urlencoded::parse(query?.as_bytes())
        .filter(|(key, _)| key == "cert")
        .map(|(_, value)| value.to_ascii_lowercase())
        .collect();
    (!hashes.is_empty() && hashes.iter().all(|h| is_cert_hash(h))).then_some(hashes)
}

pub async fn ocsp_relay_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Response {
    let Some(hashes) = requested_hashes(query.as_deref()) else {
        return (
            StatusCode::BAD_REQUEST,
            "expected one or more cert=<sha256 hex> parameters",
        )
            .into_response();
    };

    let evidence: Vec<OcspResponse> = state
        .keys
        .auth_ocsp_responses()
        .into_iter()
        .filter(|response| hashes.iter().any(|h| response.cert_hash.eq_ignore_ascii_case(h)))
        .collect();
    tracing::debug!(requested = hashes.len(), returned = evidence.len(), "served OCSP relay request");
    Json(evidence).into_response()
}
