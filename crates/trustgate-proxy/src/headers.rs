//! HTTP header handling for REST exchanges.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use trustgate_codec::HeaderField;

/// Caller identity on REST requests.
pub const X_ROAD_CLIENT: &str = "x-road-client";
/// Query id on REST requests and responses.
pub const X_ROAD_ID: &str = "x-road-id";
/// Target security server on REST requests.
pub const X_ROAD_SECURITY_SERVER: &str = "x-road-security-server";
/// Service identifier passed to the local service.
pub const X_ROAD_SERVICE: &str = "x-road-service";
/// Correlation id passed to the local service and back to the caller.
pub const X_ROAD_REQUEST_ID: &str = "x-road-request-id";
/// Request hash handed back to REST callers.
pub const X_ROAD_REQUEST_HASH: &str = "x-road-request-hash";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Whether a header must not be carried across the proxy.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Copies end-to-end headers into message header fields. Values that are
/// not valid UTF-8 are dropped.
pub fn to_fields<'a>(headers: impl IntoIterator<Item = (&'a HeaderName, &'a HeaderValue)>) -> Vec<HeaderField> {
    headers
        .into_iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| HeaderField::new(name.as_str(), value))
        })
        .collect()
}

/// Rebuilds a header map from message header fields, skipping hop-by-hop
/// headers and anything that is not a legal header.
pub fn to_header_map(fields: &[HeaderField]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for field in fields.iter().filter(|f| !is_hop_by_hop(&f.name)) {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(field.name.as_bytes()),
            HeaderValue::from_str(&field.value),
        ) else {
            tracing::debug!(header = %field.name, "dropping unrepresentable header");
            continue;
        };
        map.append(name, value);
    }
    map
}

/// First value of `name` as a string.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Inserts `value` under `name` if it is a legal header value.
pub fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_stripped_both_ways() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.append("x-custom", HeaderValue::from_static("a"));
        headers.append("x-custom", HeaderValue::from_static("b"));

        let fields = to_fields(&headers);
        assert_eq!(fields.len(), 3);
        assert!(fields.contains(&HeaderField::new("accept", "application/json")));
        let custom: Vec<_> = fields.iter().filter(|f| f.name == "x-custom").map(|f| f.value.as_str()).collect();
        assert_eq!(custom, ["a", "b"]);

        let mut with_hop = fields.clone();
        with_hop.push(HeaderField::new("Keep-Alive", "timeout=5"));
        with_hop.push(HeaderField::new("bad header", "x"));
        let map = to_header_map(&with_hop);
        assert_eq!(map.len(), 3);
        assert!(map.get("keep-alive").is_none());
        assert_eq!(map.get_all("x-custom").iter().count(), 2);
    }
}
