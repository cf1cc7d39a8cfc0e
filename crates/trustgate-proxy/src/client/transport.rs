//! Peer addressing and transport for the consumer side: resolving the
//! provider's security servers, picking one by racing connects, sending the
//! encoded request and checking what comes back.

use crate::error::network_error;
use crate::AppState;
use axum::http::{header, HeaderMap, HeaderValue};
use futures_util::future::select_ok;
use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::net::TcpStream;
use trustgate_codec::{
    check_response_parameters, decode_fault_document, essence, CodecError, DigestAlgorithm, EncodedBody,
    MessageKind, ProxyMessage, ProxyMessageDecoder, CONTENT_TYPE_FAULT, HEADER_HASH_ALGORITHM,
    HEADER_MESSAGE_TYPE,
};
use trustgate_conf::GlobalConf;
use trustgate_trust::cert_hash;
use trustgate_types::{CodedError, ErrorCode, PartyId, SecurityServerId};
use url::Url;

/// One security server that can serve the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub server: SecurityServerId,
    pub url: Url,
}

/// Turns a federation address into a URL. Bare `host` or `host:port`
/// addresses get the scheme from the TLS setting and `default_port` when
/// they name no port; full URLs are taken as they are.
///
/// # Errors
///
/// Returns `MalformedServiceAddress` if the address does not parse.
pub fn server_url(address: &str, default_port: u16, tls: bool) -> Result<Url, CodedError> {
    let malformed = |reason: String| {
        CodedError::new(
            ErrorCode::MalformedServiceAddress,
            format!("Malformed address '{address}': {reason}"),
        )
    };
    if address.contains("://") {
        return Url::parse(address).map_err(|e| malformed(e.to_string()));
    }
    let scheme = if tls { "https" } else { "http" };
    let mut url = Url::parse(&format!("{scheme}://{address}")).map_err(|e| malformed(e.to_string()))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(malformed("no host".into()));
    }
    if url.port().is_none() {
        url.set_port(Some(default_port))
            .map_err(|()| malformed("cannot carry a port".into()))?;
    }
    Ok(url)
}

/// Lists the servers that may serve `provider`, optionally narrowed to
/// `target`, with servers in maintenance mode left out.
///
/// # Errors
///
/// `UnknownMember` when no server is registered for the provider,
/// `MaintenanceMode` when every candidate is in maintenance, and
/// `MalformedServiceAddress` for an address that does not parse.
pub fn resolve_targets(
    global: &dyn GlobalConf,
    provider: &PartyId,
    target: Option<&SecurityServerId>,
    default_port: u16,
    tls: bool,
) -> Result<Vec<Target>, CodedError> {
    let mut addresses = global.provider_addresses(provider);
    if let Some(target) = target {
        addresses.retain(|address| &address.server == target);
    }
    if addresses.is_empty() {
        return Err(CodedError::new(
            ErrorCode::UnknownMember,
            format!("Could not find addresses for service provider \"{provider}\""),
        ));
    }

    let mut notice = None;
    let mut available = Vec::new();
    for address in addresses {
        let maintenance = global.maintenance_mode(&address.server);
        if maintenance.enabled {
            tracing::debug!(server = %address.server, "skipping server in maintenance mode");
            notice = notice.or(maintenance.message);
        } else {
            available.push(address);
        }
    }
    if available.is_empty() {
        return Err(CodedError::new(
            ErrorCode::MaintenanceMode,
            notice.unwrap_or_else(|| {
                format!("Security servers of service provider \"{provider}\" are in maintenance mode")
            }),
        ));
    }

    available
        .into_iter()
        .map(|address| {
            Ok(Target {
                url: server_url(&address.address, default_port, tls)?,
                server: address.server,
            })
        })
        .collect()
}

/// Shuffles the candidates and races a TCP connect to each; the first to
/// connect wins. A single candidate is returned without probing.
///
/// # Errors
///
/// Returns `NetworkError` if no candidate accepts a connection.
pub async fn select_target(mut targets: Vec<Target>, connect_timeout: Duration) -> Result<Target, CodedError> {
    if targets.len() <= 1 {
        return targets.pop().ok_or_else(|| {
            CodedError::new(ErrorCode::NetworkError, "No target hosts to connect to")
        });
    }
    targets.shuffle(&mut rand::thread_rng());
    let attempts = targets.into_iter().map(|target| {
        Box::pin(async move {
            let authority = format!(
                "{}:{}",
                target.url.host_str().unwrap_or_default(),
                target.url.port_or_known_default().unwrap_or_default()
            );
            match tokio::time::timeout(connect_timeout, TcpStream::connect(authority)).await {
                Ok(Ok(_)) => Ok(target),
                Ok(Err(e)) => Err(format!("{}: {e}", target.url)),
                Err(_) => Err(format!("{}: connect timed out", target.url)),
            }
        })
    });
    match select_ok(attempts).await {
        Ok((target, _)) => {
            tracing::debug!(server = %target.server, url = %target.url, "selected target host");
            Ok(target)
        }
        Err(last) => Err(CodedError::new(
            ErrorCode::NetworkError,
            format!("Could not connect to any target host ({last})"),
        )),
    }
}

/// Posts an encoded transport unit to the selected server.
///
/// # Errors
///
/// Returns the client error unchanged so the caller can tell a transport
/// failure from a failure of the body producer.
pub async fn send(
    client: &reqwest::Client,
    target: &Target,
    mut headers: HeaderMap,
    body: EncodedBody,
) -> Result<reqwest::Response, reqwest::Error> {
    if let Ok(value) = HeaderValue::from_str(&body.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    client
        .post(target.url.clone())
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.stream))
        .send()
        .await
}

/// Decodes and authenticates the provider's answer.
///
/// A fault from the provider, whether a bare fault document or a fault part,
/// comes back as a relayed error.
///
/// # Errors
///
/// `InvalidProtocol` when the response parameters differ from the request,
/// `SslAuthFailed` when the provider's certificate is not trusted, codec
/// errors for malformed units and signature failures.
pub async fn receive(
    state: &AppState,
    response: reqwest::Response,
    target: &Target,
    algorithm: DigestAlgorithm,
    expected: MessageKind,
    provider: &PartyId,
) -> Result<ProxyMessage, CodedError> {
    let peer_certificate = response
        .extensions()
        .get::<reqwest::tls::TlsInfo>()
        .and_then(|info| info.peer_certificate())
        .map(<[u8]>::to_vec);
    let headers = response.headers().clone();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if essence(&content_type) == CONTENT_TYPE_FAULT {
        let fault = decode_fault_document(Box::pin(response.bytes_stream()))
            .await
            .map_err(CodedError::from)?;
        return Err(CodedError::from_fault(&fault));
    }

    check_response_parameters(
        algorithm,
        expected != MessageKind::Envelope,
        headers.get(HEADER_HASH_ALGORITHM).and_then(|v| v.to_str().ok()),
        headers.get(HEADER_MESSAGE_TYPE).and_then(|v| v.to_str().ok()),
    )?;

    let decoder = ProxyMessageDecoder::new(&content_type, response.bytes_stream(), algorithm, expected)?
        .with_spool_threshold(state.config.server.spool_threshold_bytes);
    let message = decoder.decode_all().await?;

    if state.tls.is_enabled() {
        verify_provider_certificate(state, peer_certificate, target, provider, &message).await?;
    }

    if message.is_signed() {
        message.verify(provider, state.global.as_ref())?;
    }
    if let Some(fault) = message.fault() {
        return Err(CodedError::from_fault(fault));
    }
    Ok(message)
}

async fn verify_provider_certificate(
    state: &AppState,
    certificate: Option<Vec<u8>>,
    target: &Target,
    provider: &PartyId,
    message: &ProxyMessage,
) -> Result<(), CodedError> {
    let leaf = certificate.ok_or_else(|| {
        CodedError::new(
            ErrorCode::SslAuthFailed,
            "Service provider did not present a TLS certificate",
        )
    })?;
    let hash = cert_hash(&leaf);
    match state.global.server_by_auth_cert(&hash) {
        Some(server) if server == target.server => {}
        Some(server) => {
            return Err(CodedError::new(
                ErrorCode::SslAuthFailed,
                format!(
                    "Authentication certificate belongs to {server}, expected {}",
                    target.server
                ),
            ))
        }
        None => {
            return Err(CodedError::new(
                ErrorCode::SslAuthFailed,
                format!("Unknown authentication certificate {hash}"),
            ))
        }
    }
    state
        .trust
        .verify(&provider.instance, &[leaf], message.ocsp_responses(), Some(&target.url))
        .await?;
    Ok(())
}

/// Maps a failed send, given how the encoder task ended. An encoder that
/// only saw the channel close is a consequence of the send failure, not its
/// cause.
pub(crate) fn send_failure(err: &reqwest::Error, writer: Option<CodecError>) -> CodedError {
    match writer {
        Some(CodecError::Closed) | None => network_error(err),
        Some(writer) => writer.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_conf::InMemoryGlobalConf;

    fn provider() -> PartyId {
        PartyId::subsystem("EE", "GOV", "1", "reg")
    }

    fn server(code: &str) -> SecurityServerId {
        SecurityServerId::new(PartyId::member("EE", "GOV", "1"), code)
    }

    fn global() -> InMemoryGlobalConf {
        let global = InMemoryGlobalConf::new("EE");
        global.add_server(server("ss1"), "10.0.0.1", [provider()]);
        global.add_server(server("ss2"), "10.0.0.2:6000", [provider()]);
        global
    }

    #[test]
    fn bare_addresses_get_scheme_and_default_port() {
        assert_eq!(server_url("10.0.0.1", 5500, true).unwrap().as_str(), "https://10.0.0.1:5500/");
        assert_eq!(server_url("host:6000", 5500, false).unwrap().as_str(), "http://host:6000/");
        assert_eq!(server_url("http://host:7000/x", 5500, true).unwrap().as_str(), "http://host:7000/x");
        let err = server_url("bad host", 5500, false).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::MalformedServiceAddress));
    }

    #[test]
    fn targets_skip_maintenance_and_honor_named_server() {
        let global = global();
        let all = resolve_targets(&global, &provider(), None, 5500, false).unwrap();
        assert_eq!(all.len(), 2);

        let named = resolve_targets(&global, &provider(), Some(&server("ss2")), 5500, false).unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].url.as_str(), "http://10.0.0.2:6000/");

        global.set_maintenance(&server("ss1"), true, None);
        let left = resolve_targets(&global, &provider(), None, 5500, false).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].server, server("ss2"));
    }

    #[test]
    fn all_in_maintenance_carries_the_notice() {
        let global = global();
        global.set_maintenance(&server("ss1"), true, None);
        global.set_maintenance(&server("ss2"), true, Some("back at noon".into()));
        let err = resolve_targets(&global, &provider(), None, 5500, false).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::MaintenanceMode));
        assert_eq!(err.message(), "back at noon");

        global.set_maintenance(&server("ss2"), true, None);
        let err = resolve_targets(&global, &provider(), None, 5500, false).unwrap_err();
        assert!(err.message().contains("maintenance mode"));
    }

    #[test]
    fn unknown_provider_is_unknown_member() {
        let err = resolve_targets(&global(), &PartyId::member("EE", "GOV", "9"), None, 5500, false)
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::UnknownMember));
    }

    #[tokio::test]
    async fn connect_race_picks_a_listening_host() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        let dead = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap()
        };
        let targets = vec![
            Target {
                server: server("dead"),
                url: Url::parse(&format!("http://{dead}")).unwrap(),
            },
            Target {
                server: server("live"),
                url: Url::parse(&format!("http://{live}")).unwrap(),
            },
        ];
        let chosen = select_target(targets, Duration::from_secs(2)).await.unwrap();
        assert_eq!(chosen.server, server("live"));
    }

    #[tokio::test]
    async fn connect_race_fails_when_nothing_listens() {
        let dead = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap()
        };
        let targets = (0..2)
            .map(|i| Target {
                server: server(&format!("ss{i}")),
                url: Url::parse(&format!("http://{dead}")).unwrap(),
            })
            .collect();
        let err = select_target(targets, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::NetworkError));
    }
}
