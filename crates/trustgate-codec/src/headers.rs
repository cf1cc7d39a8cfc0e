//! Transport header names, part content types and the protocol-parameter
//! check applied to every response.

use crate::digest::DigestAlgorithm;
use crate::CodecError;

/// Digest algorithm used for the exchange.
pub const HEADER_HASH_ALGORITHM: &str = "x-tg-hash-algorithm";
/// Per-exchange correlation id.
pub const HEADER_REQUEST_ID: &str = "x-tg-request-id";
/// Content type of the business payload, preserved end to end.
pub const HEADER_ORIGINAL_CONTENT_TYPE: &str = "x-tg-original-content-type";
/// Message-type discriminator; [`MESSAGE_TYPE_REST`] for the REST variant,
/// absent for envelopes.
pub const HEADER_MESSAGE_TYPE: &str = "x-tg-message-type";
/// Software version of the sending proxy.
pub const HEADER_VERSION: &str = "x-tg-version";

/// Value of [`HEADER_MESSAGE_TYPE`] for REST exchanges.
pub const MESSAGE_TYPE_REST: &str = "REST";

/// Version advertised in [`HEADER_VERSION`].
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const CONTENT_TYPE_ENVELOPE: &str = "application/x-tg-envelope+json";
pub const CONTENT_TYPE_REST_REQUEST: &str = "application/x-tg-rest-request+json";
pub const CONTENT_TYPE_REST_RESPONSE: &str = "application/x-tg-rest-response+json";
pub const CONTENT_TYPE_BODY: &str = "application/x-tg-body";
pub const CONTENT_TYPE_OCSP: &str = "application/ocsp-response";
pub const CONTENT_TYPE_FAULT: &str = "application/x-tg-fault+json";
pub const CONTENT_TYPE_SIGNATURE: &str = "application/x-tg-signature+json";

/// Checks that a response carries the same digest algorithm and message
/// type as the request it answers. A mismatch is a protocol violation.
///
/// # Errors
///
/// Returns [`CodecError::ProtocolMismatch`] on any difference.
pub fn check_response_parameters(
    request_algorithm: DigestAlgorithm,
    request_is_rest: bool,
    response_algorithm: Option<&str>,
    response_message_type: Option<&str>,
) -> Result<(), CodecError> {
    let algorithm = response_algorithm
        .ok_or_else(|| CodecError::ProtocolMismatch("response has no hash algorithm".into()))?
        .parse::<DigestAlgorithm>()
        .map_err(|e| CodecError::ProtocolMismatch(e.to_string()))?;
    if algorithm != request_algorithm {
        return Err(CodecError::ProtocolMismatch(format!(
            "response hash algorithm {algorithm} differs from request {request_algorithm}"
        )));
    }
    let response_is_rest = response_message_type
        .is_some_and(|value| value.eq_ignore_ascii_case(MESSAGE_TYPE_REST));
    if response_is_rest != request_is_rest {
        return Err(CodecError::ProtocolMismatch(
            "response message type differs from request".into(),
        ));
    }
    Ok(())
}

/// Returns the media type without parameters, lowercased.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_parameters_pass() {
        assert!(check_response_parameters(DigestAlgorithm::Sha512, false, Some("SHA-512"), None).is_ok());
        assert!(check_response_parameters(DigestAlgorithm::Sha256, true, Some("SHA-256"), Some("rest")).is_ok());
    }

    #[test]
    fn mismatches_are_protocol_errors() {
        for (alg, rest, header_alg, header_type) in [
            (DigestAlgorithm::Sha512, false, Some("SHA-256"), None),
            (DigestAlgorithm::Sha512, false, None, None),
            (DigestAlgorithm::Sha512, true, Some("SHA-512"), None),
            (DigestAlgorithm::Sha512, false, Some("SHA-512"), Some("REST")),
        ] {
            assert!(matches!(
                check_response_parameters(alg, rest, header_alg, header_type),
                Err(CodecError::ProtocolMismatch(_))
            ));
        }
    }

    #[test]
    fn essence_strips_parameters() {
        assert_eq!(essence("Multipart/Mixed; boundary=x"), "multipart/mixed");
    }
}
