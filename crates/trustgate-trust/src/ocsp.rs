//! Signing and checking OCSP evidence.

use crate::TrustError;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use trustgate_types::{signed_payload, CertStatus, OcspResponse};

/// Default maximum age of evidence, in seconds.
pub const DEFAULT_FRESHNESS_SECS: u64 = 3600;

/// Tolerated clock skew for `thisUpdate` in the future.
const CLOCK_SKEW_SECS: i64 = 60;

/// Hex SHA-256 of a DER certificate, the key evidence is indexed by.
pub fn cert_hash(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Produces a signed status statement. Used by responders and tests.
pub fn sign_ocsp(
    key: &SigningKey,
    responder: &str,
    cert_hash: &str,
    status: CertStatus,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
) -> OcspResponse {
    let payload = signed_payload(cert_hash, status, this_update, next_update, responder);
    let signature = key.sign(&payload);
    OcspResponse {
        cert_hash: cert_hash.to_string(),
        status,
        this_update,
        next_update,
        responder: responder.to_string(),
        signature: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
    }
}

/// Checks signature, status and freshness of one response.
///
/// # Errors
///
/// [`TrustError::InvalidEvidence`] for an unsigned, stale or future-dated
/// response, [`TrustError::BadStatus`] for anything but `good`.
pub fn verify_ocsp(
    response: &OcspResponse,
    responders: &[VerifyingKey],
    now: DateTime<Utc>,
    freshness: Duration,
) -> Result<(), TrustError> {
    let invalid = |reason: &str| TrustError::InvalidEvidence {
        cert_hash: response.cert_hash.clone(),
        reason: reason.to_string(),
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&response.signature)
        .map_err(|_| invalid("signature is not base64"))?;
    let signature = Signature::from_slice(&bytes).map_err(|_| invalid("malformed signature"))?;
    let payload = response.signed_payload();
    if !responders
        .iter()
        .any(|key| key.verify(&payload, &signature).is_ok())
    {
        return Err(invalid("not signed by a trusted responder"));
    }

    if response.this_update > now + Duration::seconds(CLOCK_SKEW_SECS) {
        return Err(invalid("thisUpdate is in the future"));
    }
    if now - response.this_update > freshness {
        return Err(invalid("response is stale"));
    }
    if response.next_update.is_some_and(|next| next < now) {
        return Err(invalid("nextUpdate has passed"));
    }

    if response.status != CertStatus::Good {
        return Err(TrustError::BadStatus {
            cert_hash: response.cert_hash.clone(),
            status: response.status,
        });
    }
    Ok(())
}

/// Whether a response is still young enough to be reused from the cache.
pub fn is_fresh(response: &OcspResponse, now: DateTime<Utc>, freshness: Duration) -> bool {
    now - response.this_update <= freshness && response.next_update.map_or(true, |next| next >= now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::generate(&mut rand::rngs::OsRng)
    }

    #[test]
    fn good_fresh_response_verifies() {
        let key = key();
        let now = Utc::now();
        let response = sign_ocsp(&key, "ocsp", "aa", CertStatus::Good, now, None);
        assert!(verify_ocsp(&response, &[key.verifying_key()], now, Duration::hours(1)).is_ok());
    }

    #[test]
    fn revoked_and_unknown_are_rejected() {
        let key = key();
        let now = Utc::now();
        for status in [CertStatus::Revoked, CertStatus::Unknown] {
            let response = sign_ocsp(&key, "ocsp", "aa", status, now, None);
            assert!(matches!(
                verify_ocsp(&response, &[key.verifying_key()], now, Duration::hours(1)),
                Err(TrustError::BadStatus { .. })
            ));
        }
    }

    #[test]
    fn stale_response_is_rejected() {
        let key = key();
        let now = Utc::now();
        let response = sign_ocsp(&key, "ocsp", "aa", CertStatus::Good, now - Duration::hours(2), None);
        assert!(verify_ocsp(&response, &[key.verifying_key()], now, Duration::hours(1)).is_err());
        assert!(!is_fresh(&response, now, Duration::hours(1)));
    }

    #[test]
    fn unknown_responder_is_rejected() {
        let now = Utc::now();
        let response = sign_ocsp(&key(), "ocsp", "aa", CertStatus::Good, now, None);
        assert!(matches!(
            verify_ocsp(&response, &[key().verifying_key()], now, Duration::hours(1)),
            Err(TrustError::InvalidEvidence { .. })
        ));
    }

    #[test]
    fn tampered_status_breaks_signature() {
        let key = key();
        let now = Utc::now();
        let mut response = sign_ocsp(&key, "ocsp", "aa", CertStatus::Revoked, now, None);
        response.status = CertStatus::Good;
        assert!(matches!(
            verify_ocsp(&response, &[key.verifying_key()], now, Duration::hours(1)),
            Err(TrustError::InvalidEvidence { .. })
        ));
    }

    #[test]
    fn cert_hash_is_hex_sha256() {
        assert_eq!(cert_hash(b"").len(), 64);
    }
}
