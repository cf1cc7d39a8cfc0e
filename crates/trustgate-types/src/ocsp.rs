//! OCSP evidence records.
//!
//! An [`OcspResponse`] is a time-bounded statement by a responder that a
//! certificate (identified by the hex SHA-256 of its DER encoding) had a
//! given revocation status. Signing and verification live in
//! `trustgate-trust`; this module only defines the record and the exact
//! byte string the responder signs.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Revocation status reported by a responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Good,
    Revoked,
    Unknown,
}

impl CertStatus {
    /// Returns the canonical label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Revoked => "revoked",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed revocation-status statement for one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcspResponse {
    /// Hex SHA-256 of the certificate's DER encoding.
    pub cert_hash: String,
    /// Reported status.
    pub status: CertStatus,
    /// When the status was known to be correct.
    pub this_update: DateTime<Utc>,
    /// When newer information will be available, if announced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_update: Option<DateTime<Utc>>,
    /// Name of the responder that produced the statement.
    pub responder: String,
    /// Base64 Ed25519 signature over [`OcspResponse::signed_payload`].
    pub signature: String,
}

impl OcspResponse {
    /// The exact bytes covered by the responder signature.
    pub fn signed_payload(&self) -> Vec<u8> {
        signed_payload(
            &self.cert_hash,
            self.status,
            self.this_update,
            self.next_update,
            &self.responder,
        )
    }
}

/// Builds the canonical signed byte string for the given fields.
pub fn signed_payload(
    cert_hash: &str,
    status: CertStatus,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    responder: &str,
) -> Vec<u8> {
    let next = next_update
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();
    format!(
        "{cert_hash}|{status}|{}|{next}|{responder}",
        this_update.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
    .into_bytes()
}
