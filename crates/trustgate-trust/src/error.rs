use trustgate_types::{CertStatus, CodedError, ErrorCode};

/// Reasons a peer's certificate chain is not trusted.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("peer did not present a certificate")]
    NoPeerCertificate,

    #[error("malformed certificate: {0}")]
    InvalidCertificate(String),

    #[error("no trusted CA for {0}")]
    NoTrustAnchor(String),

    #[error("certificate chain signature does not verify: {0}")]
    ChainSignature(String),

    #[error("certificate {0} is outside its validity period")]
    NotValidNow(String),

    #[error("no OCSP evidence available for {0}")]
    EvidenceUnavailable(String),

    #[error("OCSP relay returned {received} responses for {requested} certificates")]
    EvidenceCountMismatch { requested: usize, received: usize },

    #[error("certificate {cert_hash} has OCSP status {status}")]
    BadStatus { cert_hash: String, status: CertStatus },

    #[error("invalid OCSP response for {cert_hash}: {reason}")]
    InvalidEvidence { cert_hash: String, reason: String },

    #[error("OCSP relay request failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("OCSP relay answered {0}")]
    RelayStatus(u16),
}

impl From<TrustError> for CodedError {
    fn from(err: TrustError) -> Self {
        CodedError::new(ErrorCode::SslAuthFailed, err.to_string())
    }
}
