//! Digest algorithms and the request-hash construction.

use base64::Engine;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// Digest algorithms negotiated through the hash-algorithm header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    #[default]
    Sha512,
}

impl DigestAlgorithm {
    /// Returns the identifier used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Digests `data` in one go.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut digester = self.digester();
        digester.update(data);
        digester.finalize()
    }

    /// Starts an incremental digest.
    pub fn digester(self) -> Digester {
        match self {
            Self::Sha256 => Digester::Sha256(Sha256::new()),
            Self::Sha512 => Digester::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = UnknownDigestAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SHA-256" | "SHA256" => Ok(Self::Sha256),
            "SHA-512" | "SHA512" => Ok(Self::Sha512),
            _ => Err(UnknownDigestAlgorithm(s.to_string())),
        }
    }
}

/// Error returned for unsupported digest algorithm identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported digest algorithm: {0}")]
pub struct UnknownDigestAlgorithm(pub String);

/// Incremental digest state.
#[derive(Clone)]
pub enum Digester {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    /// Feeds more data.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(d) => d.update(data),
            Self::Sha512(d) => d.update(data),
        }
    }

    /// Consumes the state and returns the digest.
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(d) => d.finalize().to_vec(),
            Self::Sha512(d) => d.finalize().to_vec(),
        }
    }
}

/// Computes the request hash.
///
/// Without a body this is the digest of the message bytes. With a body it is
/// the digest of the message digest followed by the body digest, so that
/// both ends can compute it from the part digests alone.
pub fn request_hash(algorithm: DigestAlgorithm, message_digest: &[u8], body_digest: Option<&[u8]>) -> Vec<u8> {
    match body_digest {
        Some(body) => {
            let mut digester = algorithm.digester();
            digester.update(message_digest);
            digester.update(body);
            digester.finalize()
        }
        None => message_digest.to_vec(),
    }
}

/// Base64 (standard alphabet) encoding used for digests on the wire.
pub fn encode_b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decodes a base64 digest or signature value.
pub fn decode_b64(value: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_digest_matches_one_shot() {
        for alg in [DigestAlgorithm::Sha256, DigestAlgorithm::Sha512] {
            let mut digester = alg.digester();
            digester.update(b"hello ");
            digester.update(b"world");
            assert_eq!(digester.finalize(), alg.digest(b"hello world"));
        }
    }

    #[test]
    fn request_hash_without_body_is_message_digest() {
        let alg = DigestAlgorithm::Sha512;
        let message = alg.digest(b"{}");
        assert_eq!(request_hash(alg, &message, None), message);
    }

    #[test]
    fn request_hash_binds_body() {
        let alg = DigestAlgorithm::Sha256;
        let message = alg.digest(b"{}");
        let a = request_hash(alg, &message, Some(&alg.digest(b"body-a")));
        let b = request_hash(alg, &message, Some(&alg.digest(b"body-b")));
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!("SHA-512".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha512);
        assert_eq!("sha256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert!("MD5".parse::<DigestAlgorithm>().is_err());
        assert_eq!(DigestAlgorithm::default().to_string(), "SHA-512");
    }
}
