//! Detached signatures over the digests of a transport unit's parts.
//!
//! The signer digests each signed part (message, body, fault) in the order
//! they were written and signs the canonical list `name:digest\n...`. OCSP
//! parts are not signed; they are verified on their own.

use crate::digest::{decode_b64, encode_b64, DigestAlgorithm};
use crate::CodecError;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use trustgate_conf::SigningCtx;

/// Name of the message part in the signed list.
pub const PART_MESSAGE: &str = "message";
/// Name of the body part in the signed list.
pub const PART_BODY: &str = "body";
/// Name of a fault part in the signed list.
pub const PART_FAULT: &str = "fault";

/// Digest of one signed part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDigest {
    pub name: String,
    /// Base64 digest.
    pub digest: String,
}

impl PartDigest {
    pub fn new(name: &str, digest: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            digest: encode_b64(digest),
        }
    }
}

/// Content of the signature part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureData {
    /// Signature algorithm, e.g. `Ed25519`.
    pub algorithm: String,
    /// Digest algorithm used for the part digests.
    pub digest_algorithm: String,
    /// Signed part digests in wire order.
    pub parts: Vec<PartDigest>,
    /// Base64 signature value.
    pub value: String,
}

/// Canonical byte string covered by the signature.
pub fn signing_input(parts: &[PartDigest]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(part.name.as_bytes());
        out.push(b':');
        out.extend_from_slice(part.digest.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Signs the given part digests.
///
/// # Errors
///
/// Returns [`CodecError::Signing`] if the signing context fails.
pub fn create_signature(
    ctx: &dyn SigningCtx,
    algorithm: DigestAlgorithm,
    parts: Vec<PartDigest>,
) -> Result<SignatureData, CodecError> {
    let value = ctx.sign(&signing_input(&parts))?;
    Ok(SignatureData {
        algorithm: ctx.algorithm().to_string(),
        digest_algorithm: algorithm.as_str().to_string(),
        parts,
        value: encode_b64(&value),
    })
}

/// Verifies a signature against the digests actually computed while
/// decoding.
///
/// # Errors
///
/// Returns [`CodecError::InvalidSignature`] if the algorithm, the part list
/// or the signature value does not match.
pub fn verify_signature(
    key: &VerifyingKey,
    algorithm: DigestAlgorithm,
    signature: &SignatureData,
    computed: &[PartDigest],
) -> Result<(), CodecError> {
    if signature.algorithm != "Ed25519" {
        return Err(CodecError::InvalidSignature(format!(
            "unsupported signature algorithm {}",
            signature.algorithm
        )));
    }
    if signature.digest_algorithm != algorithm.as_str() {
        return Err(CodecError::InvalidSignature(format!(
            "signature uses {} but the exchange uses {algorithm}",
            signature.digest_algorithm
        )));
    }
    if signature.parts != computed {
        return Err(CodecError::InvalidSignature(
            "signed part digests do not match the received parts".to_string(),
        ));
    }
    let bytes = decode_b64(&signature.value)
        .ok_or_else(|| CodecError::InvalidSignature("signature is not base64".to_string()))?;
    let value = Signature::from_slice(&bytes)
        .map_err(|e| CodecError::InvalidSignature(e.to_string()))?;
    key.verify(&signing_input(computed), &value)
        .map_err(|_| CodecError::InvalidSignature("signature value does not verify".to_string()))
}
