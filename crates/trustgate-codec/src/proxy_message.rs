//! A decoded transport unit.

use crate::body::SpooledBody;
use crate::digest::{request_hash, DigestAlgorithm};
use crate::message::Message;
use crate::signature::{verify_signature, PartDigest, SignatureData};
use crate::CodecError;
use trustgate_conf::GlobalConf;
use trustgate_types::{Fault, OcspResponse, PartyId};

/// Message, body, OCSP evidence and signature of one received exchange
/// half, plus the digests computed while it was read.
#[derive(Debug)]
pub struct ProxyMessage {
    pub(crate) algorithm: DigestAlgorithm,
    pub(crate) message: Option<Message>,
    pub(crate) fault: Option<Fault>,
    pub(crate) body: Option<SpooledBody>,
    pub(crate) ocsp: Vec<OcspResponse>,
    pub(crate) signature: Option<SignatureData>,
    pub(crate) parts: Vec<PartDigest>,
    pub(crate) message_digest: Option<Vec<u8>>,
    pub(crate) body_digest: Option<Vec<u8>>,
}

impl ProxyMessage {
    pub(crate) fn empty(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            message: None,
            fault: None,
            body: None,
            ocsp: Vec::new(),
            signature: None,
            parts: Vec::new(),
            message_digest: None,
            body_digest: None,
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Fault carried instead of (or after) the message.
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn body(&self) -> Option<&SpooledBody> {
        self.body.as_ref()
    }

    /// Moves the body out; the caller becomes responsible for releasing it.
    pub fn take_body(&mut self) -> Option<SpooledBody> {
        self.body.take()
    }

    pub fn ocsp_responses(&self) -> &[OcspResponse] {
        &self.ocsp
    }

    pub fn signature(&self) -> Option<&SignatureData> {
        self.signature.as_ref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Request hash over the received message and body digests.
    pub fn request_hash(&self) -> Option<Vec<u8>> {
        let message = self.message_digest.as_deref()?;
        Some(request_hash(self.algorithm, message, self.body_digest.as_deref()))
    }

    /// Verifies the detached signature against the sender's trusted key.
    ///
    /// # Errors
    ///
    /// [`CodecError::MissingSignature`] for an unsigned unit,
    /// [`CodecError::SigningKeyNotFound`] if the federation publishes no key
    /// for `sender`, [`CodecError::InvalidSignature`] otherwise.
    pub fn verify(&self, sender: &PartyId, global: &dyn GlobalConf) -> Result<(), CodecError> {
        let signature = self.signature.as_ref().ok_or(CodecError::MissingSignature)?;
        let key = global
            .signing_key(sender)
            .ok_or_else(|| CodecError::SigningKeyNotFound(sender.to_string()))?;
        verify_signature(&key, self.algorithm, signature, &self.parts)
    }

    /// Releases the spooled body. Safe to call more than once.
    pub fn consume(&mut self) {
        if let Some(body) = self.body.as_mut() {
            body.release();
        }
        self.body = None;
    }
}
