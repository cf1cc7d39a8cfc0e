//! Signing contexts and the authentication key of this server.
//!
//! Message signatures use per-member Ed25519 keys. The TLS authentication
//! key is held as DER so that the TLS layer can build its own types; every
//! replacement bumps a generation counter which the listener shell compares
//! to decide when to rebuild its TLS context.

use crate::{read_lock, write_lock, ConfError};
use ed25519_dalek::{Signer, SigningKey};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use trustgate_types::{OcspResponse, PartyId};

/// Capability to sign on behalf of one party.
pub trait SigningCtx: Send + Sync {
    /// The party whose key produces the signatures.
    fn signer(&self) -> &PartyId;

    /// Signature algorithm identifier.
    fn algorithm(&self) -> &'static str {
        "Ed25519"
    }

    /// Signs `data`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfError::Key`] when the key cannot be used.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ConfError>;
}

/// [`SigningCtx`] backed by an in-process Ed25519 key.
pub struct Ed25519SigningCtx {
    signer: PartyId,
    key: SigningKey,
}

impl Ed25519SigningCtx {
    /// Creates a context signing as `signer`.
    pub fn new(signer: PartyId, key: SigningKey) -> Self {
        Self { signer, key }
    }
}

impl SigningCtx for Ed25519SigningCtx {
    fn signer(&self) -> &PartyId {
        &self.signer
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ConfError> {
        Ok(self.key.sign(data).to_bytes().to_vec())
    }
}

/// TLS authentication key material.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey {
    /// DER certificates, leaf first.
    pub cert_chain: Vec<Vec<u8>>,
    /// PKCS#8 DER private key.
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKey")
            .field("certificates", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Read access to the key subsystem.
pub trait KeyConf: Send + Sync {
    /// Signing context for the member owning `party`.
    fn signing_ctx(&self, party: &PartyId) -> Option<Arc<dyn SigningCtx>>;

    /// Current authentication key.
    fn auth_key(&self) -> Option<AuthKey>;

    /// OCSP evidence for the authentication certificate chain.
    fn auth_ocsp_responses(&self) -> Vec<OcspResponse>;

    /// Counter bumped on every authentication key change.
    fn auth_key_generation(&self) -> u64;
}

#[derive(Debug, Default)]
struct AuthState {
    generation: u64,
    key: Option<AuthKey>,
    ocsp: Vec<OcspResponse>,
}

/// In-memory [`KeyConf`].
#[derive(Default)]
pub struct InMemoryKeyConf {
    signing: RwLock<HashMap<PartyId, SigningKey>>,
    auth: RwLock<AuthState>,
}

impl InMemoryKeyConf {
    /// Creates an empty key store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the signing key of a member.
    pub fn add_signing_key(&self, member: &PartyId, key: SigningKey) {
        write_lock(&self.signing).insert(member.member_id(), key);
    }

    /// Replaces the authentication key and its OCSP evidence, bumping the
    /// generation. Key, evidence and generation change under one lock.
    pub fn set_auth_key(&self, key: AuthKey, ocsp: Vec<OcspResponse>) -> u64 {
        let mut auth = write_lock(&self.auth);
        auth.generation += 1;
        auth.key = Some(key);
        auth.ocsp = ocsp;
        auth.generation
    }

    /// Replaces the OCSP evidence without touching the key.
    pub fn set_auth_ocsp_responses(&self, ocsp: Vec<OcspResponse>) {
        write_lock(&self.auth).ocsp = ocsp;
    }
}

impl KeyConf for InMemoryKeyConf {
    fn signing_ctx(&self, party: &PartyId) -> Option<Arc<dyn SigningCtx>> {
        read_lock(&self.signing)
            .get(&party.member_id())
            .map(|key| Arc::new(Ed25519SigningCtx::new(party.clone(), key.clone())) as Arc<dyn SigningCtx>)
    }

    fn auth_key(&self) -> Option<AuthKey> {
        read_lock(&self.auth).key.clone()
    }

    fn auth_ocsp_responses(&self) -> Vec<OcspResponse> {
        read_lock(&self.auth).ocsp.clone()
    }

    fn auth_key_generation(&self) -> u64 {
        read_lock(&self.auth).generation
    }
}
