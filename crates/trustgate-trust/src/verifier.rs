//! Peer certificate verification.
//!
//! A presented chain is trusted when it ends at a CA the federation
//! configuration publishes for the instance, every signature in it verifies,
//! every certificate is inside its validity period and every presented
//! certificate has fresh `good` OCSP evidence from a trusted responder.

use crate::cache::OcspCache;
use crate::ocsp::{cert_hash, verify_ocsp, DEFAULT_FRESHNESS_SECS};
use crate::relay::OcspFetcher;
use crate::TrustError;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use trustgate_conf::GlobalConf;
use trustgate_types::OcspResponse;
use url::Url;
use x509_parser::prelude::{parse_x509_certificate, X509Certificate};

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, TrustError> {
    parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| TrustError::InvalidCertificate(e.to_string()))
}

/// Checks that `chain` (leaf first) is signed through to one of `anchors`
/// and that every certificate involved is currently valid.
///
/// # Errors
///
/// Returns the first [`TrustError`] found.
pub fn verify_chain(instance: &str, chain: &[Vec<u8>], anchors: &[Vec<u8>]) -> Result<(), TrustError> {
    let leaf_der = chain.first().ok_or(TrustError::NoPeerCertificate)?;
    let certs = chain
        .iter()
        .map(|der| parse(der))
        .collect::<Result<Vec<_>, _>>()?;

    for (der, cert) in chain.iter().zip(&certs) {
        if !cert.validity().is_valid() {
            return Err(TrustError::NotValidNow(cert_hash(der)));
        }
    }

    for pair in certs.windows(2) {
        let (child, issuer) = (&pair[0], &pair[1]);
        if child.issuer().as_raw() != issuer.subject().as_raw() {
            return Err(TrustError::ChainSignature(format!(
                "{} is not issued by {}",
                child.subject(),
                issuer.subject()
            )));
        }
        child
            .verify_signature(Some(issuer.public_key()))
            .map_err(|e| TrustError::ChainSignature(e.to_string()))?;
    }

    let last = certs.last().ok_or(TrustError::NoPeerCertificate)?;
    let anchors = anchors
        .iter()
        .filter_map(|der| parse(der).ok())
        .filter(|ca| ca.subject().as_raw() == last.issuer().as_raw())
        .collect::<Vec<_>>();
    if anchors.is_empty() {
        return Err(TrustError::NoTrustAnchor(format!(
            "{instance} (issuer {})",
            last.issuer()
        )));
    }
    let anchor = anchors
        .iter()
        .find(|ca| last.verify_signature(Some(ca.public_key())).is_ok())
        .ok_or_else(|| {
            TrustError::ChainSignature(format!("{} does not verify under a trusted CA", cert_hash(leaf_der)))
        })?;
    if !anchor.validity().is_valid() {
        return Err(TrustError::NotValidNow(format!("CA {}", anchor.subject())));
    }
    Ok(())
}

/// Verifies peer certificate chains against the federation configuration,
/// sourcing OCSP evidence from the message, the cache or the peer's relay.
pub struct TrustVerifier {
    global: Arc<dyn GlobalConf>,
    fetcher: Arc<dyn OcspFetcher>,
    cache: Arc<OcspCache>,
    freshness: Duration,
}

impl TrustVerifier {
    pub fn new(global: Arc<dyn GlobalConf>, fetcher: Arc<dyn OcspFetcher>) -> Self {
        Self {
            global,
            fetcher,
            cache: Arc::new(OcspCache::new()),
            freshness: Duration::seconds(DEFAULT_FRESHNESS_SECS as i64),
        }
    }

    /// Sets the maximum evidence age.
    pub fn with_freshness(mut self, freshness: std::time::Duration) -> Self {
        self.freshness = Duration::from_std(freshness).unwrap_or(self.freshness);
        self
    }

    /// Shares an existing evidence cache.
    pub fn with_cache(mut self, cache: Arc<OcspCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<OcspCache> {
        &self.cache
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Verifies `chain` (leaf first, DER) for `instance`.
    ///
    /// `embedded` is evidence that arrived with the message; `peer` is the
    /// address whose relay is asked for whatever is still missing.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError`] when the chain or its evidence is not
    /// acceptable; callers map it to `SslAuthFailed`.
    pub async fn verify(
        &self,
        instance: &str,
        chain: &[Vec<u8>],
        embedded: &[OcspResponse],
        peer: Option<&Url>,
    ) -> Result<(), TrustError> {
        verify_chain(instance, chain, &self.global.ca_certs(instance))?;

        let responders = self.global.ocsp_responder_keys(instance);
        let now = Utc::now();
        let embedded: HashMap<&str, &OcspResponse> = embedded
            .iter()
            .map(|response| (response.cert_hash.as_str(), response))
            .collect();

        let mut missing = Vec::new();
        for der in chain {
            let hash = cert_hash(der);
            if let Some(response) = embedded.get(hash.as_str()) {
                verify_ocsp(response, &responders, now, self.freshness)?;
                self.cache.insert((*response).clone());
            } else if let Some(response) = self.cache.get_fresh(&hash, now, self.freshness) {
                verify_ocsp(&response, &responders, now, self.freshness)?;
            } else {
                missing.push(hash);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let peer = peer.ok_or_else(|| TrustError::EvidenceUnavailable(missing.join(", ")))?;
        let fetched = self.fetcher.fetch(peer, &missing).await?;
        if fetched.len() != missing.len() {
            return Err(TrustError::EvidenceCountMismatch {
                requested: missing.len(),
                received: fetched.len(),
            });
        }
        for hash in &missing {
            let response = fetched
                .iter()
                .find(|response| &response.cert_hash == hash)
                .ok_or_else(|| TrustError::EvidenceUnavailable(hash.clone()))?;
            verify_ocsp(response, &responders, now, self.freshness)?;
            self.cache.insert(response.clone());
        }
        tracing::debug!(count = missing.len(), %peer, "cached OCSP evidence from peer relay");
        Ok(())
    }
}
