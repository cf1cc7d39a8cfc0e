//! TLS identity of this server and its rotation.
//!
//! Peer authentication is decided by the trust verifier against the
//! federation configuration, not by rustls: at the TLS layer every
//! certificate is accepted as long as the handshake signatures verify, and
//! the presented chain is handed up to the processors.
//!
//! The identity (server config, client config, peer connection pools and
//! the generation it was built from) is one immutable value behind an
//! `RwLock<Arc<_>>`. Readers clone the `Arc` per connection or request; a
//! rotation builds a complete new value and swaps it under the write lock,
//! so nobody ever sees parts of two generations.

use crate::error::TlsError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use trustgate_conf::{AuthKey, KeyConf};
use url::Url;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Accepts any client certificate whose handshake signature verifies.
/// Client certificates are offered, never required.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts any server certificate whose handshake signature verifies.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn cert_chain(key: &AuthKey) -> Vec<CertificateDer<'static>> {
    key.cert_chain
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect()
}

fn private_key(key: &AuthKey) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.private_key.clone()))
}

fn build_server_config(key: &AuthKey) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = provider();
    let mut config = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert { provider }))
        .with_single_cert(cert_chain(key), private_key(key))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn build_client_config(key: Option<&AuthKey>) -> Result<ClientConfig, TlsError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));
    let mut config = match key {
        Some(key) => builder.with_client_auth_cert(cert_chain(key), private_key(key))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Connection settings of the HTTP client used towards peers.
#[derive(Debug, Clone, Copy)]
pub struct PeerClientSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub pool_connections: bool,
}

fn build_peer_client(
    settings: PeerClientSettings,
    tls: Option<ClientConfig>,
) -> Result<reqwest::Client, TlsError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.read_timeout)
        .tls_info(true);
    if !settings.pool_connections {
        builder = builder.pool_max_idle_per_host(0);
    }
    if let Some(tls) = tls {
        builder = builder.use_preconfigured_tls(tls);
    }
    Ok(builder.build()?)
}

/// HTTP client for OCSP relay requests: same TLS policy as the peer client,
/// but never presents the authentication certificate.
///
/// # Errors
///
/// Returns [`TlsError`] if the client cannot be built.
pub fn relay_client(connect_timeout: Duration, read_timeout: Duration) -> Result<reqwest::Client, TlsError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(read_timeout)
        .use_preconfigured_tls(build_client_config(None)?)
        .build()?)
}

/// The exact set of addresses a request may go to. Pooled connections are
/// shared only between requests with equal sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressSet(Vec<String>);

impl AddressSet {
    pub fn new<'a>(urls: impl IntoIterator<Item = &'a Url>) -> Self {
        let mut origins: Vec<String> = urls
            .into_iter()
            .map(|url| url.origin().ascii_serialization())
            .collect();
        origins.sort();
        origins.dedup();
        Self(origins)
    }
}

/// One generation of the TLS identity.
pub struct TlsIdentity {
    /// Key generation this identity was built from.
    pub generation: u64,
    /// Listener configuration; `None` when TLS is off.
    pub server: Option<Arc<ServerConfig>>,
    /// DER certificate chain presented to peers, leaf first.
    pub cert_chain: Vec<Vec<u8>>,
    settings: PeerClientSettings,
    client_tls: Option<ClientConfig>,
    /// Used for every request when pooling is off; keeps no idle sockets.
    unpooled: reqwest::Client,
    pools: Mutex<HashMap<AddressSet, reqwest::Client>>,
}

impl TlsIdentity {
    fn build(
        generation: u64,
        key: Option<&AuthKey>,
        settings: PeerClientSettings,
    ) -> Result<Self, TlsError> {
        let (server, cert_chain, client_tls) = match key {
            Some(key) => (
                Some(build_server_config(key)?),
                key.cert_chain.clone(),
                Some(build_client_config(Some(key))?),
            ),
            None => (None, Vec::new(), None),
        };
        let unpooled = build_peer_client(
            PeerClientSettings {
                pool_connections: false,
                ..settings
            },
            client_tls.clone(),
        )?;
        Ok(Self {
            generation,
            server,
            cert_chain,
            settings,
            client_tls,
            unpooled,
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Own leaf certificate, if any.
    pub fn leaf(&self) -> Option<&[u8]> {
        self.cert_chain.first().map(Vec::as_slice)
    }

    /// HTTP client for a request to one of `addresses`. With pooling on,
    /// each distinct address set gets a client, and so a connection pool, of
    /// its own.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if a new client cannot be built.
    pub fn peer_client(&self, addresses: &AddressSet) -> Result<reqwest::Client, TlsError> {
        if !self.settings.pool_connections {
            return Ok(self.unpooled.clone());
        }
        let mut pools = self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = pools.get(addresses) {
            return Ok(client.clone());
        }
        let client = build_peer_client(self.settings, self.client_tls.clone())?;
        pools.insert(addresses.clone(), client.clone());
        tracing::debug!(generation = self.generation, pools = pools.len(), "opened peer connection pool");
        Ok(client)
    }

    /// Number of connection pools opened so far.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

/// Swappable TLS identity.
pub struct TlsContext {
    keys: Arc<dyn KeyConf>,
    settings: PeerClientSettings,
    enabled: bool,
    current: RwLock<Arc<TlsIdentity>>,
}

impl TlsContext {
    /// Builds the initial identity from the key subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::NoAuthKey`] when TLS is enabled but no key is
    /// configured, and other [`TlsError`]s for unusable key material.
    pub fn new(keys: Arc<dyn KeyConf>, settings: PeerClientSettings, enabled: bool) -> Result<Self, TlsError> {
        let identity = Self::load(keys.as_ref(), settings, enabled)?;
        tracing::info!(generation = identity.generation, tls = enabled, "TLS identity initialized");
        Ok(Self {
            keys,
            settings,
            enabled,
            current: RwLock::new(Arc::new(identity)),
        })
    }

    fn load(keys: &dyn KeyConf, settings: PeerClientSettings, enabled: bool) -> Result<TlsIdentity, TlsError> {
        let generation = keys.auth_key_generation();
        if !enabled {
            return TlsIdentity::build(generation, None, settings);
        }
        let key = keys.auth_key().ok_or(TlsError::NoAuthKey)?;
        TlsIdentity::build(generation, Some(&key), settings)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The identity in effect now.
    pub fn current(&self) -> Arc<TlsIdentity> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Rebuilds the identity when the key generation moved on.
    ///
    /// Returns whether a new identity was installed.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if the new key material is unusable; the old
    /// identity stays in effect.
    pub fn reload_if_changed(&self) -> Result<bool, TlsError> {
        let generation = self.keys.auth_key_generation();
        if generation == self.current().generation {
            return Ok(false);
        }
        let identity = Arc::new(Self::load(self.keys.as_ref(), self.settings, self.enabled)?);
        let previous = {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *current, identity)
        };
        tracing::info!(
            from = previous.generation,
            to = generation,
            "TLS identity rotated"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_conf::InMemoryKeyConf;

    fn settings() -> PeerClientSettings {
        PeerClientSettings {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            pool_connections: true,
        }
    }

    fn addresses(urls: &[&str]) -> AddressSet {
        let urls: Vec<Url> = urls.iter().map(|u| Url::parse(u).unwrap()).collect();
        AddressSet::new(&urls)
    }

    #[test]
    fn address_sets_ignore_order_and_paths() {
        assert_eq!(
            addresses(&["https://10.0.0.1:5500/", "https://10.0.0.2:5500/x"]),
            addresses(&["https://10.0.0.2:5500", "https://10.0.0.1:5500"])
        );
        assert_ne!(
            addresses(&["https://10.0.0.1:5500"]),
            addresses(&["https://10.0.0.1:5500", "https://10.0.0.2:5500"])
        );
    }

    #[test]
    fn pools_are_keyed_by_address_set() {
        let keys = Arc::new(InMemoryKeyConf::new());
        let context = TlsContext::new(keys, settings(), false).unwrap();
        let identity = context.current();
        let pair = addresses(&["http://10.0.0.1:5500", "http://10.0.0.2:5500"]);
        identity.peer_client(&pair).unwrap();
        identity
            .peer_client(&addresses(&["http://10.0.0.2:5500", "http://10.0.0.1:5500"]))
            .unwrap();
        assert_eq!(identity.pool_count(), 1);

        identity.peer_client(&addresses(&["http://10.0.0.1:5500"])).unwrap();
        assert_eq!(identity.pool_count(), 2);
    }

    #[test]
    fn no_pools_unless_enabled() {
        let keys = Arc::new(InMemoryKeyConf::new());
        let unpooled = PeerClientSettings {
            pool_connections: false,
            ..settings()
        };
        let context = TlsContext::new(keys, unpooled, false).unwrap();
        let identity = context.current();
        identity.peer_client(&addresses(&["http://10.0.0.1:5500"])).unwrap();
        identity.peer_client(&addresses(&["http://10.0.0.2:5500"])).unwrap();
        assert_eq!(identity.pool_count(), 0);
    }

    fn auth_key(name: &str) -> AuthKey {
        let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        AuthKey {
            cert_chain: vec![certified.cert.der().to_vec()],
            private_key: certified.key_pair.serialize_der(),
        }
    }

    #[test]
    fn enabled_tls_requires_an_auth_key() {
        let keys = Arc::new(InMemoryKeyConf::new());
        assert!(matches!(
            TlsContext::new(keys.clone(), settings(), true),
            Err(TlsError::NoAuthKey)
        ));
        let plain = TlsContext::new(keys, settings(), false).unwrap();
        assert!(plain.current().server.is_none());
    }

    #[test]
    fn reload_follows_key_generation() {
        let keys = Arc::new(InMemoryKeyConf::new());
        let first = auth_key("ss1.example");
        keys.set_auth_key(first.clone(), vec![]);
        let context = TlsContext::new(keys.clone(), settings(), true).unwrap();
        assert_eq!(context.current().leaf(), Some(first.cert_chain[0].as_slice()));
        assert!(!context.reload_if_changed().unwrap());

        let second = auth_key("ss1.example");
        keys.set_auth_key(second.clone(), vec![]);
        assert!(context.reload_if_changed().unwrap());
        let current = context.current();
        assert_eq!(current.generation, 2);
        assert_eq!(current.leaf(), Some(second.cert_chain[0].as_slice()));
    }

    #[test]
    fn unusable_key_keeps_previous_identity() {
        let keys = Arc::new(InMemoryKeyConf::new());
        keys.set_auth_key(auth_key("ss1.example"), vec![]);
        let context = TlsContext::new(keys.clone(), settings(), true).unwrap();
        keys.set_auth_key(
            AuthKey {
                cert_chain: vec![vec![0x30, 0x00]],
                private_key: vec![1, 2, 3],
            },
            vec![],
        );
        assert!(context.reload_if_changed().is_err());
        assert_eq!(context.current().generation, 1);
    }
}
