//! Client side of the OCSP relay: `GET /ocsp?cert=<hash>&cert=<hash>...`
//! on a peer's address returns a JSON array of evidence for exactly the
//! requested certificates.

use crate::TrustError;
use async_trait::async_trait;
use std::time::Duration;
use trustgate_types::OcspResponse;
use url::Url;

/// Path the relay is served on.
pub const OCSP_RELAY_PATH: &str = "/ocsp";

/// Fetches evidence from a peer.
#[async_trait]
pub trait OcspFetcher: Send + Sync {
    /// Requests evidence for `hashes` from the relay at `peer`.
    async fn fetch(&self, peer: &Url, hashes: &[String]) -> Result<Vec<OcspResponse>, TrustError>;
}

/// Relay URL for the given certificate hashes.
pub fn relay_url(peer: &Url, hashes: &[String]) -> Url {
    let mut url = peer.clone();
    url.set_path(OCSP_RELAY_PATH);
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        for hash in hashes {
            query.append_pair("cert", hash);
        }
    }
    url
}

/// [`OcspFetcher`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpOcspFetcher {
    client: reqwest::Client,
}

impl HttpOcspFetcher {
    /// Builds a fetcher with its own connect and overall read timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Fetch`] if the HTTP client cannot be built.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, TrustError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Uses a preconfigured client, e.g. one carrying this server's TLS
    /// identity.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OcspFetcher for HttpOcspFetcher {
    async fn fetch(&self, peer: &Url, hashes: &[String]) -> Result<Vec<OcspResponse>, TrustError> {
        let url = relay_url(peer, hashes);
        tracing::debug!(%url, count = hashes.len(), "fetching OCSP evidence from peer relay");
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(TrustError::RelayStatus(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }
}
