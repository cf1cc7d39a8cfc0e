//! Peer authentication for trustgate: certificate chains, OCSP evidence and
//! the OCSP relay client.

mod cache;
mod error;
mod ocsp;
mod relay;
mod verifier;

pub use cache::OcspCache;
pub use error::TrustError;
pub use ocsp::{cert_hash, is_fresh, sign_ocsp, verify_ocsp, DEFAULT_FRESHNESS_SECS};
pub use relay::{relay_url, HttpOcspFetcher, OcspFetcher, OCSP_RELAY_PATH};
pub use verifier::{verify_chain, TrustVerifier};
