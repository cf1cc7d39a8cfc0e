//! Trustgate security-server proxy.
//!
//! Two listeners share one [`AppState`]: the consumer side takes requests
//! from local information systems and sends them, signed, to the provider's
//! security server; the provider side verifies those requests and calls the
//! local service.

pub mod admission;
pub mod api_ocsp;
pub mod background;
pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod listener;
pub mod processor;
pub mod server;
pub mod streams;
pub mod tls;

use admission::{AdmissionController, LoadProbe};
use axum::{routing::get, Extension, Json, Router};
use config::Config;
use error::StartupError;
use listener::{spawn_accept_loop, ChannelListener, ListenerOptions};
use serde_json::{json, Value};
use server::handlers::HandlerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tls::{PeerClientSettings, TlsContext};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use trustgate_conf::{GlobalConf, KeyConf, ServerConf};
use trustgate_observe::{MessageLog, OpMonitor};
use trustgate_trust::{HttpOcspFetcher, TrustVerifier, OCSP_RELAY_PATH};

/// Application state shared by both listeners and the background tasks.
pub struct AppState {
    pub config: Config,
    /// Federation configuration.
    pub global: Arc<dyn GlobalConf>,
    /// Local server configuration.
    pub server: Arc<dyn ServerConf>,
    /// Signing contexts and the authentication key.
    pub keys: Arc<dyn KeyConf>,
    /// Current TLS identity, swapped on key rotation.
    pub tls: Arc<TlsContext>,
    pub trust: Arc<TrustVerifier>,
    pub handlers: HandlerRegistry,
    /// HTTP client for calls to local services.
    pub service_client: reqwest::Client,
    /// Connection gate of the provider listener.
    pub admission: Arc<AdmissionController>,
    pub message_log: Arc<dyn MessageLog>,
    pub monitor: Arc<dyn OpMonitor>,
}

/// The collaborators the proxy reads its configuration from and writes its
/// records to.
pub struct Collaborators {
    pub global: Arc<dyn GlobalConf>,
    pub server: Arc<dyn ServerConf>,
    pub keys: Arc<dyn KeyConf>,
    pub message_log: Arc<dyn MessageLog>,
    pub monitor: Arc<dyn OpMonitor>,
}

impl AppState {
    /// Builds the shared state: TLS identity, trust verifier, handler
    /// registry and HTTP clients.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] for contradictory settings, unknown handler
    /// names, unusable key material or HTTP clients that cannot be built.
    pub fn new(config: Config, collaborators: Collaborators, probe: Arc<dyn LoadProbe>) -> Result<Self, StartupError> {
        if config.client.tls && !config.tls.enabled {
            return Err(StartupError::Invalid(
                "client.tls requires tls.enabled".to_string(),
            ));
        }
        let Collaborators {
            global,
            server,
            keys,
            message_log,
            monitor,
        } = collaborators;

        let handlers = HandlerRegistry::from_names(&config.server.service_handlers)?;
        let tls = Arc::new(TlsContext::new(
            keys.clone(),
            PeerClientSettings {
                connect_timeout: config.client.connect_timeout(),
                read_timeout: config.client.read_timeout(),
                pool_connections: config.client.pool_connections,
            },
            config.tls.enabled,
        )?);

        let relay = tls::relay_client(
            Duration::from_millis(config.ocsp_relay.connect_timeout_ms),
            Duration::from_millis(config.ocsp_relay.read_timeout_ms),
        )?;
        let trust = Arc::new(
            TrustVerifier::new(global.clone(), Arc::new(HttpOcspFetcher::with_client(relay)))
                .with_freshness(Duration::from_secs(config.ocsp_relay.freshness_seconds)),
        );

        // Per-service timeouts are applied on each request.
        let service_client = reqwest::Client::builder()
            .connect_timeout(config.client.connect_timeout())
            .build()?;
        let admission = Arc::new(AdmissionController::new(config.anti_dos.clone(), probe));

        Ok(Self {
            config,
            global,
            server,
            keys,
            tls,
            trust,
            handlers,
            service_client,
            admission,
            message_log,
            monitor,
        })
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Router of the consumer-facing listener. Every path other than `/health`
/// is a request to send.
pub fn consumer_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(client::consumer_handler)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Router of the peer-facing listener.
pub fn provider_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(OCSP_RELAY_PATH, get(api_ocsp::ocsp_relay_handler))
        .fallback(server::provider_handler)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

fn handshake_timeout(state: &AppState) -> Duration {
    Duration::from_millis(state.config.server.handshake_timeout_ms)
}

/// Accept loop of the consumer listener: HTTPS only when `client.tls` is on,
/// no admission control.
///
/// # Errors
///
/// Returns an I/O error if the socket address cannot be read.
pub fn consumer_listener(state: &AppState, tcp: TcpListener) -> std::io::Result<ChannelListener> {
    spawn_accept_loop(
        tcp,
        ListenerOptions {
            role: "consumer",
            tls: state.config.client.tls.then(|| state.tls.clone()),
            admission: None,
            handshake_timeout: handshake_timeout(state),
        },
    )
}

/// Accept loop of the peer listener, gated by admission control.
///
/// # Errors
///
/// Returns an I/O error if the socket address cannot be read.
pub fn provider_listener(state: &AppState, tcp: TcpListener) -> std::io::Result<ChannelListener> {
    spawn_accept_loop(
        tcp,
        ListenerOptions {
            role: "provider",
            tls: state.tls.is_enabled().then(|| state.tls.clone()),
            admission: Some(state.admission.clone()),
            handshake_timeout: handshake_timeout(state),
        },
    )
}
