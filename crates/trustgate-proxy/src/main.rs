//! Trustgate proxy binary.
//!
//! Loads the configuration and the collaborator snapshot, starts the
//! consumer and peer listeners with their background tasks, and shuts both
//! down on SIGTERM/SIGINT.

use axum::Router;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use trustgate_conf::load_snapshot;
use trustgate_observe::{JsonLinesLog, MessageLog, TracingSink};
use trustgate_proxy::admission::SystemProbe;
use trustgate_proxy::config::{self, Config};
use trustgate_proxy::error::StartupError;
use trustgate_proxy::listener::{ChannelListener, PeerInfo};
use trustgate_proxy::{background, consumer_app, consumer_listener, provider_app, provider_listener, AppState, Collaborators};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("TRUSTGATE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("trustgate-proxy failed to start: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));
    let config = config::load_config(selected_config_path)?;

    init_tracing(&config);
    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let snapshot = load_snapshot(Path::new(&config.snapshot.path))?;
    tracing::info!(path = %config.snapshot.path, "loaded configuration snapshot");

    let message_log: Arc<dyn MessageLog> = match &config.message_log.path {
        Some(path) => Arc::new(JsonLinesLog::open(Path::new(path))?),
        None => Arc::new(TracingSink),
    };

    let state = Arc::new(AppState::new(
        config.clone(),
        Collaborators {
            global: snapshot.global.clone(),
            server: snapshot.server.clone(),
            keys: snapshot.keys.clone(),
            message_log,
            monitor: Arc::new(TracingSink),
        },
        Arc::new(SystemProbe),
    )?);

    tokio::spawn(background::start_tls_reload_task(
        state.clone(),
        config.tls.reload_interval_seconds,
    ));
    tokio::spawn(background::start_ocsp_cache_prune_task(state.clone()));
    if let Some(paths) = snapshot.auth_key_paths.clone() {
        tokio::spawn(background::start_auth_key_watch_task(
            snapshot.keys.clone(),
            paths,
            config.tls.reload_interval_seconds,
        ));
    }

    let consumer_addr = SocketAddr::new(config.client.host, config.client.port);
    let provider_addr = SocketAddr::new(config.server.host, config.server.port);
    let consumer = consumer_listener(&state, TcpListener::bind(consumer_addr).await?)?;
    let provider = provider_listener(&state, TcpListener::bind(provider_addr).await?)?;
    tracing::info!(%consumer_addr, %provider_addr, tls = config.tls.enabled, "starting trustgate proxy");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = tokio::spawn(serve(consumer, consumer_app(state.clone()), shutdown_rx.clone()));
    let provider_task = tokio::spawn(serve(provider, provider_app(state), shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for task in [consumer_task, provider_task] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("listener error: {}", e),
            Err(e) => tracing::error!("listener task join error: {}", e),
        }
    }

    tracing::info!("trustgate proxy shut down");
    Ok(())
}

async fn serve(listener: ChannelListener, app: Router, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    axum::serve(listener, app.into_make_service_with_connect_info::<PeerInfo>())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
