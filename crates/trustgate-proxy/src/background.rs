//! Background tasks for the proxy.
//!
//! Includes:
//! - Rotating the TLS identity when the authentication key changes.
//! - Reloading the authentication key files when they are replaced on disk.
//! - Pruning stale entries from the OCSP evidence cache.

use crate::AppState;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::{sleep, Duration};
use trustgate_conf::{load_auth_key, AuthKeyPaths, InMemoryKeyConf};

/// Installs a new TLS identity whenever the key generation changes.
pub async fn start_tls_reload_task(state: Arc<AppState>, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::warn!("TLS reload task disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(interval_seconds, "starting TLS reload task");

    loop {
        sleep(interval).await;
        match state.tls.reload_if_changed() {
            Ok(true) => tracing::info!(generation = state.tls.current().generation, "TLS identity reloaded"),
            Ok(false) => {}
            Err(e) => tracing::error!("failed to reload TLS identity: {}", e),
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[derive(Debug, PartialEq, Eq)]
struct Stamps {
    key: Vec<Option<SystemTime>>,
    ocsp: Vec<Option<SystemTime>>,
}

impl Stamps {
    fn read(paths: &AuthKeyPaths) -> Self {
        Self {
            key: vec![modified(&paths.cert), modified(&paths.key)],
            ocsp: paths.ocsp.iter().map(|p| modified(p)).collect(),
        }
    }
}

/// Reloads the authentication key files when their modification times
/// change. New certificate or key material bumps the key generation, which
/// the TLS reload task picks up; new OCSP evidence alone does not.
pub async fn start_auth_key_watch_task(keys: Arc<InMemoryKeyConf>, paths: AuthKeyPaths, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::warn!("authentication key watch disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_seconds);
    let mut seen = Stamps::read(&paths);
    tracing::info!(interval_seconds, cert = %paths.cert.display(), "watching authentication key files");

    loop {
        sleep(interval).await;
        let now = Stamps::read(&paths);
        if now == seen {
            continue;
        }
        let key_changed = now.key != seen.key;
        let loaded = tokio::task::spawn_blocking({
            let paths = paths.clone();
            move || load_auth_key(&paths)
        })
        .await;

        match loaded {
            Ok(Ok((key, ocsp))) => {
                if key_changed {
                    let generation = keys.set_auth_key(key, ocsp);
                    tracing::info!(generation, "authentication key reloaded");
                } else {
                    tracing::info!(count = ocsp.len(), "authentication OCSP evidence reloaded");
                    keys.set_auth_ocsp_responses(ocsp);
                }
                seen = now;
            }
            // Files are retried on the next tick; a replacement may be half written.
            Ok(Err(e)) => tracing::error!("failed to reload authentication key: {}", e),
            Err(e) => tracing::error!("authentication key reload join error: {}", e),
        }
    }
}

/// Drops cached OCSP evidence older than the freshness window.
pub async fn start_ocsp_cache_prune_task(state: Arc<AppState>) {
    let freshness = state.trust.freshness();
    let interval = (freshness.to_std().unwrap_or(Duration::from_secs(600)) / 2)
        .clamp(Duration::from_secs(1), Duration::from_secs(300));
    tracing::info!(interval_seconds = interval.as_secs(), "starting OCSP cache prune task");

    loop {
        sleep(interval).await;
        let pruned = state.trust.cache().prune(Utc::now(), freshness);
        if pruned > 0 {
            tracing::info!(count = pruned, remaining = state.trust.cache().len(), "pruned stale OCSP evidence");
        }
    }
}
