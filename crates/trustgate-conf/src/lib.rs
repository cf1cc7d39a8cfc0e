//! Collaborator interfaces consumed by the proxy core.
//!
//! The federation configuration ([`GlobalConf`]), the local server
//! configuration ([`ServerConf`]) and the key subsystem ([`KeyConf`]) are
//! external systems; the core only depends on these traits. In-memory
//! implementations back the tests and the standalone binary, which fills
//! them from a TOML [snapshot](load_snapshot).

mod acl;
mod error;
mod global;
mod keys;
mod server;
mod snapshot;

pub use acl::{normalize_path, path_matches, AccessRight, NormalizedPath};
pub use error::ConfError;
pub use global::{GlobalConf, InMemoryGlobalConf, MaintenanceMode, ServerAddress};
pub use keys::{AuthKey, Ed25519SigningCtx, InMemoryKeyConf, KeyConf, SigningCtx};
pub use server::{
    ClientStatus, DescriptionType, InMemoryServerConf, IsAuthentication, ServerConf,
    ServiceDefinition, DEFAULT_SERVICE_TIMEOUT_SECS,
};
pub use snapshot::{load_auth_key, load_pem_certs, load_snapshot, AuthKeyPaths, Snapshot};

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// A poisoned lock only means a writer panicked mid-update of plain data;
// the maps stay structurally valid, so readers keep going.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!("configuration lock poisoned, recovering");
        poisoned.into_inner()
    })
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!("configuration lock poisoned, recovering");
        poisoned.into_inner()
    })
}
