//! Federation-wide configuration: members, security servers and their
//! addresses, trust anchors, signing keys and maintenance state.

use crate::{read_lock, write_lock, ConfError};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use trustgate_types::{PartyId, SecurityServerId};

/// A security server serving a provider, with its network address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    /// The server identity.
    pub server: SecurityServerId,
    /// Host name or `host:port` as published in the federation configuration.
    pub address: String,
}

/// Maintenance state of one security server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceMode {
    /// Whether the server is excluded from routing.
    pub enabled: bool,
    /// Optional administrator message shown to callers.
    pub message: Option<String>,
}

/// Read access to the federation configuration.
pub trait GlobalConf: Send + Sync {
    /// Fails when the configuration has expired.
    ///
    /// # Errors
    ///
    /// Returns [`ConfError::Outdated`] past the validity window.
    fn verify_validity(&self) -> Result<(), ConfError>;

    /// Identifier of the local federation instance.
    fn instance_identifier(&self) -> String;

    /// Whether the party is a known federation member or subsystem.
    fn member_exists(&self, party: &PartyId) -> bool;

    /// All security servers serving `provider`.
    fn provider_addresses(&self, provider: &PartyId) -> Vec<ServerAddress>;

    /// Address of a specific security server.
    fn security_server_address(&self, server: &SecurityServerId) -> Option<String>;

    /// DER-encoded CA certificates trusted for `instance`.
    fn ca_certs(&self, instance: &str) -> Vec<Vec<u8>>;

    /// Keys of the OCSP responders trusted for `instance`.
    fn ocsp_responder_keys(&self, instance: &str) -> Vec<VerifyingKey>;

    /// Current maintenance state of a security server.
    fn maintenance_mode(&self, server: &SecurityServerId) -> MaintenanceMode;

    /// Message-signing key of the member owning `party`.
    fn signing_key(&self, party: &PartyId) -> Option<VerifyingKey>;

    /// Security server owning the authentication certificate with the given
    /// hex SHA-256 hash.
    fn server_by_auth_cert(&self, cert_hash: &str) -> Option<SecurityServerId>;
}

#[derive(Debug, Clone)]
struct ServerRecord {
    address: String,
    clients: HashSet<PartyId>,
    auth_cert_hashes: HashSet<String>,
    maintenance: MaintenanceMode,
}

#[derive(Debug, Default)]
struct GlobalState {
    valid_until: Option<DateTime<Utc>>,
    members: HashSet<PartyId>,
    signing_keys: HashMap<PartyId, VerifyingKey>,
    servers: HashMap<SecurityServerId, ServerRecord>,
    ca_certs: HashMap<String, Vec<Vec<u8>>>,
    ocsp_responders: HashMap<String, Vec<VerifyingKey>>,
}

/// In-memory [`GlobalConf`], populated programmatically or from a snapshot.
#[derive(Debug)]
pub struct InMemoryGlobalConf {
    instance: String,
    state: RwLock<GlobalState>,
}

impl InMemoryGlobalConf {
    /// Creates an empty configuration for `instance`.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            state: RwLock::new(GlobalState::default()),
        }
    }

    /// Sets the end of the validity window (`None` never expires).
    pub fn set_valid_until(&self, valid_until: Option<DateTime<Utc>>) {
        write_lock(&self.state).valid_until = valid_until;
    }

    /// Registers a member or subsystem, with the member's signing key when
    /// one is published.
    pub fn add_member(&self, party: PartyId, signing_key: Option<VerifyingKey>) {
        let mut state = write_lock(&self.state);
        if let Some(key) = signing_key {
            state.signing_keys.insert(party.member_id(), key);
        }
        state.members.insert(party);
    }

    /// Registers a security server. Its owner is always one of its clients.
    pub fn add_server(
        &self,
        server: SecurityServerId,
        address: impl Into<String>,
        clients: impl IntoIterator<Item = PartyId>,
    ) {
        let mut client_set: HashSet<PartyId> = clients.into_iter().collect();
        client_set.insert(server.owner.clone());
        write_lock(&self.state).servers.insert(
            server,
            ServerRecord {
                address: address.into(),
                clients: client_set,
                auth_cert_hashes: HashSet::new(),
                maintenance: MaintenanceMode::default(),
            },
        );
    }

    /// Associates an authentication certificate hash with a server.
    pub fn add_auth_cert(&self, server: &SecurityServerId, cert_hash: impl Into<String>) {
        if let Some(record) = write_lock(&self.state).servers.get_mut(server) {
            record.auth_cert_hashes.insert(cert_hash.into().to_lowercase());
        }
    }

    /// Changes the maintenance state of a server.
    pub fn set_maintenance(&self, server: &SecurityServerId, enabled: bool, message: Option<String>) {
        if let Some(record) = write_lock(&self.state).servers.get_mut(server) {
            record.maintenance = MaintenanceMode { enabled, message };
        }
    }

    /// Adds a trusted CA certificate for `instance`.
    pub fn add_ca_cert(&self, instance: impl Into<String>, der: Vec<u8>) {
        write_lock(&self.state)
            .ca_certs
            .entry(instance.into())
            .or_default()
            .push(der);
    }

    /// Adds a trusted OCSP responder key for `instance`.
    pub fn add_ocsp_responder(&self, instance: impl Into<String>, key: VerifyingKey) {
        write_lock(&self.state)
            .ocsp_responders
            .entry(instance.into())
            .or_default()
            .push(key);
    }
}

impl GlobalConf for InMemoryGlobalConf {
    fn verify_validity(&self) -> Result<(), ConfError> {
        match read_lock(&self.state).valid_until {
            Some(valid_until) if valid_until <= Utc::now() => {
                Err(ConfError::Outdated { valid_until })
            }
            _ => Ok(()),
        }
    }

    fn instance_identifier(&self) -> String {
        self.instance.clone()
    }

    fn member_exists(&self, party: &PartyId) -> bool {
        read_lock(&self.state).members.contains(party)
    }

    fn provider_addresses(&self, provider: &PartyId) -> Vec<ServerAddress> {
        let state = read_lock(&self.state);
        let mut addresses: Vec<ServerAddress> = state
            .servers
            .iter()
            .filter(|(_, record)| record.clients.contains(provider))
            .map(|(server, record)| ServerAddress {
                server: server.clone(),
                address: record.address.clone(),
            })
            .collect();
        addresses.sort_by(|a, b| a.server.cmp(&b.server));
        addresses
    }

    fn security_server_address(&self, server: &SecurityServerId) -> Option<String> {
        read_lock(&self.state)
            .servers
            .get(server)
            .map(|record| record.address.clone())
    }

    fn ca_certs(&self, instance: &str) -> Vec<Vec<u8>> {
        read_lock(&self.state)
            .ca_certs
            .get(instance)
            .cloned()
            .unwrap_or_default()
    }

    fn ocsp_responder_keys(&self, instance: &str) -> Vec<VerifyingKey> {
        read_lock(&self.state)
            .ocsp_responders
            .get(instance)
            .cloned()
            .unwrap_or_default()
    }

    fn maintenance_mode(&self, server: &SecurityServerId) -> MaintenanceMode {
        read_lock(&self.state)
            .servers
            .get(server)
            .map(|record| record.maintenance.clone())
            .unwrap_or_default()
    }

    fn signing_key(&self, party: &PartyId) -> Option<VerifyingKey> {
        read_lock(&self.state)
            .signing_keys
            .get(&party.member_id())
            .copied()
    }

    fn server_by_auth_cert(&self, cert_hash: &str) -> Option<SecurityServerId> {
        let needle = cert_hash.to_lowercase();
        read_lock(&self.state)
            .servers
            .iter()
            .find(|(_, record)| record.auth_cert_hashes.contains(&needle))
            .map(|(server, _)| server.clone())
    }
}
