//! Loading the in-memory configuration from a TOML snapshot file.
//!
//! The snapshot is a static export of the federation and local
//! configuration plus the key material of this server. Relative file paths
//! inside it are resolved against the snapshot's own directory.
//!
//! ```toml
//! instance = "EE"
//! valid_until = "2030-01-01T00:00:00Z"
//!
//! [server]
//! owner = "EE/GOV/70000001"
//! code = "ss1"
//!
//! [[members]]
//! id = "EE/GOV/70000001"
//! signing_public_key = "<hex>"
//!
//! [[servers]]
//! id = "EE/GOV/70000001/ss1"
//! address = "ss1.example.org:5500"
//! clients = ["EE/GOV/70000001/registry"]
//! auth_cert_paths = ["auth.pem"]
//!
//! [[trust]]
//! instance = "EE"
//! ca_cert_paths = ["ca.pem"]
//! ocsp_responder_keys = ["<hex>"]
//!
//! [[clients]]
//! id = "EE/GOV/70000001/registry"
//! is_authentication = "NOSSL"
//!
//! [[services]]
//! provider = "EE/GOV/70000001/registry"
//! code = "people"
//! type = "REST"
//! address = "http://127.0.0.1:9000/api"
//! access = [{ client = "EE/GOV/70000002/app", method = "GET", path = "/people/**" }]
//!
//! [keys]
//! auth_cert_path = "auth.pem"
//! auth_key_path = "auth.key"
//! ocsp_response_paths = ["auth.ocsp.json"]
//! signing = [{ member = "EE/GOV/70000001", secret_key = "<hex>" }]
//! ```

use crate::acl::{AccessRight, AccessRightEntry};
use crate::global::InMemoryGlobalConf;
use crate::keys::{AuthKey, InMemoryKeyConf};
use crate::server::{
    ClientStatus, DescriptionType, InMemoryServerConf, IsAuthentication, ServiceDefinition,
    DEFAULT_SERVICE_TIMEOUT_SECS,
};
use crate::ConfError;
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use trustgate_types::{OcspResponse, PartyId, SecurityServerId, ServiceId};

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    instance: String,
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
    server: OwnServerEntry,
    #[serde(default)]
    members: Vec<MemberEntry>,
    #[serde(default)]
    servers: Vec<ServerEntry>,
    #[serde(default)]
    trust: Vec<TrustEntry>,
    #[serde(default)]
    clients: Vec<ClientEntry>,
    #[serde(default)]
    services: Vec<ServiceEntry>,
    #[serde(default)]
    keys: KeysEntry,
}

#[derive(Debug, Deserialize)]
struct OwnServerEntry {
    owner: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct MemberEntry {
    id: String,
    #[serde(default)]
    signing_public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    id: String,
    address: String,
    #[serde(default)]
    clients: Vec<String>,
    #[serde(default)]
    auth_cert_hashes: Vec<String>,
    #[serde(default)]
    auth_cert_paths: Vec<String>,
    #[serde(default)]
    maintenance: bool,
    #[serde(default)]
    maintenance_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrustEntry {
    instance: String,
    #[serde(default)]
    ca_cert_paths: Vec<String>,
    #[serde(default)]
    ocsp_responder_keys: Vec<String>,
}

fn default_status() -> ClientStatus {
    ClientStatus::Registered
}

#[derive(Debug, Deserialize)]
struct ClientEntry {
    id: String,
    #[serde(default = "default_status")]
    status: ClientStatus,
    #[serde(default)]
    is_authentication: IsAuthentication,
    #[serde(default)]
    is_cert_paths: Vec<String>,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_SERVICE_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    provider: String,
    code: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(rename = "type")]
    description_type: DescriptionType,
    #[serde(default)]
    address: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
    #[serde(default)]
    disabled_notice: Option<String>,
    #[serde(default)]
    access: Vec<AccessRightEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct KeysEntry {
    #[serde(default)]
    auth_cert_path: Option<String>,
    #[serde(default)]
    auth_key_path: Option<String>,
    #[serde(default)]
    ocsp_response_paths: Vec<String>,
    #[serde(default)]
    signing: Vec<SigningEntry>,
}

#[derive(Debug, Deserialize)]
struct SigningEntry {
    member: String,
    secret_key: String,
}

/// Paths of the authentication key files named by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKeyPaths {
    /// PEM certificate chain, leaf first.
    pub cert: PathBuf,
    /// PEM PKCS#8 private key.
    pub key: PathBuf,
    /// JSON OCSP evidence files.
    pub ocsp: Vec<PathBuf>,
}

/// Configuration loaded from a snapshot.
pub struct Snapshot {
    /// Federation configuration.
    pub global: Arc<InMemoryGlobalConf>,
    /// Local server configuration.
    pub server: Arc<InMemoryServerConf>,
    /// Key material.
    pub keys: Arc<InMemoryKeyConf>,
    /// Where the authentication key came from, for reloads.
    pub auth_key_paths: Option<AuthKeyPaths>,
}

/// Loads a snapshot file.
///
/// # Errors
///
/// Returns [`ConfError`] if the file or any file it references cannot be
/// read or parsed.
pub fn load_snapshot(path: &Path) -> Result<Snapshot, ConfError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfError::file(path, e))?;
    let file: SnapshotFile = toml::from_str(&contents)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let resolve = |p: &str| base.join(p);

    let global = InMemoryGlobalConf::new(&file.instance);
    global.set_valid_until(file.valid_until);

    for member in &file.members {
        let key = member
            .signing_public_key
            .as_deref()
            .map(parse_verifying_key)
            .transpose()?;
        global.add_member(member.id.parse()?, key);
    }

    for entry in &file.servers {
        let id: SecurityServerId = entry.id.parse()?;
        let clients = entry
            .clients
            .iter()
            .map(|c| c.parse::<PartyId>())
            .collect::<Result<Vec<_>, _>>()?;
        global.add_server(id.clone(), &entry.address, clients);
        for hash in &entry.auth_cert_hashes {
            global.add_auth_cert(&id, hash);
        }
        for cert_path in &entry.auth_cert_paths {
            if let Some(leaf) = load_pem_certs(&resolve(cert_path))?.first() {
                global.add_auth_cert(&id, sha256_hex(leaf));
            }
        }
        if entry.maintenance {
            global.set_maintenance(&id, true, entry.maintenance_message.clone());
        }
    }

    for entry in &file.trust {
        for ca_path in &entry.ca_cert_paths {
            for der in load_pem_certs(&resolve(ca_path))? {
                global.add_ca_cert(&entry.instance, der);
            }
        }
        for key in &entry.ocsp_responder_keys {
            global.add_ocsp_responder(&entry.instance, parse_verifying_key(key)?);
        }
    }

    let own_id = SecurityServerId::new(file.server.owner.parse()?, &file.server.code);
    let server = InMemoryServerConf::new(own_id);
    for entry in &file.clients {
        let mut certs = Vec::new();
        for cert_path in &entry.is_cert_paths {
            certs.extend(load_pem_certs(&resolve(cert_path))?);
        }
        server.add_client(entry.id.parse()?, entry.status, entry.is_authentication, certs);
    }

    for entry in &file.services {
        let mut id = ServiceId::new(entry.provider.parse()?, &entry.code);
        if let Some(version) = &entry.version {
            id = id.with_version(version);
        }
        id.validate()?;
        let mut definition =
            ServiceDefinition::new(id, entry.description_type, entry.address.clone());
        definition.timeout = Duration::from_secs(entry.timeout_seconds);
        definition.disabled_notice = entry.disabled_notice.clone();
        for right in &entry.access {
            definition.access.push(AccessRight {
                client: right.client.parse()?,
                method: right.method.clone(),
                path: right.path.clone(),
            });
        }
        server.add_service(definition);
    }

    let keys = InMemoryKeyConf::new();
    for entry in &file.keys.signing {
        let member: PartyId = entry.member.parse()?;
        keys.add_signing_key(&member, parse_signing_key(&entry.secret_key)?);
    }

    let auth_key_paths = match (&file.keys.auth_cert_path, &file.keys.auth_key_path) {
        (Some(cert), Some(key)) => Some(AuthKeyPaths {
            cert: resolve(cert),
            key: resolve(key),
            ocsp: file.keys.ocsp_response_paths.iter().map(|p| resolve(p)).collect(),
        }),
        (None, None) => None,
        _ => {
            return Err(ConfError::Key(
                "auth_cert_path and auth_key_path must be set together".to_string(),
            ))
        }
    };
    if let Some(paths) = &auth_key_paths {
        let (auth_key, ocsp) = load_auth_key(paths)?;
        keys.set_auth_key(auth_key, ocsp);
    }

    tracing::info!(
        instance = %file.instance,
        servers = file.servers.len(),
        services = file.services.len(),
        "loaded configuration snapshot"
    );

    Ok(Snapshot {
        global: Arc::new(global),
        server: Arc::new(server),
        keys: Arc::new(keys),
        auth_key_paths,
    })
}

/// Loads the authentication key and its OCSP evidence.
///
/// # Errors
///
/// Returns [`ConfError`] if a file is unreadable or holds no usable material.
pub fn load_auth_key(paths: &AuthKeyPaths) -> Result<(AuthKey, Vec<OcspResponse>), ConfError> {
    let cert_chain = load_pem_certs(&paths.cert)?;
    if cert_chain.is_empty() {
        return Err(ConfError::Key(format!(
            "no certificates in {}",
            paths.cert.display()
        )));
    }
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(&paths.key).map_err(|e| ConfError::file(&paths.key, e))?,
    );
    let private_key = match rustls_pemfile::read_one(&mut reader)
        .map_err(|e| ConfError::file(&paths.key, e))?
    {
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => key.secret_pkcs8_der().to_vec(),
        _ => {
            return Err(ConfError::Key(format!(
                "{} does not hold a PKCS#8 private key",
                paths.key.display()
            )))
        }
    };

    let mut ocsp = Vec::new();
    for path in &paths.ocsp {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfError::file(path, e))?;
        let mut responses: Vec<OcspResponse> = serde_json::from_str(&contents)
            .map_err(|e| ConfError::Key(format!("{}: {e}", path.display())))?;
        ocsp.append(&mut responses);
    }

    Ok((
        AuthKey {
            cert_chain,
            private_key,
        },
        ocsp,
    ))
}

/// Reads every certificate from a PEM file as DER.
///
/// # Errors
///
/// Returns [`ConfError::FileRead`] if the file cannot be read.
pub fn load_pem_certs(path: &Path) -> Result<Vec<Vec<u8>>, ConfError> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path).map_err(|e| ConfError::file(path, e))?,
    );
    rustls_pemfile::certs(&mut reader)
        .map(|cert| cert.map(|der| der.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfError::file(path, e))
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

fn decode_key_bytes(hex_key: &str) -> Result<[u8; 32], ConfError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| ConfError::Key(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ConfError::Key("Ed25519 keys must be 32 bytes".to_string()))
}

fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, ConfError> {
    VerifyingKey::from_bytes(&decode_key_bytes(hex_key)?).map_err(|e| ConfError::Key(e.to_string()))
}

fn parse_signing_key(hex_key: &str) -> Result<SigningKey, ConfError> {
    Ok(SigningKey::from_bytes(&decode_key_bytes(hex_key)?))
}
