//! Process configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use trustgate_codec::DigestAlgorithm;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Consumer-facing side.
    #[serde(default)]
    pub client: ClientConfig,

    /// Provider-facing (peer) side.
    #[serde(default)]
    pub server: ServerConfig,

    /// OCSP relay client.
    #[serde(default)]
    pub ocsp_relay: OcspRelayConfig,

    /// TLS on the peer-facing listener and outgoing peer connections.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Connection admission control on the peer-facing listener.
    #[serde(default)]
    pub anti_dos: AntiDosConfig,

    /// Collaborator configuration snapshot.
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Exchange log destination.
    #[serde(default)]
    pub message_log: MessageLogConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Consumer-side listener and outgoing request settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Host address to bind to.
    #[serde(default = "default_client_host")]
    pub host: IpAddr,

    /// Port local information systems call.
    #[serde(default = "default_client_port")]
    pub port: u16,

    /// Serve local callers over HTTPS.
    #[serde(default)]
    pub tls: bool,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Reuse connections to peer servers, per set of target addresses.
    #[serde(default)]
    pub pool_connections: bool,

    /// Peer port used when a server address carries none.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Time allowed for a caller to deliver its envelope.
    #[serde(default = "default_envelope_wait_ms")]
    pub envelope_wait_ms: u64,

    /// Digest algorithm for new exchanges.
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,

    /// Chunks buffered between the caller reader and the peer sender.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Provider-side listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: IpAddr,

    #[serde(default = "default_server_port")]
    pub port: u16,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Oldest peer software version accepted, e.g. `"0.1.0"`.
    #[serde(default)]
    pub min_client_version: Option<String>,

    /// Named service handlers tried before the default forwarder.
    #[serde(default = "default_service_handlers")]
    pub service_handlers: Vec<String>,

    /// In-memory limit for received bodies before they spill to disk.
    #[serde(default = "default_spool_threshold")]
    pub spool_threshold_bytes: usize,
}

/// Timeouts and freshness for OCSP evidence retrieval.
#[derive(Debug, Clone, Deserialize)]
pub struct OcspRelayConfig {
    #[serde(default = "default_ocsp_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_ocsp_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Maximum evidence age.
    #[serde(default = "default_freshness_seconds")]
    pub freshness_seconds: u64,
}

/// TLS settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Plain HTTP between peers when off (development and tests only).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the authentication key is checked for replacement.
    #[serde(default = "default_reload_interval_seconds")]
    pub reload_interval_seconds: u64,
}

/// Admission-control ceilings. Ratios above 1 disable their check.
#[derive(Debug, Clone, Deserialize)]
pub struct AntiDosConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_parallel_connections")]
    pub max_parallel_connections: usize,

    #[serde(default = "default_ratio_ceiling")]
    pub max_cpu_load: f64,

    #[serde(default = "default_min_free_file_handles")]
    pub min_free_file_handles: u64,

    #[serde(default = "default_ratio_ceiling")]
    pub max_heap_usage: f64,
}

/// Location of the configuration snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_path")]
    pub path: String,
}

/// Exchange log settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageLogConfig {
    /// JSON-lines file; records go to the tracing output when unset.
    #[serde(default)]
    pub path: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "trustgate_proxy=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_client_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_server_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_client_port() -> u16 {
    8080
}

fn default_server_port() -> u16 {
    5500
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    60_000
}

fn default_envelope_wait_ms() -> u64 {
    30_000
}

fn default_hash_algorithm() -> String {
    DigestAlgorithm::default().as_str().to_string()
}

fn default_channel_capacity() -> usize {
    trustgate_codec::DEFAULT_CHANNEL_CAPACITY
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_service_handlers() -> Vec<String> {
    vec!["list-methods".to_string()]
}

fn default_spool_threshold() -> usize {
    trustgate_codec::DEFAULT_SPOOL_THRESHOLD
}

fn default_ocsp_connect_timeout_ms() -> u64 {
    20_000
}

fn default_ocsp_read_timeout_ms() -> u64 {
    30_000
}

fn default_freshness_seconds() -> u64 {
    trustgate_trust::DEFAULT_FRESHNESS_SECS
}

fn default_reload_interval_seconds() -> u64 {
    60
}

fn default_max_parallel_connections() -> usize {
    5000
}

fn default_ratio_ceiling() -> f64 {
    1.1
}

fn default_min_free_file_handles() -> u64 {
    100
}

fn default_snapshot_path() -> String {
    "trustgate.snapshot.toml".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            port: default_client_port(),
            tls: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            pool_connections: false,
            server_port: default_server_port(),
            envelope_wait_ms: default_envelope_wait_ms(),
            hash_algorithm: default_hash_algorithm(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn envelope_wait(&self) -> Duration {
        Duration::from_millis(self.envelope_wait_ms)
    }

    /// Configured digest algorithm, the default one if unrecognized.
    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.hash_algorithm.parse().unwrap_or_else(|_| {
            tracing::warn!(value = %self.hash_algorithm, "unknown hash algorithm, using default");
            DigestAlgorithm::default()
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            min_client_version: None,
            service_handlers: default_service_handlers(),
            spool_threshold_bytes: default_spool_threshold(),
        }
    }
}

impl Default for OcspRelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_ocsp_connect_timeout_ms(),
            read_timeout_ms: default_ocsp_read_timeout_ms(),
            freshness_seconds: default_freshness_seconds(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reload_interval_seconds: default_reload_interval_seconds(),
        }
    }
}

impl Default for AntiDosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_parallel_connections: default_max_parallel_connections(),
            max_cpu_load: default_ratio_ceiling(),
            min_free_file_handles: default_min_free_file_handles(),
            max_heap_usage: default_ratio_ceiling(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: default_snapshot_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A named service handler does not exist.
    #[error("unknown service handler: {0}")]
    UnknownHandler(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `TRUSTGATE_CLIENT_PORT` overrides `client.port`
/// - `TRUSTGATE_SERVER_PORT` overrides `server.port`
/// - `TRUSTGATE_SNAPSHOT_PATH` overrides `snapshot.path`
/// - `TRUSTGATE_TLS_ENABLED` overrides `tls.enabled`
/// - `TRUSTGATE_LOG_LEVEL` overrides `logging.level`
/// - `TRUSTGATE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(port) = std::env::var("TRUSTGATE_CLIENT_PORT") {
        if let Ok(parsed) = port.parse() {
            config.client.port = parsed;
        }
    }
    if let Ok(port) = std::env::var("TRUSTGATE_SERVER_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(path) = std::env::var("TRUSTGATE_SNAPSHOT_PATH") {
        config.snapshot.path = path;
    }
    if let Ok(enabled) = std::env::var("TRUSTGATE_TLS_ENABLED") {
        config.tls.enabled = enabled == "true" || enabled == "1";
    }
    if let Ok(level) = std::env::var("TRUSTGATE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("TRUSTGATE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.client.port, 8080);
        assert_eq!(config.server.port, 5500);
        assert_eq!(config.client.envelope_wait(), Duration::from_secs(30));
        assert_eq!(config.anti_dos.max_parallel_connections, 5000);
        assert_eq!(config.anti_dos.min_free_file_handles, 100);
        assert!(config.anti_dos.max_cpu_load > 1.0);
        assert_eq!(config.ocsp_relay.freshness_seconds, 3600);
        assert_eq!(config.server.service_handlers, vec!["list-methods"]);
        assert_eq!(config.client.digest_algorithm(), DigestAlgorithm::Sha512);
        assert!(!config.client.pool_connections);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Some("/nonexistent/trustgate.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[client]\nhash_algorithm = \"SHA-256\"\n[anti_dos]\nmax_parallel_connections = 3"
        )
        .unwrap();
        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.client.digest_algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(config.anti_dos.max_parallel_connections, 3);
        assert!(config.anti_dos.enabled);
        assert_eq!(config.client.port, 8080);
        assert!(!config.client.pool_connections);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client\nport = ").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }
}
