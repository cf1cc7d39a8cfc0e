//! Local security-server configuration: the identity of this server, its
//! registered clients and the services they provide.

use crate::acl::AccessRight;
use crate::{read_lock, write_lock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use trustgate_types::{PartyId, SecurityServerId, ServiceId};

/// Registration state of a local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Saved,
    RegistrationInProgress,
    Registered,
    DeletionInProgress,
    GlobalError,
}

impl ClientStatus {
    /// Returns the canonical label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::RegistrationInProgress => "registration_in_progress",
            Self::Registered => "registered",
            Self::DeletionInProgress => "deletion_in_progress",
            Self::GlobalError => "global_error",
        }
    }

    /// Only registered clients may take part in exchanges.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Registered)
    }
}

/// How a local information system must authenticate to the consumer-facing
/// listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum IsAuthentication {
    /// Plain HTTP is accepted.
    #[default]
    #[serde(rename = "NOSSL")]
    NoSsl,
    /// HTTPS is required but no client certificate.
    #[serde(rename = "SSLNOAUTH")]
    SslNoAuth,
    /// HTTPS with a registered client certificate is required.
    #[serde(rename = "SSLAUTH")]
    SslAuth,
}

/// Kind of service description, which fixes the protocol variant a service
/// accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum DescriptionType {
    /// Envelope-based service.
    #[serde(rename = "ENVELOPE")]
    Envelope,
    /// REST service without a description document.
    #[serde(rename = "REST")]
    Rest,
    /// REST service described by an OpenAPI 3 document.
    #[serde(rename = "OPENAPI3")]
    OpenApi3,
}

impl DescriptionType {
    /// Whether REST requests may be sent to services of this type.
    pub fn is_rest(self) -> bool {
        matches!(self, Self::Rest | Self::OpenApi3)
    }

    /// Returns the canonical label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Envelope => "ENVELOPE",
            Self::Rest => "REST",
            Self::OpenApi3 => "OPENAPI3",
        }
    }
}

/// Read access to the local server configuration.
pub trait ServerConf: Send + Sync {
    /// Identity of this security server.
    fn identifier(&self) -> SecurityServerId;

    /// Registration state of a local client, `None` when unknown.
    fn member_status(&self, client: &PartyId) -> Option<ClientStatus>;

    /// Required authentication mode for a local client's information system.
    fn is_authentication(&self, client: &PartyId) -> IsAuthentication;

    /// DER-encoded TLS certificates registered for a client's information
    /// systems.
    fn is_certs(&self, client: &PartyId) -> Vec<Vec<u8>>;

    /// Whether the service is configured on this server.
    fn service_exists(&self, service: &ServiceId) -> bool;

    /// Description type of the service.
    fn description_type(&self, service: &ServiceId) -> Option<DescriptionType>;

    /// Time allowed for the local service to answer.
    fn service_timeout(&self, service: &ServiceId) -> Duration;

    /// Address of the local service implementation.
    fn service_address(&self, service: &ServiceId) -> Option<String>;

    /// Access-control check for a caller, optionally narrowed to a REST
    /// method and path.
    fn is_query_allowed(
        &self,
        client: &PartyId,
        service: &ServiceId,
        method: Option<&str>,
        path: Option<&str>,
    ) -> bool;

    /// Administrator notice when the service is disabled.
    fn disabled_notice(&self, service: &ServiceId) -> Option<String>;

    /// All services provided by `provider`.
    fn services(&self, provider: &PartyId) -> Vec<ServiceId>;
}

/// Definition of one local service.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    /// Service identifier.
    pub id: ServiceId,
    /// Protocol variant of the service.
    pub description_type: DescriptionType,
    /// Address of the implementation, if configured.
    pub address: Option<String>,
    /// Answer timeout.
    pub timeout: Duration,
    /// Set when the service is administratively disabled.
    pub disabled_notice: Option<String>,
    /// Who may call the service.
    pub access: Vec<AccessRight>,
}

impl ServiceDefinition {
    /// Creates an enabled service without access rights.
    pub fn new(id: ServiceId, description_type: DescriptionType, address: Option<String>) -> Self {
        Self {
            id,
            description_type,
            address,
            timeout: Duration::from_secs(DEFAULT_SERVICE_TIMEOUT_SECS),
            disabled_notice: None,
            access: Vec::new(),
        }
    }

    /// Adds an access right.
    pub fn allow(mut self, right: AccessRight) -> Self {
        self.access.push(right);
        self
    }
}

/// Timeout applied to services that do not set one.
pub const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct ClientRecord {
    status: ClientStatus,
    is_authentication: IsAuthentication,
    is_certs: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct ServerState {
    clients: HashMap<PartyId, ClientRecord>,
    services: HashMap<ServiceId, ServiceDefinition>,
}

/// In-memory [`ServerConf`].
#[derive(Debug)]
pub struct InMemoryServerConf {
    identifier: SecurityServerId,
    state: RwLock<ServerState>,
}

impl InMemoryServerConf {
    /// Creates an empty configuration for the given server.
    pub fn new(identifier: SecurityServerId) -> Self {
        Self {
            identifier,
            state: RwLock::new(ServerState::default()),
        }
    }

    /// Adds or replaces a local client.
    pub fn add_client(
        &self,
        client: PartyId,
        status: ClientStatus,
        is_authentication: IsAuthentication,
        is_certs: Vec<Vec<u8>>,
    ) {
        write_lock(&self.state).clients.insert(
            client,
            ClientRecord {
                status,
                is_authentication,
                is_certs,
            },
        );
    }

    /// Adds or replaces a service definition.
    pub fn add_service(&self, definition: ServiceDefinition) {
        write_lock(&self.state)
            .services
            .insert(definition.id.clone(), definition);
    }

    /// Disables a service with the given notice, or re-enables it with `None`.
    pub fn set_disabled_notice(&self, service: &ServiceId, notice: Option<String>) {
        if let Some(definition) = write_lock(&self.state).services.get_mut(service) {
            definition.disabled_notice = notice;
        }
    }

    fn with_service<T>(&self, service: &ServiceId, f: impl FnOnce(&ServiceDefinition) -> T) -> Option<T> {
        read_lock(&self.state).services.get(service).map(f)
    }
}

impl ServerConf for InMemoryServerConf {
    fn identifier(&self) -> SecurityServerId {
        self.identifier.clone()
    }

    fn member_status(&self, client: &PartyId) -> Option<ClientStatus> {
        read_lock(&self.state)
            .clients
            .get(client)
            .map(|record| record.status)
    }

    fn is_authentication(&self, client: &PartyId) -> IsAuthentication {
        read_lock(&self.state)
            .clients
            .get(client)
            .map(|record| record.is_authentication)
            .unwrap_or_default()
    }

    fn is_certs(&self, client: &PartyId) -> Vec<Vec<u8>> {
        read_lock(&self.state)
            .clients
            .get(client)
            .map(|record| record.is_certs.clone())
            .unwrap_or_default()
    }

    fn service_exists(&self, service: &ServiceId) -> bool {
        read_lock(&self.state).services.contains_key(service)
    }

    fn description_type(&self, service: &ServiceId) -> Option<DescriptionType> {
        self.with_service(service, |definition| definition.description_type)
    }

    fn service_timeout(&self, service: &ServiceId) -> Duration {
        self.with_service(service, |definition| definition.timeout)
            .unwrap_or(Duration::from_secs(DEFAULT_SERVICE_TIMEOUT_SECS))
    }

    fn service_address(&self, service: &ServiceId) -> Option<String> {
        self.with_service(service, |definition| definition.address.clone())
            .flatten()
    }

    fn is_query_allowed(
        &self,
        client: &PartyId,
        service: &ServiceId,
        method: Option<&str>,
        path: Option<&str>,
    ) -> bool {
        self.with_service(service, |definition| {
            definition
                .access
                .iter()
                .any(|right| right.permits(client, method, path))
        })
        .unwrap_or(false)
    }

    fn disabled_notice(&self, service: &ServiceId) -> Option<String> {
        self.with_service(service, |definition| definition.disabled_notice.clone())
            .flatten()
    }

    fn services(&self, provider: &PartyId) -> Vec<ServiceId> {
        let mut services: Vec<ServiceId> = read_lock(&self.state)
            .services
            .keys()
            .filter(|id| &id.provider == provider)
            .cloned()
            .collect();
        services.sort();
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> PartyId {
        PartyId::subsystem("EE", "GOV", "1", "registry")
    }

    fn conf() -> InMemoryServerConf {
        let conf = InMemoryServerConf::new(SecurityServerId::new(provider(), "ss1"));
        let caller = PartyId::subsystem("EE", "GOV", "2", "app");
        conf.add_client(provider(), ClientStatus::Registered, IsAuthentication::NoSsl, vec![]);
        conf.add_service(
            ServiceDefinition::new(
                ServiceId::new(provider(), "people"),
                DescriptionType::Rest,
                Some("http://127.0.0.1:9000/api".into()),
            )
            .allow(AccessRight::endpoint(caller, "GET", "/people/*")),
        );
        conf
    }

    #[test]
    fn query_allowed_uses_access_rights() {
        let conf = conf();
        let service = ServiceId::new(provider(), "people");
        let caller = PartyId::subsystem("EE", "GOV", "2", "app");
        assert!(conf.is_query_allowed(&caller, &service, Some("GET"), Some("/people/1")));
        assert!(!conf.is_query_allowed(&caller, &service, Some("PUT"), Some("/people/1")));
        assert!(!conf.is_query_allowed(
            &caller,
            &ServiceId::new(provider(), "missing"),
            None,
            None
        ));
    }

    #[test]
    fn disabled_notice_round_trips() {
        let conf = conf();
        let service = ServiceId::new(provider(), "people");
        assert_eq!(conf.disabled_notice(&service), None);
        conf.set_disabled_notice(&service, Some("down for audit".into()));
        assert_eq!(conf.disabled_notice(&service).as_deref(), Some("down for audit"));
    }

    #[test]
    fn unknown_client_defaults() {
        let conf = conf();
        let stranger = PartyId::member("EE", "COM", "9");
        assert_eq!(conf.member_status(&stranger), None);
        assert_eq!(conf.is_authentication(&stranger), IsAuthentication::NoSsl);
        assert!(conf.member_status(&provider()).is_some_and(ClientStatus::is_active));
    }

    #[test]
    fn services_are_listed_per_provider() {
        let conf = conf();
        assert_eq!(conf.services(&provider()).len(), 1);
        assert!(conf.services(&PartyId::member("EE", "GOV", "1")).is_empty());
        assert!(conf.description_type(&ServiceId::new(provider(), "people")).is_some_and(DescriptionType::is_rest));
    }
}
