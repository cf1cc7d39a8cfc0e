//! Exchange-log and operational-monitoring record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trustgate_types::{CodedError, PartyId, ServiceId};

/// Which role of the proxy produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyRole {
    /// Consumer side: the exchange was originated by a local caller.
    #[serde(rename = "Client")]
    Client,
    /// Provider side: the exchange was received from a peer.
    #[serde(rename = "Producer")]
    Producer,
}

impl ProxyRole {
    /// Returns the canonical label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "Client",
            Self::Producer => "Producer",
        }
    }
}

impl std::fmt::Display for ProxyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol variant of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageProtocol {
    Envelope,
    Rest,
}

/// One entry of the append-only exchange log: a signed message as it was
/// sent or received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Role that logged the message.
    pub role: ProxyRole,
    /// Whether this is the response half of the exchange.
    pub response: bool,
    /// Query id of the exchange.
    pub query_id: String,
    /// Correlation id carried in the transport headers.
    pub x_request_id: String,
    /// Calling party.
    pub client: PartyId,
    /// Called service.
    pub service: ServiceId,
    /// Raw message part (never the body).
    pub message: String,
    /// Detached signature, JSON encoded, when it is logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// When the record was made.
    pub created_at: DateTime<Utc>,
}

/// Operational-monitoring data for one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpMonitoringData {
    pub security_server_type: ProxyRole,
    pub request_in_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_out_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_in_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_out_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<MessageProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<PartyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_security_server_address: Option<String>,
    #[serde(default)]
    pub request_size: u64,
    #[serde(default)]
    pub response_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_string: Option<String>,
}

impl OpMonitoringData {
    /// Starts a record for an exchange received now.
    pub fn new(role: ProxyRole) -> Self {
        Self {
            security_server_type: role,
            request_in_ts: Utc::now(),
            request_out_ts: None,
            response_in_ts: None,
            response_out_ts: None,
            protocol: None,
            client: None,
            service: None,
            message_id: None,
            x_request_id: None,
            rest_method: None,
            rest_path: None,
            service_security_server_address: None,
            request_size: 0,
            response_size: 0,
            response_status: None,
            succeeded: false,
            fault_code: None,
            fault_string: None,
        }
    }

    /// Marks the exchange failed with the given error.
    pub fn set_fault(&mut self, error: &CodedError) {
        self.succeeded = false;
        self.fault_code = Some(error.code().to_string());
        self.fault_string = Some(error.message().to_string());
    }
}
