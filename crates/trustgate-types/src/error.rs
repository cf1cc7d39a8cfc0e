//! Fault codes, coded errors and the structured fault document.
//!
//! Every failure that reaches a caller or a peer is expressed as a
//! [`CodedError`]: a dotted fault code (role prefixes followed by an
//! [`ErrorCode`]), a human readable message and an optional detail. The
//! prefixes make the side at fault identifiable from the code alone.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix added to failures raised by the consumer-side proxy.
pub const PREFIX_CLIENT_PROXY: &str = "Server.ClientProxy";
/// Prefix added to failures raised by the provider-side proxy.
pub const PREFIX_SERVER_PROXY: &str = "Server.ServerProxy";
/// Prefix for failures attributed to the remote service or its proxy.
pub const PREFIX_SERVICE_FAILED: &str = "ServiceFailed";
/// Prefix for failures caused by the caller.
pub const PREFIX_CLIENT: &str = "Client";

/// Error taxonomy used for classification and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Illegal identifier syntax or malformed request.
    Validation,
    /// Missing or invalid peer certificate, OCSP or signature problems.
    Authentication,
    /// Unknown member or service, ACL denial, disabled service.
    Authorization,
    /// The response does not answer the request it claims to answer.
    Consistency,
    /// Maintenance mode, no address, unreachable address.
    Availability,
    /// Timeouts, I/O failures and unexpected conditions.
    Internal,
}

/// Fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidClientIdentifier,
    InvalidServiceIdentifier,
    InvalidSecurityServer,
    InvalidMessage,
    InvalidContentType,
    InvalidHttpMethod,
    InvalidRequest,
    InvalidProtocol,
    ClientProxyVersionNotSupported,
    MissingEnvelope,
    MissingRest,
    MissingSignature,
    InvalidSignatureValue,
    SigningKeyNotFound,
    SslAuthFailed,
    UnknownMember,
    UnknownService,
    InvalidServiceType,
    AccessDenied,
    ServiceDisabled,
    ServiceMissingUrl,
    MalformedServiceAddress,
    MaintenanceMode,
    NetworkError,
    InconsistentResponse,
    OutdatedGlobalConf,
    IoError,
    InternalError,
}

impl ErrorCode {
    /// Returns the canonical fault-code label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidClientIdentifier => "InvalidClientIdentifier",
            Self::InvalidServiceIdentifier => "InvalidServiceIdentifier",
            Self::InvalidSecurityServer => "InvalidSecurityServer",
            Self::InvalidMessage => "InvalidMessage",
            Self::InvalidContentType => "InvalidContentType",
            Self::InvalidHttpMethod => "InvalidHttpMethod",
            Self::InvalidRequest => "InvalidRequest",
            Self::InvalidProtocol => "InvalidProtocol",
            Self::ClientProxyVersionNotSupported => "ClientProxyVersionNotSupported",
            Self::MissingEnvelope => "MissingEnvelope",
            Self::MissingRest => "MissingRest",
            Self::MissingSignature => "MissingSignature",
            Self::InvalidSignatureValue => "InvalidSignatureValue",
            Self::SigningKeyNotFound => "SigningKeyNotFound",
            Self::SslAuthFailed => "SslAuthFailed",
            Self::UnknownMember => "UnknownMember",
            Self::UnknownService => "UnknownService",
            Self::InvalidServiceType => "InvalidServiceType",
            Self::AccessDenied => "AccessDenied",
            Self::ServiceDisabled => "ServiceDisabled",
            Self::ServiceMissingUrl => "ServiceMissingUrl",
            Self::MalformedServiceAddress => "ServiceMalformedUrl",
            Self::MaintenanceMode => "MaintenanceMode",
            Self::NetworkError => "NetworkError",
            Self::InconsistentResponse => "InconsistentResponse",
            Self::OutdatedGlobalConf => "OutdatedGlobalConf",
            Self::IoError => "IOError",
            Self::InternalError => "InternalError",
        }
    }

    /// Returns the taxonomy bucket of this code.
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::InvalidClientIdentifier
            | Self::InvalidServiceIdentifier
            | Self::InvalidSecurityServer
            | Self::InvalidMessage
            | Self::InvalidContentType
            | Self::InvalidHttpMethod
            | Self::InvalidRequest
            | Self::InvalidProtocol
            | Self::ClientProxyVersionNotSupported
            | Self::MissingEnvelope
            | Self::MissingRest => ErrorCategory::Validation,
            Self::MissingSignature
            | Self::InvalidSignatureValue
            | Self::SigningKeyNotFound
            | Self::SslAuthFailed => ErrorCategory::Authentication,
            Self::UnknownMember
            | Self::UnknownService
            | Self::InvalidServiceType
            | Self::AccessDenied
            | Self::ServiceDisabled => ErrorCategory::Authorization,
            Self::InconsistentResponse => ErrorCategory::Consistency,
            Self::ServiceMissingUrl
            | Self::MalformedServiceAddress
            | Self::MaintenanceMode
            | Self::NetworkError
            | Self::OutdatedGlobalConf => ErrorCategory::Availability,
            Self::IoError | Self::InternalError => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = ParseErrorCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [ErrorCode; 28] = [
            ErrorCode::InvalidClientIdentifier,
            ErrorCode::InvalidServiceIdentifier,
            ErrorCode::InvalidSecurityServer,
            ErrorCode::InvalidMessage,
            ErrorCode::InvalidContentType,
            ErrorCode::InvalidHttpMethod,
            ErrorCode::InvalidRequest,
            ErrorCode::InvalidProtocol,
            ErrorCode::ClientProxyVersionNotSupported,
            ErrorCode::MissingEnvelope,
            ErrorCode::MissingRest,
            ErrorCode::MissingSignature,
            ErrorCode::InvalidSignatureValue,
            ErrorCode::SigningKeyNotFound,
            ErrorCode::SslAuthFailed,
            ErrorCode::UnknownMember,
            ErrorCode::UnknownService,
            ErrorCode::InvalidServiceType,
            ErrorCode::AccessDenied,
            ErrorCode::ServiceDisabled,
            ErrorCode::ServiceMissingUrl,
            ErrorCode::MalformedServiceAddress,
            ErrorCode::MaintenanceMode,
            ErrorCode::NetworkError,
            ErrorCode::InconsistentResponse,
            ErrorCode::OutdatedGlobalConf,
            ErrorCode::IoError,
            ErrorCode::InternalError,
        ];
        ALL.into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| ParseErrorCodeError(s.to_string()))
    }
}

/// Error returned when parsing an unknown fault code.
#[derive(Debug, Clone)]
pub struct ParseErrorCodeError(pub String);

impl fmt::Display for ParseErrorCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error code: {}", self.0)
    }
}

impl std::error::Error for ParseErrorCodeError {}

/// Structured fault document exchanged between proxies and returned to
/// envelope callers as `{"fault": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    /// Dotted fault code, e.g. `Server.ServerProxy.AccessDenied`.
    pub fault_code: String,
    /// Human readable reason.
    pub fault_string: String,
    /// Role that raised the fault, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_actor: Option<String>,
    /// Free-form diagnostic detail (an error id, never a stack trace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_detail: Option<String>,
}

/// Wrapper giving the fault document its `{"fault": ...}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDocument {
    /// The fault itself.
    pub fault: Fault,
}

/// A failure carrying a wire-level fault code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CodedError {
    code: String,
    kind: Option<ErrorCode>,
    message: String,
    detail: Option<String>,
    relayed: bool,
}

impl CodedError {
    /// Creates an error with the bare fault code.
    pub fn new(kind: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: kind.as_str().to_string(),
            kind: Some(kind),
            message: message.into(),
            detail: None,
            relayed: false,
        }
    }

    /// Wraps a fault received from a peer. Relayed faults already carry the
    /// prefixes of the side that raised them and are never re-prefixed.
    pub fn from_fault(fault: &Fault) -> Self {
        let tail = fault.fault_code.rsplit('.').next().unwrap_or_default();
        Self {
            code: fault.fault_code.clone(),
            kind: tail.parse().ok(),
            message: fault.fault_string.clone(),
            detail: fault.fault_detail.clone(),
            relayed: true,
        }
    }

    /// Prepends a role prefix to the fault code.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        if !self.relayed {
            self.code = format!("{prefix}.{}", self.code);
        }
        self
    }

    /// Attaches diagnostic detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Full dotted fault code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The underlying error code, when known.
    pub fn kind(&self) -> Option<ErrorCode> {
        self.kind
    }

    /// Human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Diagnostic detail, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Whether this error was received from a peer rather than raised here.
    pub fn is_relayed(&self) -> bool {
        self.relayed
    }

    /// Taxonomy bucket, [`ErrorCategory::Internal`] for unknown codes.
    pub fn category(&self) -> ErrorCategory {
        self.kind
            .map(ErrorCode::category)
            .unwrap_or(ErrorCategory::Internal)
    }

    /// Converts this error into the structured fault document.
    pub fn to_fault(&self, actor: Option<&str>) -> Fault {
        Fault {
            fault_code: self.code.clone(),
            fault_string: self.message.clone(),
            fault_actor: actor.map(str::to_string),
            fault_detail: self.detail.clone(),
        }
    }
}
