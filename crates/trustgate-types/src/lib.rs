//! Shared identifiers, fault codes and evidence records for trustgate.
//!
//! Every other crate in the workspace builds on these types. They carry no
//! behaviour beyond validation and formatting, which keeps the dependency
//! graph acyclic: configuration, codec, trust and proxy crates all depend on
//! `trustgate-types` and never on each other in reverse.

mod error;
mod identifier;
mod ocsp;

pub use error::{
    CodedError, ErrorCategory, ErrorCode, Fault, FaultDocument, ParseErrorCodeError,
    PREFIX_CLIENT, PREFIX_CLIENT_PROXY, PREFIX_SERVER_PROXY, PREFIX_SERVICE_FAILED,
};
pub use identifier::{
    is_forbidden_char, validate_field, IdentifierError, PartyId, SecurityServerId, ServiceId,
};
pub use ocsp::{signed_payload, CertStatus, OcspResponse};
