//! Error types for encoding and decoding transport units.

use crate::message::MessageKind;
use trustgate_types::{CodedError, ErrorCode};

/// Errors produced by the wire codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The stream ended without a message part.
    #[error("request does not contain a {0} message")]
    MissingMessage(MessageKind),

    /// The stream ended without a signature part.
    #[error("message does not contain a signature")]
    MissingSignature,

    /// A part is malformed, unexpected or out of order.
    #[error("malformed transport unit: {0}")]
    InvalidMessage(String),

    /// The content type is not a multipart type with a boundary.
    #[error("invalid content type: {0}")]
    InvalidContentType(String),

    /// The detached signature does not validate.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// No trusted signing key is published for the sender.
    #[error("signing key not found for {0}")]
    SigningKeyNotFound(String),

    /// The signing context failed.
    #[error("failed to create signature: {0}")]
    Signing(#[from] trustgate_conf::ConfError),

    /// Response and request disagree on the negotiated protocol parameters.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The multipart framing could not be parsed.
    #[error("multipart error: {0}")]
    Multipart(#[from] multer::Error),

    /// A JSON part could not be parsed.
    #[error("invalid JSON part: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or spooling a body failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The producing side of a body stream failed.
    #[error("body stream failed: {0}")]
    Body(String),

    /// A buffered part grew past its size limit.
    #[error("content exceeds {0} bytes")]
    TooLarge(usize),

    /// The receiving side of the encoded stream went away.
    #[error("output stream closed")]
    Closed,
}

impl CodecError {
    /// The fault code this error maps to.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingMessage(MessageKind::Envelope) => ErrorCode::MissingEnvelope,
            Self::MissingMessage(_) => ErrorCode::MissingRest,
            Self::MissingSignature => ErrorCode::MissingSignature,
            Self::InvalidMessage(_) | Self::Multipart(_) | Self::Json(_) | Self::TooLarge(_) => {
                ErrorCode::InvalidMessage
            }
            Self::InvalidContentType(_) => ErrorCode::InvalidContentType,
            Self::InvalidSignature(_) => ErrorCode::InvalidSignatureValue,
            Self::SigningKeyNotFound(_) => ErrorCode::SigningKeyNotFound,
            Self::Signing(_) => ErrorCode::InternalError,
            Self::ProtocolMismatch(_) => ErrorCode::InvalidProtocol,
            Self::Io(_) | Self::Body(_) | Self::Closed => ErrorCode::IoError,
        }
    }
}

impl From<CodecError> for CodedError {
    fn from(err: CodecError) -> Self {
        CodedError::new(err.error_code(), err.to_string())
    }
}
