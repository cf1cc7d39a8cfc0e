//! Wire codec for trustgate transport units.
//!
//! A transport unit is a `multipart/mixed` document carrying, in order:
//!
//! 1. the message part (envelope, REST request or REST response), or a fault
//! 2. an optional body part with the business payload
//! 3. zero or more OCSP evidence parts
//! 4. the detached signature part
//!
//! [`ProxyMessageEncoder`] writes units into a bounded channel while the
//! body is still streaming in; [`ProxyMessageDecoder`] reads them back part
//! by part, spooling large bodies to disk and computing the digests that
//! [`ProxyMessage::verify`] checks the signature against.

mod body;
mod decoder;
mod digest;
mod encoder;
mod error;
mod headers;
mod message;
mod proxy_message;
mod signature;

pub use body::{BodySpooler, SpooledBody, DEFAULT_SPOOL_THRESHOLD};
pub use decoder::{
    collect, decode_fault_document, parse_boundary, PartKind, ProxyMessageDecoder, MAX_FAULT_DOCUMENT,
};
pub use digest::{
    decode_b64, encode_b64, request_hash, DigestAlgorithm, Digester, UnknownDigestAlgorithm,
};
pub use encoder::{
    encode_request_hash, EncodedBody, ProxyMessageEncoder, BODY_LOOKAHEAD,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use error::CodecError;
pub use headers::*;
pub use message::{
    Envelope, EnvelopeHeader, HeaderField, Message, MessageKind, Parsed, RequestHashValue,
    RestRequest, RestResponse,
};
pub use proxy_message::ProxyMessage;
pub use signature::{
    create_signature, signing_input, verify_signature, PartDigest, SignatureData, PART_BODY,
    PART_FAULT, PART_MESSAGE,
};
