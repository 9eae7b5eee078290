//! Shared protocol definitions for the realtime subscription channel.
//! Keeping the envelope and discriminator tables in a dedicated crate lets
//! test servers and tooling speak the protocol without pulling in the
//! client runtime.

use thiserror::Error;

mod envelope;
mod topic;

pub use envelope::{
    subscribe_payload, DataFrame, Envelope, ExceptionKind, ExceptionPayload, MessageType,
    ServerFrame, PROTOCOL_VERSION,
};
pub use topic::{DataKind, Topic};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid json frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unexpected {0:?} envelope from server")]
    UnexpectedMessageType(MessageType),
    #[error("unknown data type {0}")]
    UnknownDataType(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
