use std::time::Duration;

use sync_proto::{DataKind, ExceptionKind, ProtoError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection is not open")]
    NotConnected,
    #[error("no connection established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server exception {}: {message}", kind.as_wire())]
    Exception {
        kind: ExceptionKind,
        message: String,
    },
    #[error("request {correlation_id} got no reply within {after:?}")]
    RequestTimeout { correlation_id: u64, after: Duration },
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Protocol(#[from] ProtoError),
    #[error("archive fetch failed: {0}")]
    Archive(String),
    #[error("series view is already driven by a synchronizer")]
    AlreadyAttached,
    #[error("failed to decode {kind} payload: {source}")]
    Decode {
        kind: DataKind,
        #[source]
        source: serde_json::Error,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;
