//! Error types for the hypercube mesh.
//!
//! Every fallible operation in the crate returns [`MeshError`]. The stable
//! string codes from [`MeshError::wire_code`] are what travels inside
//! `"error"` replies, so peers built against older versions can still match
//! on them.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the mesh.
#[derive(Debug, Error)]
pub enum MeshError {
    // Configuration / input errors
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Invalid storage module: {message}")]
    InvalidStorageModule { message: String },

    // Link errors
    #[error("Socket closed")]
    SocketClosed,

    #[error("Remote request timeout after {0:?}")]
    RequestTimeout(Duration),

    #[error("Invalid function [{action}]")]
    InvalidFunction { action: String },

    #[error("Connection to {group}#{id} failed after {attempts} attempts")]
    InitFail {
        group: String,
        id: String,
        attempts: u32,
    },

    /// The peer answered a correlated request with an `"error"` reply.
    #[error("Remote error: {payload}")]
    Remote { payload: serde_json::Value },

    // Session token errors
    #[error("Session token was not created from a complete descriptor")]
    NoCreate,

    #[error("Mesh context is no longer available")]
    Detached,

    // Storage errors
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Transport / encoding errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for MeshError {
    fn from(err: rusqlite::Error) -> Self {
        MeshError::Storage {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MeshError {
    /// Shorthand for [`MeshError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        MeshError::InvalidParams {
            message: message.into(),
        }
    }

    /// Stable code carried in `"error"` replies and close payloads.
    pub fn wire_code(&self) -> &'static str {
        match self {
            MeshError::InvalidParams { .. } => "invalid_params",
            MeshError::InvalidStorageModule { .. } => "invalid_storage_params",
            MeshError::SocketClosed => "socket_closed",
            MeshError::RequestTimeout(_) => "remote_request_timeout",
            MeshError::InvalidFunction { .. } => "invalid_function",
            MeshError::InitFail { .. } => "init_fail",
            MeshError::Remote { .. } => "remote_error",
            MeshError::NoCreate => "no_create",
            MeshError::Detached => "detached",
            MeshError::Storage { .. } => "storage_error",
            MeshError::Io { .. } => "io_error",
            MeshError::Json { .. } => "invalid_request",
            MeshError::Codec { .. } => "invalid_request",
            MeshError::Other(_) => "internal_error",
        }
    }

    /// Payload sent back to the caller of a correlated request that failed.
    pub fn to_reply_payload(&self) -> serde_json::Value {
        match self {
            // Pass the peer's own payload through untouched on a second hop.
            MeshError::Remote { payload } => payload.clone(),
            other => serde_json::json!({
                "errCode": other.wire_code(),
                "errMsg": other.to_string(),
            }),
        }
    }

    /// Check if this error comes from the transport and may clear on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Io { .. } | MeshError::SocketClosed | MeshError::InitFail { .. }
        )
    }
}
