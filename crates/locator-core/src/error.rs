//! Error types for the location registry.
//!
//! Registration conflicts and malformed input surface immediately to the caller.
//! Replication problems never fail a client call; they are logged and reported
//! through the health signal instead.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::models::Location;

/// Main error type for the location registry.
#[derive(Debug, Error)]
pub enum LocationError {
    // Registry errors
    #[error("Connection {connection} is already registered with a different location")]
    AlreadyRegistered {
        connection: String,
        existing: Box<Location>,
    },

    #[error("Invalid connection: {message}")]
    InvalidConnection { message: String },

    #[error("Malformed registry entry: {message}")]
    MalformedEntry { message: String },

    #[error("Resolving {connection} timed out after {timeout:?}")]
    ResolutionTimeout { connection: String, timeout: Duration },

    // Cluster errors
    #[error("Cluster membership unavailable: {message}")]
    MembershipUnavailable { message: String },

    #[error("Peer at {addr} is unreachable")]
    PeerUnreachable { addr: SocketAddr },

    // IO and serialization errors
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

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Location service has been shut down")]
    ServiceStopped,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, LocationError>;

impl From<std::io::Error> for LocationError {
    fn from(err: std::io::Error) -> Self {
        LocationError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LocationError {
    fn from(err: serde_json::Error) -> Self {
        LocationError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl LocationError {
    pub(crate) fn invalid_connection(message: impl Into<String>) -> Self {
        LocationError::InvalidConnection {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        LocationError::MalformedEntry {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Network/connectivity error
    /// - -32001: Already registered
    /// - -32002: Resolution timeout
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            LocationError::MembershipUnavailable { .. } | LocationError::PeerUnreachable { .. } => {
                -32000
            }

            LocationError::AlreadyRegistered { .. } => -32001,

            LocationError::ResolutionTimeout { .. } => -32002,

            LocationError::InvalidConnection { .. }
            | LocationError::MalformedEntry { .. }
            | LocationError::Validation { .. } => -32005,

            LocationError::InvalidParams { .. } => -32602,

            _ => -32603,
        }
    }

    /// Check if this error is a transient transport failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LocationError::MembershipUnavailable { .. }
                | LocationError::PeerUnreachable { .. }
                | LocationError::Io { .. }
        )
    }
}
