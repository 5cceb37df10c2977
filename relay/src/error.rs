//! Error types for the relay.

use std::path::PathBuf;

use thiserror::Error;

/// Inbound data that does not match the `[event, data]` contract.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("malformed nested message: {0}")]
    MalformedNestedMessage(String),
}

/// Errors raised while launching or tearing down the host process.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("host binary not found: {0}")]
    BinaryNotFound(PathBuf),

    #[error("profile directory not found: {0}")]
    ProfileNotFound(PathBuf),

    #[error("failed to copy profile: {0}")]
    ProfileCopy(String),

    #[error("failed to spawn host process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("host process exited before becoming ready (status: {0})")]
    ExitedEarly(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Transport-level failures of the WebSocket server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
