//! Error types for the inventory engine

use thiserror::Error;

/// Failure to decode a connection string.
///
/// Never escapes [`LinkCodec::decode`](crate::proxy::LinkCodec::decode); it is
/// turned into a placeholder record there.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Base64 decode failed")]
    Base64,

    #[error("Invalid vmess payload: {0}")]
    VmessJson(#[from] serde_json::Error),

    #[error("Invalid URI: {0}")]
    Uri(String),

    #[error("Missing host")]
    MissingHost,

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Failure reported by a [`Prober`](crate::proxy::Prober).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Address resolution failed: {0}")]
    Resolve(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("A test run is already in progress")]
    AlreadyRunning,

    #[error("Test run ended abnormally: {0}")]
    Interrupted(String),
}
