//! Error types for ledger-session

use thiserror::Error;

/// Errors that can occur while managing a session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Login cancelled, errored, refused, or resolved to the anonymous identity
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Identity provider not installed or not reachable
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Another connect attempt is still in flight
    #[error("A connection attempt is already in progress")]
    InProgress,

    /// A later transition replaced this one before it could commit
    #[error("Connection attempt superseded by a later transition")]
    Superseded,

    /// Operation requires a connected session
    #[error("No connected session")]
    NotConnected,

    /// Remote service proxy failure
    #[error("Service '{service}' failed: {reason}")]
    Service {
        service: String,
        reason: String,
    },

    /// Persistent key-value store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file parse failure
    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SessionError {
    /// Build a service error from a proxy name and any displayable reason
    pub fn service(service: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Service {
            service: service.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
