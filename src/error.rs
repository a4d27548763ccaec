//! ChatMesh Error Types

use thiserror::Error;

/// Result type alias for ChatMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// ChatMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Request validation errors (surfaced to clients)
    #[error("Already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Node is still synchronizing with the cluster")]
    NotReady,

    // Coordination errors (internal only)
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Stale coordinator announcement from rank {announced}, rank {known} is active")]
    StaleCoordinator { announced: u64, known: u64 },

    #[error("Registry error: {0}")]
    Registry(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Unreachable(_)
                | Error::NotReady
        )
    }

    /// Check if this error belongs in a client response rather than the log
    pub fn is_client_facing(&self) -> bool {
        matches!(
            self,
            Error::DuplicateRegistration(_)
                | Error::NotFound(_)
                | Error::InvalidRequest(_)
                | Error::UnknownService(_)
                | Error::NotReady
        )
    }

    /// Stable machine-readable code used in client error payloads
    pub fn code(&self) -> &'static str {
        match self {
            Error::DuplicateRegistration(_) => "duplicate_registration",
            Error::NotFound(_) => "not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::UnknownService(_) => "unknown_service",
            Error::NotReady => "not_ready",
            Error::Unreachable(_) => "unreachable",
            Error::StaleCoordinator { .. } => "stale_coordinator",
            Error::ShuttingDown => "shutting_down",
            _ => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_facing_split() {
        assert!(Error::DuplicateRegistration("alice".into()).is_client_facing());
        assert!(Error::NotFound("general".into()).is_client_facing());
        assert!(!Error::Unreachable("node-3".into()).is_client_facing());
        assert!(!Error::StaleCoordinator { announced: 1, known: 3 }.is_client_facing());
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::NotFound("x".into()).code(), "not_found");
        assert_eq!(Error::Internal("x".into()).code(), "internal");
        assert!(Error::ConnectionTimeout("a".into()).is_retryable());
    }
}
