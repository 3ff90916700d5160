//! WolfLink Error Types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for WolfLink operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfLink error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Handshake errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("No authentication response within {0:?}")]
    Timeout(Duration),

    #[error("Authentication rejected by server")]
    AuthenticationRejected,

    #[error("Failed to apply tunnel network settings: {0}")]
    NetworkSettings(String),

    // Per-datagram errors
    #[error("Datagram is empty")]
    NotEnoughData,

    #[error("Invalid packet code: {0:#04x}")]
    InvalidCode(u8),

    #[error("Malformed packet body: {0}")]
    MalformedBody(#[from] serde_json::Error),

    #[error("Authenticated decryption failed")]
    CryptoFailure,

    // Session errors
    #[error("Session already started")]
    AlreadyStarted,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a start attempt ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ConnectionFailed,
    Timeout,
    AuthenticationRejected,
    NetworkSettings,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureReason::ConnectionFailed => "connection failed",
            FailureReason::Timeout => "timeout",
            FailureReason::AuthenticationRejected => "authentication rejected",
            FailureReason::NetworkSettings => "network settings",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Errors scoped to a single datagram: logged and dropped, never surfaced
    pub fn is_datagram_error(&self) -> bool {
        matches!(
            self,
            Error::NotEnoughData
                | Error::InvalidCode(_)
                | Error::MalformedBody(_)
                | Error::CryptoFailure
        )
    }

    /// Check if calling `start` again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::Timeout(_)
        )
    }

    /// The terminal session state this error corresponds to, if any
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Error::ConnectionFailed { .. } => Some(FailureReason::ConnectionFailed),
            Error::Timeout(_) => Some(FailureReason::Timeout),
            Error::AuthenticationRejected => Some(FailureReason::AuthenticationRejected),
            Error::NetworkSettings(_) => Some(FailureReason::NetworkSettings),
            _ => None,
        }
    }
}
