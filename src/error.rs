//! DewiCom Error Types

use thiserror::Error;

/// Result type alias for DewiCom operations
pub type Result<T> = std::result::Result<T, Error>;

/// DewiCom error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    // Wire errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Resource acquisition failures that abort a component's startup.
    ///
    /// The host decides whether to retry these; everything else is handled
    /// locally by the component that produced it.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(self, Error::Bind { .. } | Error::Io(_))
    }

    /// Build a bind error from an address and the underlying cause
    pub fn bind(address: impl ToString, reason: impl std::fmt::Display) -> Self {
        Error::Bind {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}
