//! Error type for the core crate.

use std::path::PathBuf;

/// Result alias used throughout `shadowlink-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while decoding wire messages or loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration is missing or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file does not exist
    #[error("Config file not found at {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// Topic does not follow the expected layout
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Payload could not be decoded into the expected message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
