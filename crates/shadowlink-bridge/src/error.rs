//! Bridge error types.

use shadowlink_devices::DeviceError;

use crate::transport::TransportError;

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Publish attempted while the session is not `Connected`
    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Core(#[from] shadowlink_core::Error),

    /// The bridge is shutting down and no longer accepts work
    #[error("Bridge is shutting down")]
    ShuttingDown,

    /// The bridge task panicked or was cancelled
    #[error("Bridge task failed: {0}")]
    Task(String),
}

impl BridgeError {
    /// Errors that only mean "the message could not go out right now".
    ///
    /// Anything else (a rejected topic, an oversized payload) fails the same
    /// way on every retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Transport(TransportError::Closed)
        )
    }
}
