//! Device error taxonomy.

/// Result alias for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors raised by the registry and by device implementations.
///
/// The bridge turns every one of these into a failed response; none of them
/// is fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// No device is registered under this id
    #[error("Unknown device: {0}")]
    UnknownDeviceId(String),

    /// A device is already registered under this id
    #[error("Device already registered: {0}")]
    DuplicateDeviceId(String),

    /// The device does not support the requested action
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    /// A parameter is missing or outside the device's accepted domain
    #[error("{0}")]
    InvalidParameter(String),

    /// The device failed internally (e.g. hardware unreachable)
    #[error("Device execution failed: {0}")]
    ExecutionFailure(String),
}

impl DeviceError {
    /// Missing required parameter.
    pub fn missing_param(name: &str) -> Self {
        Self::InvalidParameter(format!("{} parameter required", name))
    }
}
