//! The capability contract every device implements.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use shadowlink_core::StateMap;

use crate::error::{DeviceError, Result};

/// Result of a successfully dispatched action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    /// Device state snapshot after the action
    pub state: StateMap,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>, state: StateMap) -> Self {
        Self {
            success: true,
            message: message.into(),
            state,
        }
    }
}

/// What happened when a desired patch was applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Whether any recognized field changed the device state
    pub changed: bool,
    /// Recognized fields whose values were rejected, with the reason
    pub rejected: Vec<(String, String)>,
}

impl ApplyReport {
    pub fn reject(&mut self, field: &str, reason: impl Into<String>) {
        self.rejected.push((field.to_string(), reason.into()));
    }
}

/// Polymorphic device interface.
///
/// Implementations keep their state behind their own lock so that
/// [`shadow_state`](Self::shadow_state) never observes a half-applied change.
/// Concurrent `execute` calls on the same device are not required to be safe;
/// the bridge serializes them per device.
#[async_trait]
pub trait DeviceCapability: Send + Sync {
    /// Stable device identifier.
    fn device_id(&self) -> &str;

    /// Short class name, e.g. `"bulb"`.
    fn device_type(&self) -> &'static str;

    /// Actions accepted by [`execute`](Self::execute). Fixed for the session.
    fn supported_actions(&self) -> &'static [&'static str];

    fn supports(&self, action: &str) -> bool {
        self.supported_actions().contains(&action)
    }

    /// Perform a named action.
    ///
    /// Returns `UnsupportedAction` for unknown actions and `InvalidParameter`
    /// for out-of-domain values; the state is left untouched in both cases.
    async fn execute(&self, action: &str, parameters: &StateMap) -> Result<ActionOutcome>;

    /// Apply the recognized fields of a desired patch. Unknown fields are ignored.
    async fn apply_desired_state(&self, desired: &StateMap) -> Result<ApplyReport>;

    /// Full current state, as published in the reported shadow.
    fn shadow_state(&self) -> StateMap;
}

/// Serialize a state struct into a field map.
pub fn to_state_map<T: Serialize>(state: &T) -> StateMap {
    match serde_json::to_value(state) {
        Ok(Value::Object(map)) => map,
        _ => StateMap::new(),
    }
}

/// Read a required integer parameter.
pub fn required_int(parameters: &StateMap, name: &str) -> Result<i64> {
    match parameters.get(name) {
        None | Some(Value::Null) => Err(DeviceError::missing_param(name)),
        Some(value) => as_int(value).ok_or_else(|| {
            DeviceError::InvalidParameter(format!("{} must be an integer, got {}", name, value))
        }),
    }
}

/// Integer view of a JSON value; whole floats such as `50.0` are accepted.
pub fn as_int(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}
