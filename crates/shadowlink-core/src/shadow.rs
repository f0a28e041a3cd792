//! Shadow document types.
//!
//! The bridge owns the `reported` side of the aggregate shadow:
//!
//! ```text
//! { "state": { "reported": { "bridge_connected": true,
//!                            "devices": { "bulb-1": { ... } } } } }
//! ```
//!
//! The remote caller owns `desired`. Desired deltas arrive either scoped to
//! the aggregate (`{"devices": {"bulb-1": {...}}}`) or as a bare patch for a
//! single device; both shapes may be wrapped in `{"state": ..., "version": N}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::envelope::StateMap;
use crate::error::{Error, Result};

/// Key of the bridge connectivity flag in the reported document.
pub const BRIDGE_CONNECTED: &str = "bridge_connected";
/// Key of the per-device map in the reported and desired documents.
pub const DEVICES: &str = "devices";

/// Aggregate reported state for all registered devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedState {
    pub bridge_connected: bool,
    pub devices: BTreeMap<String, StateMap>,
}

impl ReportedState {
    pub fn new(bridge_connected: bool) -> Self {
        Self {
            bridge_connected,
            devices: BTreeMap::new(),
        }
    }

    /// Wrap into the shadow update document.
    pub fn to_update_document(&self) -> Value {
        json!({ "state": { "reported": self } })
    }

    /// Encode the shadow update document as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_update_document())?)
    }

    /// State of a single device, if present.
    pub fn device(&self, device_id: &str) -> Option<&StateMap> {
        self.devices.get(device_id)
    }
}

/// Desired and reported state of one device as held in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowDocument {
    pub desired: StateMap,
    pub reported: StateMap,
}

/// Desired fields addressed to one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePatch {
    pub device_id: String,
    pub fields: StateMap,
}

/// A decoded desired delta, split per device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredDelta {
    /// Shadow version carried by the delta event, if any
    pub version: Option<u64>,
    pub patches: Vec<DevicePatch>,
}

impl DesiredDelta {
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Decode a desired-delta payload.
///
/// A patch without a `devices` map is addressed to `default_device`.
pub fn parse_desired_delta(payload: &[u8], default_device: &str) -> Result<DesiredDelta> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| Error::MalformedMessage(e.to_string()))?;
    let Value::Object(mut outer) = value else {
        return Err(Error::MalformedMessage(
            "desired delta must be a JSON object".to_string(),
        ));
    };

    let version = outer.get("version").and_then(Value::as_u64);
    let body = match outer.remove("state") {
        Some(Value::Object(inner)) => inner,
        Some(_) => {
            return Err(Error::MalformedMessage(
                "desired delta 'state' must be a JSON object".to_string(),
            ));
        }
        None => outer,
    };

    let mut patches = Vec::new();
    match body.get(DEVICES) {
        Some(Value::Object(devices)) => {
            for (device_id, fields) in devices {
                match fields {
                    Value::Object(fields) if !fields.is_empty() => patches.push(DevicePatch {
                        device_id: device_id.clone(),
                        fields: fields.clone(),
                    }),
                    Value::Object(_) => {}
                    other => warn!(
                        device_id = %device_id,
                        "Ignoring non-object desired patch: {}",
                        other
                    ),
                }
            }
        }
        Some(_) => {
            return Err(Error::MalformedMessage(
                "desired delta 'devices' must be a JSON object".to_string(),
            ));
        }
        None if !body.is_empty() => patches.push(DevicePatch {
            device_id: default_device.to_string(),
            fields: body,
        }),
        None => {}
    }

    Ok(DesiredDelta { version, patches })
}
