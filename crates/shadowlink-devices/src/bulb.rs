//! Dimmable light bulb with brightness and color temperature.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use shadowlink_core::StateMap;

use crate::capability::{
    ActionOutcome, ApplyReport, DeviceCapability, as_int, required_int, to_state_map,
};
use crate::error::{DeviceError, Result};
use crate::persist::StateFile;

pub const MAX_BRIGHTNESS: i64 = 100;
pub const MIN_COLOR_TEMP: i64 = 2500;
pub const MAX_COLOR_TEMP: i64 = 6500;

const ACTIONS: &[&str] = &[
    "turn_on",
    "turn_off",
    "get_status",
    "set_brightness",
    "set_color_temp",
];

/// Observable bulb state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulbState {
    pub is_on: bool,
    /// Brightness percentage (0-100)
    pub brightness: u8,
    /// Color temperature in Kelvin
    pub color_temp: u16,
    /// Time of the last actual change
    pub last_updated: DateTime<Utc>,
}

impl Default for BulbState {
    fn default() -> Self {
        Self {
            is_on: false,
            brightness: 100,
            color_temp: 2700,
            last_updated: Utc::now(),
        }
    }
}

impl BulbState {
    fn sanitized(mut self) -> Self {
        self.brightness = self.brightness.min(MAX_BRIGHTNESS as u8);
        self.color_temp = self
            .color_temp
            .clamp(MIN_COLOR_TEMP as u16, MAX_COLOR_TEMP as u16);
        self
    }
}

/// A dimmable bulb whose state lives in memory, optionally mirrored to a file.
pub struct DimmableBulb {
    id: String,
    state: Mutex<BulbState>,
    state_file: Option<StateFile>,
}

impl DimmableBulb {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_state(id, BulbState::default())
    }

    pub fn with_state(id: impl Into<String>, state: BulbState) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(state),
            state_file: None,
        }
    }

    /// Create a bulb that restores from and persists to `path`.
    pub async fn with_state_file(id: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let file = StateFile::new(path.as_ref());
        let state = file
            .load::<BulbState>()
            .await
            .map(BulbState::sanitized)
            .unwrap_or_default();
        let id = id.into();
        info!(device_id = %id, "Bulb initialized: {:?}", state);

        Self {
            id,
            state: Mutex::new(state),
            state_file: Some(file),
        }
    }

    /// Current state.
    pub fn state(&self) -> BulbState {
        self.state.lock().clone()
    }

    /// Mutate state under the lock; persist afterwards if anything changed.
    async fn update<F>(&self, f: F) -> BulbState
    where
        F: FnOnce(&mut BulbState) -> bool,
    {
        let (snapshot, changed) = {
            let mut state = self.state.lock();
            let changed = f(&mut state);
            if changed {
                state.last_updated = Utc::now();
            }
            (state.clone(), changed)
        };

        if changed {
            if let Some(file) = &self.state_file {
                file.save(&snapshot).await;
            }
        }
        snapshot
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

fn check_brightness(value: i64) -> Result<u8> {
    if (0..=MAX_BRIGHTNESS).contains(&value) {
        Ok(value as u8)
    } else {
        Err(DeviceError::InvalidParameter(format!(
            "Brightness must be 0-{}, got {}",
            MAX_BRIGHTNESS, value
        )))
    }
}

fn check_color_temp(value: i64) -> Result<u16> {
    if (MIN_COLOR_TEMP..=MAX_COLOR_TEMP).contains(&value) {
        Ok(value as u16)
    } else {
        Err(DeviceError::InvalidParameter(format!(
            "Color temperature must be {}-{} K, got {}",
            MIN_COLOR_TEMP, MAX_COLOR_TEMP, value
        )))
    }
}

fn desired_int<T>(
    desired: &StateMap,
    field: &str,
    check: fn(i64) -> Result<T>,
    report: &mut ApplyReport,
) -> Option<T> {
    let value = desired.get(field)?;
    let parsed = as_int(value)
        .ok_or_else(|| DeviceError::InvalidParameter(format!("{} must be an integer", field)))
        .and_then(check);
    match parsed {
        Ok(v) => Some(v),
        Err(e) => {
            report.reject(field, e.to_string());
            None
        }
    }
}

#[async_trait]
impl DeviceCapability for DimmableBulb {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn device_type(&self) -> &'static str {
        "bulb"
    }

    fn supported_actions(&self) -> &'static [&'static str] {
        ACTIONS
    }

    async fn execute(&self, action: &str, parameters: &StateMap) -> Result<ActionOutcome> {
        match action {
            "turn_on" => {
                info!(device_id = %self.id, "Turning bulb ON");
                let state = self.update(|s| replace(&mut s.is_on, true)).await;
                Ok(ActionOutcome::ok("Bulb turned on", to_state_map(&state)))
            }
            "turn_off" => {
                info!(device_id = %self.id, "Turning bulb OFF");
                let state = self.update(|s| replace(&mut s.is_on, false)).await;
                Ok(ActionOutcome::ok("Bulb turned off", to_state_map(&state)))
            }
            "get_status" => Ok(ActionOutcome::ok("Status retrieved", self.shadow_state())),
            "set_brightness" => {
                let brightness = check_brightness(required_int(parameters, "brightness")?)?;
                info!(device_id = %self.id, "Setting brightness to {}", brightness);
                let state = self
                    .update(|s| replace(&mut s.brightness, brightness))
                    .await;
                Ok(ActionOutcome::ok(
                    format!("Brightness set to {}", brightness),
                    to_state_map(&state),
                ))
            }
            "set_color_temp" => {
                let color_temp = check_color_temp(required_int(parameters, "color_temp")?)?;
                info!(device_id = %self.id, "Setting color temperature to {} K", color_temp);
                let state = self
                    .update(|s| replace(&mut s.color_temp, color_temp))
                    .await;
                Ok(ActionOutcome::ok(
                    format!("Color temperature set to {} K", color_temp),
                    to_state_map(&state),
                ))
            }
            other => Err(DeviceError::UnsupportedAction(other.to_string())),
        }
    }

    async fn apply_desired_state(&self, desired: &StateMap) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        let is_on = match desired.get("is_on") {
            Some(Value::Bool(on)) => Some(*on),
            Some(other) => {
                report.reject("is_on", format!("is_on must be a boolean, got {}", other));
                None
            }
            None => None,
        };
        let brightness = desired_int(desired, "brightness", check_brightness, &mut report);
        let color_temp = desired_int(desired, "color_temp", check_color_temp, &mut report);

        let mut changed = false;
        self.update(|s| {
            if let Some(on) = is_on {
                changed |= replace(&mut s.is_on, on);
            }
            if let Some(b) = brightness {
                changed |= replace(&mut s.brightness, b);
            }
            if let Some(t) = color_temp {
                changed |= replace(&mut s.color_temp, t);
            }
            changed
        })
        .await;

        report.changed = changed;
        Ok(report)
    }

    fn shadow_state(&self) -> StateMap {
        to_state_map(&*self.state.lock())
    }
}
