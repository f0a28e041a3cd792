//! On/off switch (smart plug, relay).

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shadowlink_core::StateMap;

use crate::capability::{ActionOutcome, ApplyReport, DeviceCapability, to_state_map};
use crate::error::{DeviceError, Result};
use crate::persist::StateFile;

const ACTIONS: &[&str] = &["turn_on", "turn_off", "toggle", "get_status"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchState {
    pub is_on: bool,
}

pub struct OnOffSwitch {
    id: String,
    state: Mutex<SwitchState>,
    state_file: Option<StateFile>,
}

impl OnOffSwitch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(SwitchState::default()),
            state_file: None,
        }
    }

    pub async fn with_state_file(id: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let file = StateFile::new(path.as_ref());
        let state = file.load::<SwitchState>().await.unwrap_or_default();
        Self {
            id: id.into(),
            state: Mutex::new(state),
            state_file: Some(file),
        }
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().is_on
    }

    async fn set(&self, on: impl FnOnce(bool) -> bool) -> SwitchState {
        let (snapshot, changed) = {
            let mut state = self.state.lock();
            let next = on(state.is_on);
            let changed = state.is_on != next;
            state.is_on = next;
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

#[async_trait]
impl DeviceCapability for OnOffSwitch {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn device_type(&self) -> &'static str {
        "switch"
    }

    fn supported_actions(&self) -> &'static [&'static str] {
        ACTIONS
    }

    async fn execute(&self, action: &str, _parameters: &StateMap) -> Result<ActionOutcome> {
        let (state, message) = match action {
            "turn_on" => (self.set(|_| true).await, "Switch turned on"),
            "turn_off" => (self.set(|_| false).await, "Switch turned off"),
            "toggle" => {
                let state = self.set(|on| !on).await;
                let message = if state.is_on {
                    "Switch toggled on"
                } else {
                    "Switch toggled off"
                };
                (state, message)
            }
            "get_status" => {
                let state = self.state.lock().clone();
                (state, "Status retrieved")
            }
            other => return Err(DeviceError::UnsupportedAction(other.to_string())),
        };
        Ok(ActionOutcome::ok(message, to_state_map(&state)))
    }

    async fn apply_desired_state(&self, desired: &StateMap) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        match desired.get("is_on") {
            Some(Value::Bool(on)) => {
                let on = *on;
                let before = self.is_on();
                report.changed = self.set(|_| on).await.is_on != before;
            }
            Some(other) => report.reject("is_on", format!("is_on must be a boolean, got {}", other)),
            None => {}
        }
        Ok(report)
    }

    fn shadow_state(&self) -> StateMap {
        to_state_map(&*self.state.lock())
    }
}
