//! Device capability contract, registry and built-in device classes.
//!
//! Every controllable device implements [`DeviceCapability`]. The bridge never
//! branches on device type; it looks devices up in the [`DeviceRegistry`] and
//! calls the same four operations on all of them.
//!
//! ## Built-in classes
//!
//! | Kind | Type | Actions |
//! |------|------|---------|
//! | `bulb` | [`DimmableBulb`] | `turn_on`, `turn_off`, `get_status`, `set_brightness`, `set_color_temp` |
//! | `switch` | [`OnOffSwitch`] | `turn_on`, `turn_off`, `toggle`, `get_status` |

pub mod bulb;
pub mod capability;
pub mod error;
pub mod persist;
pub mod registry;
pub mod switch;

pub use bulb::{BulbState, DimmableBulb};
pub use capability::{ActionOutcome, ApplyReport, DeviceCapability, to_state_map};
pub use error::{DeviceError, Result};
pub use registry::DeviceRegistry;
pub use switch::{OnOffSwitch, SwitchState};

use std::sync::Arc;

use shadowlink_core::{DeviceKind, DeviceSpec};

/// Construct a device from its configuration entry.
pub async fn build_device(spec: &DeviceSpec) -> Arc<dyn DeviceCapability> {
    match spec.kind {
        DeviceKind::Bulb => match &spec.state_file {
            Some(path) => Arc::new(DimmableBulb::with_state_file(&spec.id, path).await),
            None => Arc::new(DimmableBulb::new(&spec.id)),
        },
        DeviceKind::Switch => match &spec.state_file {
            Some(path) => Arc::new(OnOffSwitch::with_state_file(&spec.id, path).await),
            None => Arc::new(OnOffSwitch::new(&spec.id)),
        },
    }
}
