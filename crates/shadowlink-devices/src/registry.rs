//! Device registry.
//!
//! Maps device ids to device instances. Registration never overwrites: a
//! second `register` for the same id fails with `DuplicateDeviceId`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::capability::DeviceCapability;
use crate::error::{DeviceError, Result};

/// Thread-safe device id -> device mapping.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<dyn DeviceCapability>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its own id.
    pub async fn register(&self, device: Arc<dyn DeviceCapability>) -> Result<()> {
        let id = device.device_id().to_string();
        self.register_as(id, device).await
    }

    /// Register a device under an explicit id.
    pub async fn register_as(
        &self,
        device_id: impl Into<String>,
        device: Arc<dyn DeviceCapability>,
    ) -> Result<()> {
        let device_id = device_id.into();
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device_id) {
            return Err(DeviceError::DuplicateDeviceId(device_id));
        }

        info!(
            device_id = %device_id,
            device_type = device.device_type(),
            "Registered device"
        );
        devices.insert(device_id, device);
        Ok(())
    }

    /// Remove a device, returning it if it was present.
    pub async fn unregister(&self, device_id: &str) -> Option<Arc<dyn DeviceCapability>> {
        let removed = self.devices.write().await.remove(device_id);
        if removed.is_some() {
            info!(device_id = %device_id, "Unregistered device");
        }
        removed
    }

    /// Look up a device.
    pub async fn get(&self, device_id: &str) -> Result<Arc<dyn DeviceCapability>> {
        self.devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownDeviceId(device_id.to_string()))
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    /// Registered ids, sorted.
    pub async fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of all registered devices, sorted by id.
    pub async fn devices(&self) -> Vec<(String, Arc<dyn DeviceCapability>)> {
        let mut devices: Vec<_> = self
            .devices
            .read()
            .await
            .iter()
            .map(|(id, device)| (id.clone(), Arc::clone(device)))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        devices
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}
