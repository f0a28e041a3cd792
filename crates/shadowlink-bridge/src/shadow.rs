//! Shadow Store: translates device state to and from the shadow document.
//!
//! Every publish carries the entire reported document. Desired deltas are
//! merged into an in-memory desired cache and applied to the device; deltas
//! for unregistered devices are dropped. A delta that changes device state is
//! recorded like a command, under the action [`DESIRED_DELTA_ACTION`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use shadowlink_core::{
    DesiredDelta, ReportedState, ShadowDocument, StateMap, TopicLayout, parse_desired_delta,
};
use shadowlink_devices::{ApplyReport, DeviceError, DeviceRegistry};

use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::recorder::StateRecorder;

/// Action name recorded for state changes made by a desired delta.
pub const DESIRED_DELTA_ACTION: &str = "desired_delta";

pub struct ShadowStore {
    registry: Arc<DeviceRegistry>,
    connection: Arc<ConnectionManager>,
    update_topic: String,
    default_device_id: String,
    online: AtomicBool,
    desired: DashMap<String, StateMap>,
    last_reported: Mutex<BTreeMap<String, StateMap>>,
    last_delta_version: Mutex<Option<u64>>,
    recorder: StateRecorder,
}

impl ShadowStore {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        connection: Arc<ConnectionManager>,
        layout: &TopicLayout,
        default_device_id: impl Into<String>,
        recorder: StateRecorder,
    ) -> Self {
        Self {
            registry,
            connection,
            update_topic: layout.shadow_update_topic(),
            default_device_id: default_device_id.into(),
            online: AtomicBool::new(false),
            desired: DashMap::new(),
            last_reported: Mutex::new(BTreeMap::new()),
            last_delta_version: Mutex::new(None),
            recorder,
        }
    }

    /// Value reported as `bridge_connected`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Snapshot every registered device.
    pub async fn build_reported(&self) -> ReportedState {
        let mut reported = ReportedState::new(self.is_online());
        for (device_id, device) in self.registry.devices().await {
            reported.devices.insert(device_id, device.shadow_state());
        }
        reported
    }

    /// Publish the full reported document.
    ///
    /// `NotConnected` is not an error here: the next cold-start resync repairs it.
    pub async fn sync(&self) {
        let reported = self.build_reported().await;
        let payload = match reported.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode reported shadow: {}", e);
                return;
            }
        };

        match self.connection.publish(&self.update_topic, payload).await {
            Ok(()) => {
                debug!(devices = reported.devices.len(), "Published reported shadow");
                self.remember(reported);
            }
            Err(BridgeError::NotConnected) => {
                debug!("Reported shadow not published, waiting for reconnect");
            }
            Err(e) => warn!("Failed to publish reported shadow: {}", e),
        }
    }

    /// Cold-start resync while the session is being established.
    pub async fn resync_during_handshake(&self) -> Result<()> {
        let reported = self.build_reported().await;
        self.connection
            .publish_during_handshake(&self.update_topic, reported.encode()?)
            .await?;
        info!(devices = reported.devices.len(), "Published full reported shadow");
        self.remember(reported);
        Ok(())
    }

    fn remember(&self, reported: ReportedState) {
        *self.last_reported.lock() = reported.devices;
    }

    /// Decode a delta payload; the shadow version is kept for diagnostics.
    pub fn parse_delta(&self, payload: &[u8]) -> Result<DesiredDelta> {
        let delta = parse_desired_delta(payload, &self.default_device_id)?;
        if let Some(version) = delta.version {
            *self.last_delta_version.lock() = Some(version);
        }
        Ok(delta)
    }

    pub fn last_delta_version(&self) -> Option<u64> {
        *self.last_delta_version.lock()
    }

    /// Apply a desired patch to one device.
    ///
    /// Returns `None` if the device is not registered; the patch is dropped.
    pub async fn accept_desired_delta(
        &self,
        device_id: &str,
        delta: &StateMap,
    ) -> Result<Option<ApplyReport>> {
        let device = match self.registry.get(device_id).await {
            Ok(device) => device,
            Err(DeviceError::UnknownDeviceId(_)) => {
                warn!(device_id = %device_id, "Dropping desired delta for unknown device");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.desired
            .entry(device_id.to_string())
            .or_default()
            .extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));

        let report = device.apply_desired_state(delta).await?;
        for (field, reason) in &report.rejected {
            warn!(device_id = %device_id, field = %field, "Rejected desired value: {}", reason);
        }
        if report.changed {
            info!(device_id = %device_id, "Applied desired state");
            self.recorder
                .record(device_id, DESIRED_DELTA_ACTION, device.shadow_state());
        }
        Ok(Some(report))
    }

    /// Desired and last published reported state of one device.
    pub fn document(&self, device_id: &str) -> Option<ShadowDocument> {
        let desired = self.desired.get(device_id).map(|d| d.value().clone());
        let reported = self.last_reported.lock().get(device_id).cloned();
        if desired.is_none() && reported.is_none() {
            return None;
        }
        Some(ShadowDocument {
            desired: desired.unwrap_or_default(),
            reported: reported.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use shadowlink_core::ReconnectConfig;
    use shadowlink_devices::DimmableBulb;

    async fn store() -> (MemoryTransport, Arc<ConnectionManager>, ShadowStore) {
        let transport = MemoryTransport::new();
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(transport.clone()),
            &ReconnectConfig::default(),
        ));
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(Arc::new(DimmableBulb::new("bulb-1")))
            .await
            .unwrap();
        let layout = TopicLayout::for_thing("smarthome", "bridge");
        let store = ShadowStore::new(
            registry,
            Arc::clone(&connection),
            &layout,
            "bulb-1",
            StateRecorder::disabled(),
        );
        (transport, connection, store)
    }

    fn fields(value: serde_json::Value) -> StateMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_build_reported() {
        let (_, _, store) = store().await;
        store.set_online(true);

        let reported = store.build_reported().await;
        assert!(reported.bridge_connected);
        assert_eq!(reported.devices["bulb-1"]["is_on"], false);
        assert_eq!(reported.devices.len(), 1);
    }

    #[tokio::test]
    async fn test_accept_delta_and_document() {
        let (transport, connection, store) = store().await;
        let _events = connection.connect().await.unwrap();
        connection.mark_connected();

        let report = store
            .accept_desired_delta("bulb-1", &fields(json!({"is_on": true})))
            .await
            .unwrap()
            .unwrap();
        assert!(report.changed);
        store.sync().await;

        let doc = store.document("bulb-1").unwrap();
        assert_eq!(doc.desired["is_on"], true);
        assert_eq!(doc.reported["is_on"], true);

        let published = transport.published_on("$aws/things/bridge/shadow/update");
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].json()["state"]["reported"]["devices"]["bulb-1"]["is_on"],
            true
        );
    }

    #[tokio::test]
    async fn test_unknown_device_delta_dropped() {
        let (_, _, store) = store().await;
        let result = store
            .accept_desired_delta("bulb-99", &fields(json!({"is_on": true})))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(store.document("bulb-99").is_none());
    }

    #[tokio::test]
    async fn test_sync_while_disconnected_is_not_fatal() {
        let (transport, _, store) = store().await;
        store.sync().await;
        assert!(transport.published().is_empty());
        assert!(store.document("bulb-1").is_none());
    }

    #[tokio::test]
    async fn test_parse_delta_tracks_version() {
        let (_, _, store) = store().await;
        let delta = store
            .parse_delta(br#"{"version":7,"state":{"brightness":20}}"#)
            .unwrap();
        assert_eq!(delta.patches[0].device_id, "bulb-1");
        assert_eq!(store.last_delta_version(), Some(7));
    }
}
