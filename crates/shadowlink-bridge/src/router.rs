//! Command Router: one pass per inbound command message.
//!
//! 1. Parse the topic; malformed topics are dropped.
//! 2. Decode the payload; malformed payloads get a failure response.
//! 3. Resolve the device; unknown ids get a failure response.
//! 4. Execute on the device's lane and respond with the outcome.
//! 5. Resync the reported shadow after every execution attempt.
//!
//! [`CommandRouter::route`] runs on the receive loop and never awaits a
//! publish; the early failure responses of steps 2 and 3 go out on their own
//! task.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use shadowlink_core::{
    CommandEnvelope, ResponseEnvelope, StateMap, TopicLayout, salvage_request_id,
};
use shadowlink_devices::DeviceRegistry;

use crate::connection::ConnectionManager;
use crate::lanes::DeviceLanes;
use crate::pending::PendingResponses;
use crate::recorder::StateRecorder;
use crate::shadow::ShadowStore;
use crate::transport::InboundMessage;

pub struct CommandRouter {
    layout: TopicLayout,
    registry: Arc<DeviceRegistry>,
    shadow: Arc<ShadowStore>,
    connection: Arc<ConnectionManager>,
    lanes: Arc<DeviceLanes>,
    pending: PendingResponses,
    recorder: StateRecorder,
}

impl CommandRouter {
    pub fn new(
        layout: TopicLayout,
        registry: Arc<DeviceRegistry>,
        shadow: Arc<ShadowStore>,
        connection: Arc<ConnectionManager>,
        lanes: Arc<DeviceLanes>,
        pending_capacity: usize,
        recorder: StateRecorder,
    ) -> Self {
        Self {
            layout,
            registry,
            shadow,
            connection,
            lanes,
            pending: PendingResponses::new(pending_capacity),
            recorder,
        }
    }

    /// Responses waiting for the connection to come back.
    pub fn pending_responses(&self) -> usize {
        self.pending.len()
    }

    pub fn recorder(&self) -> &StateRecorder {
        &self.recorder
    }

    /// Route one inbound command message.
    pub async fn route(self: &Arc<Self>, message: InboundMessage) {
        let target = match self.layout.parse_command_topic(&message.topic) {
            Ok(target) => target,
            Err(e) => {
                warn!("Dropping message: {}", e);
                return;
            }
        };
        let device_id = target.device_id;

        let envelope = match CommandEnvelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(device_id = %device_id, action = %target.action, "{}", e);
                let request_id = salvage_request_id(&message.payload);
                let response = ResponseEnvelope::failure(
                    request_id,
                    format!("Invalid command payload: {}", e),
                    StateMap::new(),
                );
                self.respond_detached(device_id, response);
                return;
            }
        };

        if !self.registry.contains(&device_id).await {
            warn!(device_id = %device_id, "Command for unknown device");
            let response = ResponseEnvelope::failure(
                envelope.request_id,
                format!("Unknown device: {}", device_id),
                StateMap::new(),
            );
            self.respond_detached(device_id, response);
            return;
        }

        debug!(
            device_id = %device_id,
            action = %target.action,
            request_id = %envelope.request_id,
            "Queueing command"
        );
        let router = Arc::clone(self);
        let lane_device = device_id.clone();
        let action = target.action;
        let job = Box::pin(async move {
            router.execute(&lane_device, &action, envelope).await;
        });
        if let Err(e) = self.lanes.submit(&device_id, job) {
            warn!(device_id = %device_id, "Command not executed: {}", e);
        }
    }

    /// Execute one command on its device. Runs on the device's lane.
    pub async fn execute(&self, device_id: &str, action: &str, envelope: CommandEnvelope) {
        let request_id = envelope.request_id;
        let device = match self.registry.get(device_id).await {
            Ok(device) => device,
            Err(e) => {
                let response = ResponseEnvelope::failure(request_id, e.to_string(), StateMap::new());
                self.respond(device_id, response).await;
                return;
            }
        };

        let before = device.shadow_state();
        let response = match device.execute(action, &envelope.parameters).await {
            Ok(outcome) => {
                info!(
                    device_id = %device_id,
                    action = %action,
                    success = outcome.success,
                    "{}",
                    outcome.message
                );
                if outcome.success && outcome.state != before {
                    self.recorder.record(device_id, action, outcome.state.clone());
                }
                ResponseEnvelope::new(request_id, outcome.success, outcome.message, outcome.state)
            }
            Err(e) => {
                warn!(device_id = %device_id, action = %action, "Command failed: {}", e);
                ResponseEnvelope::failure(request_id, e.to_string(), device.shadow_state())
            }
        };

        self.respond(device_id, response).await;
        self.shadow.sync().await;
    }

    fn respond_detached(self: &Arc<Self>, device_id: String, response: ResponseEnvelope) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            router.respond(&device_id, response).await;
        });
    }

    /// Publish a response, holding it for later if the connection is down.
    async fn respond(&self, device_id: &str, response: ResponseEnvelope) {
        let topic = self.layout.response_topic(device_id, &response.request_id);
        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode response for {}: {}", topic, e);
                return;
            }
        };

        match self.connection.publish(&topic, payload.clone()).await {
            Ok(()) => debug!(topic = %topic, success = response.success, "Published response"),
            Err(e) if e.is_transient() => {
                debug!(topic = %topic, "Holding response until reconnect: {}", e);
                self.pending.insert(topic, payload);
                // The connection may have come back while this response was being held
                if self.connection.is_connected() {
                    self.flush_pending().await;
                }
            }
            Err(e) => error!(topic = %topic, "Dropping response: {}", e),
        }
    }

    /// Publish every held response.
    ///
    /// Stops at the first transient failure and keeps the rest for the next
    /// session; a response the broker rejects outright is dropped.
    pub async fn flush_pending(&self) {
        let held = self.pending.take_all();
        if held.is_empty() {
            return;
        }
        info!(count = held.len(), "Flushing held responses");

        let mut remaining = held.into_iter();
        while let Some((topic, payload)) = remaining.next() {
            match self.connection.publish(&topic, payload.clone()).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    let rest: Vec<_> = remaining.collect();
                    for (topic, payload) in rest.into_iter().rev() {
                        self.pending.requeue_front(topic, payload);
                    }
                    self.pending.requeue_front(topic, payload);
                    return;
                }
                Err(e) => error!(topic = %topic, "Dropping held response: {}", e),
            }
        }
    }
}
