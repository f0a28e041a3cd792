//! Bridge supervisor: session lifecycle, message dispatch and shutdown.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shadowlink_core::{BridgeConfig, TopicLayout};
use shadowlink_devices::DeviceRegistry;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{BridgeError, Result};
use crate::lanes::DeviceLanes;
use crate::recorder::StateRecorder;
use crate::router::CommandRouter;
use crate::shadow::ShadowStore;
use crate::transport::{InboundMessage, Transport, TransportEvent};

/// Why a session's event pump returned.
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// A bridge between one transport session and the registered devices.
pub struct Bridge {
    layout: TopicLayout,
    registry: Arc<DeviceRegistry>,
    connection: Arc<ConnectionManager>,
    shadow: Arc<ShadowStore>,
    router: Arc<CommandRouter>,
    lanes: Arc<DeviceLanes>,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        registry: Arc<DeviceRegistry>,
        transport: Arc<dyn Transport>,
        recorder: StateRecorder,
    ) -> Self {
        let layout = config.topic_layout();
        let connection = Arc::new(ConnectionManager::new(transport, &config.reconnect));
        let lanes = Arc::new(DeviceLanes::new());
        let shadow = Arc::new(ShadowStore::new(
            Arc::clone(&registry),
            Arc::clone(&connection),
            &layout,
            config.default_device_id(),
            recorder.clone(),
        ));
        let router = Arc::new(CommandRouter::new(
            layout.clone(),
            Arc::clone(&registry),
            Arc::clone(&shadow),
            Arc::clone(&connection),
            Arc::clone(&lanes),
            config.pending_response_capacity,
            recorder,
        ));

        Self {
            layout,
            registry,
            connection,
            shadow,
            router,
            lanes,
        }
    }

    pub fn layout(&self) -> &TopicLayout {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn shadow(&self) -> &Arc<ShadowStore> {
        &self.shadow
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn lanes(&self) -> &Arc<DeviceLanes> {
        &self.lanes
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Run the bridge in a background task.
    pub fn start(self: Arc<Self>) -> BridgeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        BridgeHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Keep a session up until `shutdown` turns true, then shut down gracefully.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let devices = self.registry.len().await;
        info!(namespace = %self.layout.namespace(), devices, "Starting bridge");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.establish_session().await {
                Ok(events) => match self.pump(events, &mut shutdown).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => self.connection.connection_lost(&reason),
                },
                Err(BridgeError::ShuttingDown) => break,
                Err(e) => warn!("Session setup failed: {}", e),
            }

            self.shadow.set_online(false);
            let delay = self.connection.begin_backoff();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown_gracefully().await;
        Ok(())
    }

    /// Connect, subscribe, resync reported state, then release held responses.
    async fn establish_session(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let events = self.connection.connect().await?;

        let handshake = async {
            self.connection
                .subscribe(&self.layout.command_filter())
                .await?;
            self.connection
                .subscribe(&self.layout.shadow_delta_topic())
                .await?;
            self.shadow.set_online(true);
            self.shadow.resync_during_handshake().await
        };
        if let Err(e) = handshake.await {
            self.connection.connection_lost(&e.to_string());
            return Err(e);
        }

        self.connection.mark_connected();
        self.router.flush_pending().await;
        Ok(events)
    }

    async fn pump(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Message(message)) => self.dispatch(message).await,
                    Some(TransportEvent::ConnectionLost(reason)) => return SessionEnd::Lost(reason),
                    None => return SessionEnd::Lost("event stream closed".to_string()),
                },
            }
        }
    }

    async fn dispatch(&self, message: InboundMessage) {
        if self.layout.is_delta_topic(&message.topic) {
            self.dispatch_delta(&message.payload).await;
        } else if self.layout.is_command_topic(&message.topic) {
            self.router.route(message).await;
        } else {
            debug!(topic = %message.topic, "Ignoring message on unexpected topic");
        }
    }

    /// Queue each registered device's desired patch on that device's lane.
    ///
    /// Patches for unregistered ids are dropped here so they never get a lane.
    async fn dispatch_delta(&self, payload: &[u8]) {
        let delta = match self.shadow.parse_delta(payload) {
            Ok(delta) => delta,
            Err(e) => {
                warn!("Dropping desired delta: {}", e);
                return;
            }
        };
        debug!(version = ?delta.version, patches = delta.patches.len(), "Received desired delta");

        for patch in delta.patches {
            if !self.registry.contains(&patch.device_id).await {
                warn!(device_id = %patch.device_id, "Dropping desired delta for unknown device");
                continue;
            }
            let shadow = Arc::clone(&self.shadow);
            let device_id = patch.device_id.clone();
            let job = Box::pin(async move {
                match shadow.accept_desired_delta(&patch.device_id, &patch.fields).await {
                    Ok(Some(_)) => shadow.sync().await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(device_id = %patch.device_id, "Failed to apply desired state: {}", e);
                        shadow.sync().await;
                    }
                }
            });
            if let Err(e) = self.lanes.submit(&device_id, job) {
                warn!(device_id = %device_id, "Desired delta not applied: {}", e);
            }
        }
    }

    /// Finish in-flight work, report the bridge offline, then disconnect.
    async fn shutdown_gracefully(&self) {
        info!("Shutting down bridge");
        self.lanes.drain().await;

        self.shadow.set_online(false);
        if self.connection.is_connected() {
            self.shadow.sync().await;
        }
        self.connection.close().await;
        info!("Bridge stopped");
    }
}

/// Handle to a bridge started with [`Bridge::start`].
pub struct BridgeHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl BridgeHandle {
    /// Ask the bridge to stop without waiting for it.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop the bridge and wait for the graceful shutdown to complete.
    pub async fn shutdown(self) -> Result<()> {
        self.request_shutdown();
        self.join().await
    }

    /// Wait for the bridge task to finish.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| BridgeError::Task(e.to_string()))?
    }
}
