//! Shadowlink bridge runtime.
//!
//! Mediates between a pub/sub broker and locally registered devices:
//!
//! - [`ConnectionManager`] owns the transport session and reconnects with backoff
//! - [`CommandRouter`] turns command messages into device actions and responses
//! - [`ShadowStore`] publishes reported state and applies desired deltas
//! - [`DeviceLanes`] serializes work per device
//! - [`Bridge`] supervises the session and performs graceful shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shadowlink_bridge::{Bridge, MqttTransport, StateRecorder};
//! use shadowlink_core::BridgeConfig;
//! use shadowlink_devices::{DeviceRegistry, DimmableBulb};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BridgeConfig::new("broker.local");
//! let registry = Arc::new(DeviceRegistry::new());
//! registry.register(Arc::new(DimmableBulb::new("bulb-1"))).await?;
//!
//! let transport = Arc::new(MqttTransport::from_config(&config)?);
//! let bridge = Arc::new(Bridge::new(&config, registry, transport, StateRecorder::disabled()));
//! let handle = bridge.start();
//!
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod bridge;
pub mod connection;
pub mod error;
pub mod lanes;
pub mod pending;
pub mod recorder;
pub mod router;
pub mod shadow;
pub mod transport;

pub use backoff::Backoff;
pub use bridge::{Bridge, BridgeHandle};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{BridgeError, Result};
pub use lanes::DeviceLanes;
pub use recorder::{
    BreakerState, EventSink, JsonLinesSink, SinkError, StateChangeEvent, StateRecorder,
};
pub use router::CommandRouter;
pub use shadow::{DESIRED_DELTA_ACTION, ShadowStore};
pub use transport::{
    InboundMessage, MemoryTransport, MqttTransport, PublishedMessage, Transport, TransportError,
    TransportEvent,
};
