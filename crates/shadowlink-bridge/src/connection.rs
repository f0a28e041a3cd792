//! Connection Manager: owns the transport session and its state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ReconnectBackoff -> Connecting -> ...
//!                     |                            ^
//!                     +----- connect failed -------+
//! ```
//!
//! Any state moves to the final `Disconnected` on shutdown. Ordinary publishes
//! are refused with `NotConnected` unless the state is `Connected`; while a
//! session is being established, [`ConnectionManager::publish_during_handshake`]
//! is used for the cold-start resync so that it goes out before anything else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use shadowlink_core::ReconnectConfig;

use crate::backoff::Backoff;
use crate::error::{BridgeError, Result};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay_ms` before reconnect attempt number `attempt`
    ReconnectBackoff { attempt: u32, delay_ms: u64 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    backoff: Mutex<Backoff>,
    /// Set while a transport session is open (handshake included)
    session_open: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, reconnect: &ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            state,
            backoff: Mutex::new(Backoff::new(reconnect)),
            session_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `Connected` with the session still open.
    pub fn is_connected(&self) -> bool {
        self.session_open.load(Ordering::SeqCst) && self.state().is_connected()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Connection state {:?} -> {:?}", previous, next);
        }
    }

    /// Open a transport session. On success the state stays `Connecting` until
    /// [`mark_connected`](Self::mark_connected).
    pub async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.is_closed() {
            return Err(BridgeError::ShuttingDown);
        }

        self.transition(ConnectionState::Connecting);
        match self.transport.connect().await {
            Ok(events) => {
                self.session_open.store(true, Ordering::SeqCst);
                Ok(events)
            }
            Err(e) => {
                warn!("Connect attempt failed: {}", e);
                Err(e.into())
            }
        }
    }

    pub async fn subscribe(&self, filter: &str) -> Result<()> {
        if !self.session_open.load(Ordering::SeqCst) {
            return Err(BridgeError::NotConnected);
        }
        self.transport.subscribe(filter).await?;
        info!("Subscribed to {}", filter);
        Ok(())
    }

    /// Publish while the session is still being established.
    pub async fn publish_during_handshake(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.session_open.load(Ordering::SeqCst) {
            return Err(BridgeError::NotConnected);
        }
        self.transport.publish(topic, payload).await?;
        Ok(())
    }

    /// Finish the handshake: the session now accepts ordinary publishes.
    pub fn mark_connected(&self) {
        self.backoff.lock().reset();
        self.transition(ConnectionState::Connected);
        info!("Bridge connected");
    }

    /// Publish on the established session.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        match self.transport.publish(topic, payload).await {
            Ok(()) => Ok(()),
            Err(TransportError::Closed) => Err(BridgeError::NotConnected),
            Err(e) => Err(e.into()),
        }
    }

    /// Record an unexpected session drop.
    ///
    /// Publishes are refused from here on. The observable state stays put
    /// until [`begin_backoff`](Self::begin_backoff) moves it to
    /// `ReconnectBackoff`; `Disconnected` is only the initial and final state.
    pub fn connection_lost(&self, reason: &str) {
        self.session_open.store(false, Ordering::SeqCst);
        if !self.is_closed() {
            warn!("Connection lost: {}", reason);
        }
    }

    /// Enter `ReconnectBackoff` and return how long to wait before the next attempt.
    pub fn begin_backoff(&self) -> Duration {
        let (attempt, delay) = {
            let mut backoff = self.backoff.lock();
            let delay = backoff.next_delay();
            (backoff.attempt(), delay)
        };
        self.transition(ConnectionState::ReconnectBackoff {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        info!(
            "Reconnecting in {:.1}s (attempt {})",
            delay.as_secs_f64(),
            attempt
        );
        delay
    }

    /// Disconnect for good. Later connects fail with `ShuttingDown`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.session_open.store(false, Ordering::SeqCst);
        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        self.transition(ConnectionState::Disconnected);
        info!("Bridge disconnected");
    }
}
