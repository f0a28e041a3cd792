//! In-process transport that stands in for a broker.
//!
//! Records subscriptions and publishes, delivers injected messages to matching
//! subscriptions, and can simulate dropped sessions, refused connects, a
//! stalled outbound queue and topics the broker rejects. Publishing to a topic
//! with `+` or `#` fails, as it does with a real client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use shadowlink_core::topic_matches;

use super::{InboundMessage, Transport, TransportError, TransportEvent};

const INBOUND_CAPACITY: usize = 256;

/// A publish recorded by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Payload decoded as JSON, or `Null` if it is not JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Default)]
struct MemoryState {
    session: Option<mpsc::Sender<TransportEvent>>,
    subscriptions: Vec<String>,
    published: Vec<PublishedMessage>,
    refuse_connects: usize,
    connect_attempts: usize,
    rejected_topics: Vec<String>,
}

/// Cloneable handle; all clones share the same broker state.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    /// `false` while publishes are paused
    publish_gate: Arc<watch::Sender<bool>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (publish_gate, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            publish_gate: Arc::new(publish_gate),
        }
    }

    /// Make every publish block until [`resume_publishes`](Self::resume_publishes).
    pub fn pause_publishes(&self) {
        self.publish_gate.send_replace(false);
    }

    pub fn resume_publishes(&self) {
        self.publish_gate.send_replace(true);
    }

    /// Fail every publish to `topic` with a non-retryable error.
    pub fn reject_topic(&self, topic: &str) {
        self.state.lock().rejected_topics.push(topic.to_string());
    }

    /// Refuse the next `count` connect attempts.
    pub fn refuse_connects(&self, count: usize) {
        self.state.lock().refuse_connects = count;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Filters subscribed by the current session.
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Every message published so far, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.state.lock().published.clear();
    }

    /// Deliver a message to the current session if a subscription matches.
    ///
    /// Returns `false` when there is no session or no matching subscription.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let session = {
            let state = self.state.lock();
            let subscribed = state
                .subscriptions
                .iter()
                .any(|filter| topic_matches(filter, topic));
            match &state.session {
                Some(tx) if subscribed => tx.clone(),
                _ => return false,
            }
        };

        session
            .send(TransportEvent::Message(InboundMessage::new(topic, payload)))
            .await
            .is_ok()
    }

    /// Drop the current session as if the network failed.
    pub async fn drop_connection(&self, reason: &str) {
        let session = {
            let mut state = self.state.lock();
            state.subscriptions.clear();
            state.session.take()
        };
        if let Some(tx) = session {
            let _ = tx
                .send(TransportEvent::ConnectionLost(reason.to_string()))
                .await;
        }
    }

    /// Wait until a publish on `topic` satisfies `predicate`.
    pub async fn wait_for_publish<F>(
        &self,
        topic: &str,
        timeout: Duration,
        predicate: F,
    ) -> Option<PublishedMessage>
    where
        F: Fn(&PublishedMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self
                .state
                .lock()
                .published
                .iter()
                .find(|m| m.topic == topic && predicate(m))
                .cloned();
            if found.is_some() {
                return found;
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the session has subscribed to `count` filters.
    pub async fn wait_for_subscriptions(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            {
                let state = self.state.lock();
                if state.session.is_some() && state.subscriptions.len() >= count {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        state.session = Some(tx);
        state.subscriptions.clear();
        Ok(rx)
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.session.is_none() {
            return Err(TransportError::Closed);
        }
        if !state.subscriptions.iter().any(|f| f == filter) {
            state.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut gate = self.publish_gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(TransportError::Closed);
        }

        let mut state = self.state.lock();
        if state.session.is_none() {
            return Err(TransportError::Closed);
        }
        if topic.contains(['+', '#']) || state.rejected_topics.iter().any(|t| t == topic) {
            return Err(TransportError::Publish(format!("invalid topic: {}", topic)));
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.session = None;
        state.subscriptions.clear();
        Ok(())
    }
}
