//! Fire-and-forget state-change recording.
//!
//! Successful state changes are handed to an [`EventSink`]. The
//! [`StateRecorder`] wraps the sink in a circuit breaker that opens on the
//! first failure and stays open for the rest of the process; sink failures
//! never reach the command path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use shadowlink_core::StateMap;

/// How long a recorded event is meant to be retained.
pub const EVENT_RETENTION_DAYS: i64 = 30;

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub device_id: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub state: StateMap,
    /// Unix time (seconds) after which the event may be discarded
    pub expires_at: i64,
}

impl StateChangeEvent {
    pub fn new(device_id: impl Into<String>, action: impl Into<String>, state: StateMap) -> Self {
        let timestamp = Utc::now();
        Self {
            device_id: device_id.into(),
            action: action.into(),
            timestamp,
            success: true,
            state,
            expires_at: (timestamp + Duration::days(EVENT_RETENTION_DAYS)).timestamp(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &StateChangeEvent) -> Result<(), SinkError>;
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonLinesSink {
    async fn record(&self, event: &StateChangeEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Circuit-breaker state of a [`StateRecorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Enabled,
    /// Tripped by a sink failure; never reset automatically
    Disabled,
}

/// Best-effort recorder in front of an optional sink.
#[derive(Clone)]
pub struct StateRecorder {
    sink: Option<Arc<dyn EventSink>>,
    breaker: Arc<Mutex<BreakerState>>,
}

impl StateRecorder {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink: Some(sink),
            breaker: Arc::new(Mutex::new(BreakerState::Enabled)),
        }
    }

    /// A recorder with no sink; every event is discarded.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            breaker: Arc::new(Mutex::new(BreakerState::Disabled)),
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.breaker.lock()
    }

    /// Record a state change in the background. Never blocks the caller.
    pub fn record(&self, device_id: &str, action: &str, state: StateMap) {
        if self.state() == BreakerState::Disabled {
            return;
        }
        let recorder = self.clone();
        let event = StateChangeEvent::new(device_id, action, state);
        tokio::spawn(async move {
            recorder.record_event(&event).await;
        });
    }

    /// Record an event, returning whether it reached the sink.
    pub async fn record_event(&self, event: &StateChangeEvent) -> bool {
        let Some(sink) = &self.sink else {
            return false;
        };
        if self.state() == BreakerState::Disabled {
            return false;
        }

        match sink.record(event).await {
            Ok(()) => {
                debug!(device_id = %event.device_id, action = %event.action, "Recorded state change");
                true
            }
            Err(e) => {
                let previous = std::mem::replace(&mut *self.breaker.lock(), BreakerState::Disabled);
                if previous == BreakerState::Enabled {
                    warn!("State recording disabled after sink failure: {}", e);
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySink {
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl EventSink for FlakySink {
        async fn record(&self, _event: &StateChangeEvent) -> Result<(), SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.fail_on {
                Err(SinkError::Unavailable("table missing".into()))
            } else {
                Ok(())
            }
        }
    }

    fn event() -> StateChangeEvent {
        let mut state = StateMap::new();
        state.insert("is_on".into(), json!(true));
        StateChangeEvent::new("bulb-1", "turn_on", state)
    }

    #[tokio::test]
    async fn test_breaker_opens_on_first_failure() {
        let sink = Arc::new(FlakySink {
            calls: AtomicUsize::new(0),
            fail_on: 2,
        });
        let recorder = StateRecorder::new(sink.clone());

        assert!(recorder.record_event(&event()).await);
        assert_eq!(recorder.state(), BreakerState::Enabled);

        assert!(!recorder.record_event(&event()).await);
        assert_eq!(recorder.state(), BreakerState::Disabled);

        // Sink is no longer called
        assert!(!recorder.record_event(&event()).await);
        recorder.record("bulb-1", "turn_off", StateMap::new());
        tokio::task::yield_now().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_json_lines_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("events.jsonl"));

        sink.record(&event()).await.unwrap();
        sink.record(&event()).await.unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<StateChangeEvent> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].device_id, "bulb-1");
        assert_eq!(
            lines[0].expires_at - lines[0].timestamp.timestamp(),
            EVENT_RETENTION_DAYS * 24 * 3600
        );
    }

    #[tokio::test]
    async fn test_unwritable_sink_trips_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = StateRecorder::new(Arc::new(JsonLinesSink::new(
            dir.path().join("missing-dir/events.jsonl"),
        )));

        assert!(!recorder.record_event(&event()).await);
        assert_eq!(recorder.state(), BreakerState::Disabled);
    }

    #[test]
    fn test_disabled_recorder() {
        assert_eq!(StateRecorder::disabled().state(), BreakerState::Disabled);
    }
}
