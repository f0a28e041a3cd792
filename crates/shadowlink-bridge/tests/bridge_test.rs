//! End-to-end bridge tests against the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;

use shadowlink_bridge::{
    BreakerState, Bridge, BridgeHandle, ConnectionState, DESIRED_DELTA_ACTION, EventSink,
    JsonLinesSink, MemoryTransport, PublishedMessage, SinkError, StateChangeEvent, StateRecorder,
};
use shadowlink_core::{BridgeConfig, CommandEnvelope, ReconnectConfig, StateMap};
use shadowlink_devices::{
    ActionOutcome, ApplyReport, DeviceCapability, DeviceError, DeviceRegistry, DimmableBulb,
    OnOffSwitch,
};

const WAIT: Duration = Duration::from_secs(3);
const UPDATE_TOPIC: &str = "$aws/things/test-bridge/shadow/update";
const DELTA_TOPIC: &str = "$aws/things/test-bridge/shadow/update/delta";

/// Appends `parameters.value` to a shared log, optionally after a delay.
/// The `hang` action blocks until released; `fail` reports the device unreachable.
struct LogDevice {
    id: String,
    log: Arc<Mutex<Vec<String>>>,
    release: Arc<Notify>,
}

impl LogDevice {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            log: Arc::new(Mutex::new(Vec::new())),
            release: Arc::new(Notify::new()),
        }
    }

    fn state(&self) -> StateMap {
        let mut state = StateMap::new();
        state.insert("entries".into(), json!(self.log.lock().len()));
        state
    }
}

#[async_trait]
impl DeviceCapability for LogDevice {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn device_type(&self) -> &'static str {
        "log"
    }

    fn supported_actions(&self) -> &'static [&'static str] {
        &["append", "hang", "fail"]
    }

    async fn execute(&self, action: &str, parameters: &StateMap) -> Result<ActionOutcome, DeviceError> {
        match action {
            "append" => {
                let delay = parameters.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let value = parameters
                    .get("value")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DeviceError::missing_param("value"))?;
                self.log.lock().push(value.to_string());
                Ok(ActionOutcome::ok(format!("Appended {}", value), self.state()))
            }
            "hang" => {
                self.release.notified().await;
                Ok(ActionOutcome::ok("Released", self.state()))
            }
            "fail" => Err(DeviceError::ExecutionFailure("device unreachable".into())),
            other => Err(DeviceError::UnsupportedAction(other.to_string())),
        }
    }

    async fn apply_desired_state(&self, _desired: &StateMap) -> Result<ApplyReport, DeviceError> {
        Ok(ApplyReport::default())
    }

    fn shadow_state(&self) -> StateMap {
        self.state()
    }
}

struct Harness {
    transport: MemoryTransport,
    bridge: Arc<Bridge>,
    handle: BridgeHandle,
}

fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::new("memory").with_thing_name("test-bridge");
    config.default_device_id = Some("bulb-1".to_string());
    config.reconnect = ReconnectConfig {
        min_delay_ms: 10,
        max_delay_ms: 40,
        multiplier: 2.0,
        jitter: 0.0,
    };
    config
}

async fn start_with(
    devices: Vec<Arc<dyn DeviceCapability>>,
    transport: MemoryTransport,
    recorder: StateRecorder,
) -> Harness {
    let registry = Arc::new(DeviceRegistry::new());
    for device in devices {
        registry.register(device).await.unwrap();
    }

    let bridge = Arc::new(Bridge::new(
        &test_config(),
        registry,
        Arc::new(transport.clone()),
        recorder,
    ));
    let handle = Arc::clone(&bridge).start();
    wait_connected(&bridge).await;

    Harness {
        transport,
        bridge,
        handle,
    }
}

async fn start() -> Harness {
    start_with(
        vec![Arc::new(DimmableBulb::new("bulb-1"))],
        MemoryTransport::new(),
        StateRecorder::disabled(),
    )
    .await
}

async fn wait_connected(bridge: &Bridge) {
    let mut state = bridge.connection().watch_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| s.is_connected()))
        .await
        .expect("bridge did not connect")
        .unwrap();
}

async fn command(transport: &MemoryTransport, device_id: &str, action: &str, payload: Value) {
    let topic = format!("smarthome/{}/commands/{}", device_id, action);
    assert!(transport.inject(&topic, payload.to_string()).await);
}

async fn response(transport: &MemoryTransport, device_id: &str, request_id: &str) -> Value {
    let topic = format!("smarthome/{}/responses/{}", device_id, request_id);
    transport
        .wait_for_publish(&topic, WAIT, |_| true)
        .await
        .unwrap_or_else(|| panic!("no response on {}", topic))
        .json()
}

async fn wait_for_prefix<F>(transport: &MemoryTransport, prefix: &str, predicate: F) -> PublishedMessage
where
    F: Fn(&PublishedMessage) -> bool,
{
    for _ in 0..300 {
        let found = transport
            .published()
            .into_iter()
            .find(|m| m.topic.starts_with(prefix) && predicate(m));
        if let Some(message) = found {
            return message;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no publish under {}", prefix);
}

fn reported(message: &PublishedMessage) -> Value {
    message.json()["state"]["reported"].clone()
}

async fn read_events(path: &std::path::Path) -> Vec<StateChangeEvent> {
    for _ in 0..100 {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let events: Vec<StateChangeEvent> = contents
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect();
            if !events.is_empty() {
                return events;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Vec::new()
}

#[tokio::test]
async fn test_cold_start_subscribes_and_resyncs() {
    let h = start().await;

    let subscriptions = h.transport.subscriptions();
    assert!(subscriptions.contains(&"smarthome/+/commands/+".to_string()));
    assert!(subscriptions.contains(&DELTA_TOPIC.to_string()));

    let updates = h.transport.published_on(UPDATE_TOPIC);
    assert_eq!(updates.len(), 1);
    let doc = reported(&updates[0]);
    assert_eq!(doc["bridge_connected"], true);
    assert_eq!(doc["devices"]["bulb-1"]["is_on"], false);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_turn_on_scenario() {
    let h = start().await;

    command(&h.transport, "bulb-1", "turn_on", json!({"request_id": "r1", "parameters": {}})).await;
    let resp = response(&h.transport, "bulb-1", "r1").await;

    assert_eq!(resp["request_id"], "r1");
    assert_eq!(resp["success"], true);
    assert_eq!(resp["message"], "Bulb turned on");
    assert_eq!(resp["state"]["is_on"], true);

    let update = h
        .transport
        .wait_for_publish(UPDATE_TOPIC, WAIT, |m| {
            reported(m)["devices"]["bulb-1"]["is_on"] == true
        })
        .await;
    assert!(update.is_some());

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_brightness_scenario() {
    let h = start().await;

    command(
        &h.transport,
        "bulb-1",
        "set_brightness",
        json!({"request_id": "r2", "parameters": {"brightness": 150}}),
    )
    .await;
    let resp = response(&h.transport, "bulb-1", "r2").await;

    assert_eq!(resp["success"], false);
    assert!(resp["message"].as_str().unwrap().contains("0-100"));
    assert_eq!(resp["state"]["brightness"], 100);

    // Reported state is resynced even after a failed command
    let mut updates = Vec::new();
    for _ in 0..100 {
        updates = h.transport.published_on(UPDATE_TOPIC);
        if updates.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(updates.len(), 2);
    assert_eq!(reported(&updates[1])["devices"]["bulb-1"]["brightness"], 100);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_device_scenario() {
    let h = start().await;

    command(&h.transport, "bulb-99", "turn_on", json!({"request_id": "r3", "parameters": {}})).await;
    let resp = response(&h.transport, "bulb-99", "r3").await;

    assert_eq!(resp["success"], false);
    assert_eq!(resp["message"], "Unknown device: bulb-99");

    // Bridge keeps working and never reports the unknown device
    command(&h.transport, "bulb-1", "get_status", json!({"request_id": "r4"})).await;
    response(&h.transport, "bulb-1", "r4").await;
    for update in h.transport.published_on(UPDATE_TOPIC) {
        assert!(reported(&update)["devices"].get("bulb-99").is_none());
    }

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_messages() {
    let h = start().await;

    // Unparsable payload: response on the `unknown` request topic
    assert!(h.transport.inject("smarthome/bulb-1/commands/turn_on", "not json").await);
    let resp = response(&h.transport, "bulb-1", "unknown").await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["request_id"], "");

    // Salvageable request id
    command(&h.transport, "bulb-1", "turn_on", json!({"request_id": "r5", "parameters": [1]})).await;
    let resp = response(&h.transport, "bulb-1", "r5").await;
    assert_eq!(resp["success"], false);

    // Malformed topic is dropped without a response
    assert!(h.transport.inject("smarthome/bulb-1/commands/", "{}").await);

    // Missing request id gets a generated one
    command(&h.transport, "bulb-1", "turn_off", json!({"parameters": {}})).await;
    let generated = wait_for_prefix(&h.transport, "smarthome/bulb-1/responses/", |m| {
        m.json()["message"] == "Bulb turned off"
    })
    .await;
    assert!(!generated.json()["request_id"].as_str().unwrap().is_empty());

    let responses: Vec<_> = h
        .transport
        .published()
        .into_iter()
        .filter(|m| m.topic.starts_with("smarthome/bulb-1/responses/"))
        .collect();
    assert_eq!(responses.len(), 3);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_commands_for_one_device_run_in_order() {
    let device = Arc::new(LogDevice::new("logger"));
    let log = Arc::clone(&device.log);
    let h = start_with(
        vec![device as Arc<dyn DeviceCapability>],
        MemoryTransport::new(),
        StateRecorder::disabled(),
    )
    .await;

    command(
        &h.transport,
        "logger",
        "append",
        json!({"request_id": "a", "parameters": {"value": "A", "delay_ms": 50}}),
    )
    .await;
    command(
        &h.transport,
        "logger",
        "append",
        json!({"request_id": "b", "parameters": {"value": "B"}}),
    )
    .await;

    response(&h.transport, "logger", "a").await;
    response(&h.transport, "logger", "b").await;
    assert_eq!(*log.lock(), vec!["A", "B"]);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hanging_device_does_not_block_others() {
    let stuck = Arc::new(LogDevice::new("stuck"));
    let release = Arc::clone(&stuck.release);
    let h = start_with(
        vec![
            stuck as Arc<dyn DeviceCapability>,
            Arc::new(DimmableBulb::new("bulb-1")),
        ],
        MemoryTransport::new(),
        StateRecorder::disabled(),
    )
    .await;

    command(&h.transport, "stuck", "hang", json!({"request_id": "h1"})).await;
    command(&h.transport, "bulb-1", "turn_on", json!({"request_id": "r1"})).await;
    assert_eq!(response(&h.transport, "bulb-1", "r1").await["success"], true);

    release.notify_one();
    assert_eq!(response(&h.transport, "stuck", "h1").await["message"], "Released");

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_response_held_while_disconnected() {
    let stuck = Arc::new(LogDevice::new("stuck"));
    let release = Arc::clone(&stuck.release);
    let h = start_with(
        vec![stuck as Arc<dyn DeviceCapability>],
        MemoryTransport::new(),
        StateRecorder::disabled(),
    )
    .await;

    command(&h.transport, "stuck", "hang", json!({"request_id": "h1"})).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.transport.refuse_connects(2);
    h.transport.drop_connection("network down").await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Finishes while offline; the response must survive until reconnect
    release.notify_one();
    let resp = response(&h.transport, "stuck", "h1").await;
    assert_eq!(resp["success"], true);
    assert_eq!(h.bridge.router().pending_responses(), 0);
    assert!(h.transport.connect_attempts() >= 4);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_republishes_applied_delta() {
    let h = start().await;

    assert!(h
        .transport
        .inject(DELTA_TOPIC, json!({"version": 3, "state": {"devices": {"bulb-1": {"is_on": true}}}}).to_string())
        .await);
    h.transport.drop_connection("network down").await;
    h.transport.clear_published();

    let resync = h
        .transport
        .wait_for_publish(UPDATE_TOPIC, WAIT, |m| {
            let doc = reported(m);
            doc["bridge_connected"] == true && doc["devices"]["bulb-1"]["is_on"] == true
        })
        .await;
    assert!(resync.is_some());
    wait_connected(&h.bridge).await;
    assert_eq!(h.transport.connect_attempts(), 2);
    assert_eq!(h.bridge.shadow().last_delta_version(), Some(3));

    let doc = h.bridge.shadow().document("bulb-1").unwrap();
    assert_eq!(doc.desired["is_on"], true);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_delta_is_idempotent() {
    let h = start().await;
    let delta = json!({"state": {"is_on": true}}).to_string();

    assert!(h.transport.inject(DELTA_TOPIC, delta.clone()).await);
    assert!(h.transport.inject(DELTA_TOPIC, delta).await);

    let mut updates = Vec::new();
    for _ in 0..100 {
        updates = h.transport.published_on(UPDATE_TOPIC);
        if updates.len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(updates.len(), 3);
    assert_eq!(reported(&updates[1]), reported(&updates[2]));
    assert_eq!(reported(&updates[2])["devices"]["bulb-1"]["is_on"], true);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delta_for_unknown_device_is_dropped() {
    let h = start_with(
        vec![
            Arc::new(DimmableBulb::new("bulb-1")),
            Arc::new(OnOffSwitch::new("plug-1")),
        ],
        MemoryTransport::new(),
        StateRecorder::disabled(),
    )
    .await;

    let delta = json!({"devices": {"bulb-99": {"is_on": true}, "plug-1": {"is_on": true}}});
    assert!(h.transport.inject(DELTA_TOPIC, delta.to_string()).await);

    let update = h
        .transport
        .wait_for_publish(UPDATE_TOPIC, WAIT, |m| {
            reported(m)["devices"]["plug-1"]["is_on"] == true
        })
        .await
        .unwrap();
    assert!(reported(&update)["devices"].get("bulb-99").is_none());
    assert!(h.bridge.shadow().document("bulb-99").is_none());

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_retries_until_broker_accepts() {
    let transport = MemoryTransport::new();
    transport.refuse_connects(3);

    let registry = Arc::new(DeviceRegistry::new());
    let bridge = Arc::new(Bridge::new(
        &test_config(),
        registry,
        Arc::new(transport.clone()),
        StateRecorder::disabled(),
    ));
    let mut states = bridge.connection().watch_state();
    let handle = Arc::clone(&bridge).start();

    let saw_backoff = tokio::time::timeout(
        WAIT,
        states.wait_for(|s| matches!(s, ConnectionState::ReconnectBackoff { .. })),
    )
    .await
    .is_ok();
    assert!(saw_backoff);

    wait_connected(&bridge).await;
    assert_eq!(transport.connect_attempts(), 4);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_reports_bridge_offline() {
    let h = start().await;
    command(&h.transport, "bulb-1", "turn_on", json!({"request_id": "r1"})).await;
    response(&h.transport, "bulb-1", "r1").await;

    h.handle.shutdown().await.unwrap();

    let updates = h.transport.published_on(UPDATE_TOPIC);
    let last = reported(updates.last().unwrap());
    assert_eq!(last["bridge_connected"], false);
    assert_eq!(last["devices"]["bulb-1"]["is_on"], true);
    assert!(!h.transport.is_connected());
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_state_changes_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let recorder = StateRecorder::new(Arc::new(JsonLinesSink::new(&path)));
    let h = start_with(
        vec![Arc::new(DimmableBulb::new("bulb-1"))],
        MemoryTransport::new(),
        recorder,
    )
    .await;

    command(&h.transport, "bulb-1", "turn_on", json!({"request_id": "r1"})).await;
    response(&h.transport, "bulb-1", "r1").await;
    // Status reads change nothing and are not recorded
    command(&h.transport, "bulb-1", "get_status", json!({"request_id": "r2"})).await;
    response(&h.transport, "bulb-1", "r2").await;

    let events = read_events(&path).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].device_id, "bulb-1");
    assert_eq!(events[0].action, "turn_on");
    assert_eq!(events[0].state["is_on"], true);

    h.handle.shutdown().await.unwrap();
}

struct BrokenSink;

#[async_trait]
impl EventSink for BrokenSink {
    async fn record(&self, _event: &StateChangeEvent) -> Result<(), SinkError> {
        Err(SinkError::Unavailable("no table".into()))
    }
}

#[tokio::test]
async fn test_recorder_failure_never_fails_commands() {
    let recorder = StateRecorder::new(Arc::new(BrokenSink));
    let h = start_with(
        vec![Arc::new(DimmableBulb::new("bulb-1"))],
        MemoryTransport::new(),
        recorder,
    )
    .await;

    command(&h.transport, "bulb-1", "turn_on", json!({"request_id": "r1"})).await;
    assert_eq!(response(&h.transport, "bulb-1", "r1").await["success"], true);

    let mut state = BreakerState::Enabled;
    for _ in 0..100 {
        state = h.bridge.router().recorder().state();
        if state == BreakerState::Disabled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, BreakerState::Disabled);

    command(&h.transport, "bulb-1", "turn_off", json!({"request_id": "r2"})).await;
    assert_eq!(response(&h.transport, "bulb-1", "r2").await["success"], true);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_execution_failure_gets_failed_response() {
    let h = start_with(
        vec![Arc::new(LogDevice::new("logger")) as Arc<dyn DeviceCapability>],
        MemoryTransport::new(),
        StateRecorder::disabled(),
    )
    .await;

    command(&h.transport, "logger", "fail", json!({"request_id": "f1"})).await;
    let resp = response(&h.transport, "logger", "f1").await;
    assert_eq!(resp["request_id"], "f1");
    assert_eq!(resp["success"], false);
    assert_eq!(resp["message"], "Device execution failed: device unreachable");
    assert_eq!(resp["state"]["entries"], 0);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unpublishable_response_does_not_block_held_ones() {
    let h = start().await;

    // Wildcards are not valid in a topic level; the response goes to `unknown`
    command(&h.transport, "bulb-1", "get_status", json!({"request_id": "bad+id"})).await;
    let resp = response(&h.transport, "bulb-1", "unknown").await;
    assert_eq!(resp["request_id"], "bad+id");
    assert_eq!(resp["success"], true);

    h.transport.reject_topic("smarthome/bulb-1/responses/rejected");
    h.transport.refuse_connects(3);
    let mut states = h.bridge.connection().watch_state();
    h.transport.drop_connection("network down").await;
    tokio::time::timeout(
        WAIT,
        states.wait_for(|s| matches!(s, ConnectionState::ReconnectBackoff { .. })),
    )
    .await
    .expect("bridge did not back off")
    .unwrap();

    // Both finish offline; the broker refuses the first once the session is back
    let router = h.bridge.router();
    router
        .execute("bulb-1", "turn_on", CommandEnvelope::new("rejected"))
        .await;
    router
        .execute("bulb-1", "turn_off", CommandEnvelope::new("good-1"))
        .await;

    let resp = response(&h.transport, "bulb-1", "good-1").await;
    assert_eq!(resp["message"], "Bulb turned off");
    assert_eq!(h.bridge.router().pending_responses(), 0);
    assert!(h
        .transport
        .published_on("smarthome/bulb-1/responses/rejected")
        .is_empty());

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delta_for_unknown_ids_opens_no_lanes() {
    let h = start_with(
        vec![Arc::new(OnOffSwitch::new("plug-1"))],
        MemoryTransport::new(),
        StateRecorder::disabled(),
    )
    .await;

    let mut devices = serde_json::Map::new();
    for i in 0..50 {
        devices.insert(format!("ghost-{}", i), json!({"is_on": true}));
    }
    devices.insert("plug-1".into(), json!({"is_on": true}));
    let delta = json!({"devices": Value::Object(devices)});
    assert!(h.transport.inject(DELTA_TOPIC, delta.to_string()).await);

    let update = h
        .transport
        .wait_for_publish(UPDATE_TOPIC, WAIT, |m| {
            reported(m)["devices"]["plug-1"]["is_on"] == true
        })
        .await;
    assert!(update.is_some());
    assert_eq!(h.bridge.lanes().len(), 1);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_receive_loop_keeps_going_while_publishes_stall() {
    let device = Arc::new(LogDevice::new("logger"));
    let log = Arc::clone(&device.log);
    let h = start_with(
        vec![device as Arc<dyn DeviceCapability>],
        MemoryTransport::new(),
        StateRecorder::disabled(),
    )
    .await;

    h.transport.pause_publishes();
    command(&h.transport, "bulb-99", "turn_on", json!({"request_id": "u1"})).await;
    command(
        &h.transport,
        "logger",
        "append",
        json!({"request_id": "a1", "parameters": {"value": "A"}}),
    )
    .await;

    // The unknown-device response is stuck, yet the next command still runs
    let mut ran = false;
    for _ in 0..300 {
        if !log.lock().is_empty() {
            ran = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ran);

    h.transport.resume_publishes();
    assert_eq!(response(&h.transport, "bulb-99", "u1").await["success"], false);
    assert_eq!(response(&h.transport, "logger", "a1").await["success"], true);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_command() {
    let stuck = Arc::new(LogDevice::new("stuck"));
    let release = Arc::clone(&stuck.release);
    let h = start_with(
        vec![stuck as Arc<dyn DeviceCapability>],
        MemoryTransport::new(),
        StateRecorder::disabled(),
    )
    .await;

    command(&h.transport, "stuck", "hang", json!({"request_id": "h1"})).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.handle.request_shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;
    // Still waiting on the in-flight command
    assert!(h.transport.is_connected());

    release.notify_one();
    h.handle.join().await.unwrap();

    let published = h.transport.published();
    let response_at = published
        .iter()
        .position(|m| m.topic == "smarthome/stuck/responses/h1")
        .expect("in-flight response was not published");
    let final_at = published
        .iter()
        .rposition(|m| m.topic == UPDATE_TOPIC)
        .unwrap();
    assert!(response_at < final_at);
    assert_eq!(published[response_at].json()["message"], "Released");
    assert_eq!(reported(&published[final_at])["bridge_connected"], false);
    assert!(!h.transport.is_connected());
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_desired_delta_changes_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let recorder = StateRecorder::new(Arc::new(JsonLinesSink::new(&path)));
    let h = start_with(
        vec![Arc::new(DimmableBulb::new("bulb-1"))],
        MemoryTransport::new(),
        recorder,
    )
    .await;

    let delta = json!({"state": {"is_on": true, "brightness": 40}});
    assert!(h.transport.inject(DELTA_TOPIC, delta.to_string()).await);

    let events = read_events(&path).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].device_id, "bulb-1");
    assert_eq!(events[0].action, DESIRED_DELTA_ACTION);
    assert_eq!(events[0].state["is_on"], true);
    assert_eq!(events[0].state["brightness"], 40);

    h.handle.shutdown().await.unwrap();
}
