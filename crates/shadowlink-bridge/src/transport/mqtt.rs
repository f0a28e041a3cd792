//! MQTT transport backed by rumqttc.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use shadowlink_core::BridgeConfig;

use super::{InboundMessage, Transport, TransportError, TransportEvent};

/// Request queue depth of the rumqttc client.
const CLIENT_CAPACITY: usize = 64;
/// Inbound event buffer per session.
const INBOUND_CAPACITY: usize = 256;
/// rumqttc rejects keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// MQTT 3.1.1 session over TCP or mutual TLS.
pub struct MqttTransport {
    options: MqttOptions,
    connect_timeout: Duration,
    client: Mutex<Option<AsyncClient>>,
}

impl MqttTransport {
    pub fn new(options: MqttOptions, connect_timeout: Duration) -> Self {
        Self {
            options,
            connect_timeout,
            client: Mutex::new(None),
        }
    }

    /// Build a transport from bridge configuration, loading TLS material if configured.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, TransportError> {
        let mut options = MqttOptions::new(config.client_id(), &config.endpoint, config.broker_port());
        options.set_keep_alive(config.keep_alive().max(MIN_KEEP_ALIVE));
        options.set_clean_session(config.clean_session);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        if config.tls.is_some() {
            let files = config
                .tls_files()
                .ok_or_else(|| TransportError::Tls("TLS paths are not resolved".to_string()))?;
            let read = |path: &std::path::Path| {
                std::fs::read(path)
                    .map_err(|e| TransportError::Tls(format!("{}: {}", path.display(), e)))
            };
            let ca = read(&files.root_ca)?;
            let cert = read(&files.cert)?;
            let key = read(&files.key)?;

            options.set_transport(rumqttc::Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert, key)),
            }));
        }

        Ok(Self::new(options, config.connect_timeout()))
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.client.lock().clone().ok_or(TransportError::Closed)
    }

    /// Poll until the broker acknowledges the connection.
    async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(TransportError::Connect(format!("rejected: {:?}", ack.code)))
                    };
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
    }

    /// Forward inbound publishes until the session drops or the receiver goes away.
    async fn run_eventloop(mut eventloop: EventLoop, tx: mpsc::Sender<TransportEvent>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                    if tx.send(TransportEvent::Message(message)).await.is_err() {
                        debug!("Inbound receiver dropped, stopping MQTT event loop");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    let _ = tx
                        .send(TransportEvent::ConnectionLost(
                            "broker sent disconnect".to_string(),
                        ))
                        .await;
                    break;
                }
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    debug!("MQTT session closed locally");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    let _ = tx.send(TransportEvent::ConnectionLost(e.to_string())).await;
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (host, port) = self.options.broker_address();
        info!("Connecting to MQTT broker {}:{}", host, port);

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), CLIENT_CAPACITY);
        tokio::time::timeout(self.connect_timeout, Self::await_connack(&mut eventloop))
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "no CONNACK within {}s",
                    self.connect_timeout.as_secs()
                ))
            })??;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(Self::run_eventloop(eventloop, tx));

        *self.client.lock() = Some(client);
        info!("Connected to MQTT broker {}:{}", host, port);
        Ok(rx)
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(format!("{}: {}", filter, e)))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(format!("{}: {}", topic, e)))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client = self.client.lock().take();
        match client {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| TransportError::Publish(format!("disconnect: {}", e))),
            None => Ok(()),
        }
    }
}
