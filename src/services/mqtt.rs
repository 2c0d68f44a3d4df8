//! Desktop MQTT client adapter (rumqttc + tokio).
//!
//! Bridges the async `rumqttc` client onto the sync [`MqttClient`] trait so
//! the same [`MqttRunner`](crate::services::MqttRunner) drives the desktop
//! bridge binary and soak tests. A background thread owns the tokio
//! runtime and the event loop; the sync side talks to it over channels.
//!
//! The broker is treated as best effort: QoS 0 everywhere, reconnects
//! handled by the event loop with a fixed backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};

use crate::fixed::FixedConfig;
use crate::traits::{MqttClient, MqttMessage};

/// MQTT-related errors.
#[derive(Debug)]
pub enum MqttError {
    /// The background event loop is gone.
    Disconnected,
    /// A subscribe request could not be queued.
    Subscribe(String),
    /// A publish request could not be queued.
    Publish(String),
}

impl std::fmt::Display for MqttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "MQTT event loop stopped"),
            Self::Subscribe(e) => write!(f, "MQTT subscribe error: {}", e),
            Self::Publish(e) => write!(f, "MQTT publish error: {}", e),
        }
    }
}

impl std::error::Error for MqttError {}

enum Command {
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Subscribe(String),
}

/// A [`MqttClient`] backed by rumqttc.
pub struct RumqttcClient {
    command_tx: tokio::sync::mpsc::Sender<Command>,
    message_rx: Receiver<MqttMessage>,
    connected: Arc<AtomicBool>,
    reconnected: Arc<AtomicBool>,
}

impl RumqttcClient {
    /// Connect to the configured broker and start the event loop thread.
    pub fn connect(fixed: &FixedConfig, client_id: &str) -> Self {
        let mut options = MqttOptions::new(client_id, fixed.mqtt_host.as_str(), fixed.mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));

        let (command_tx, mut command_rx) = tokio::sync::mpsc::channel::<Command>(64);
        let (message_tx, message_rx) = channel::<MqttMessage>();
        let connected = Arc::new(AtomicBool::new(false));
        let reconnected = Arc::new(AtomicBool::new(false));

        let connected_worker = Arc::clone(&connected);
        let reconnected_worker = Arc::clone(&reconnected);

        std::thread::spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        log::error!(target: "network", "tokio runtime: {}", e);
                        return;
                    }
                };

                runtime.block_on(async move {
                    let (client, mut eventloop) = AsyncClient::new(options, 64);

                    loop {
                        tokio::select! {
                            event = eventloop.poll() => match event {
                                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                    log::info!(target: "network", "MQTT connected");
                                    connected_worker.store(true, Ordering::SeqCst);
                                    reconnected_worker.store(true, Ordering::SeqCst);
                                }
                                Ok(Event::Incoming(Packet::Publish(publish))) => {
                                    let _ = message_tx.send(MqttMessage::new(
                                        publish.topic.clone(),
                                        publish.payload.to_vec(),
                                    ));
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    log::warn!(target: "network", "MQTT error: {}", e);
                                    connected_worker.store(false, Ordering::SeqCst);
                                    tokio::time::sleep(Duration::from_secs(1)).await;
                                }
                            },
                            command = command_rx.recv() => match command {
                                Some(Command::Publish { topic, payload, retain }) => {
                                    let _ = client
                                        .publish(topic, QoS::AtMostOnce, retain, payload)
                                        .await;
                                }
                                Some(Command::Subscribe(topic)) => {
                                    let _ = client.subscribe(topic, QoS::AtMostOnce).await;
                                }
                                None => break,
                            },
                        }
                    }
                });
            });

        Self {
            command_tx,
            message_rx,
            connected,
            reconnected,
        }
    }
}

impl MqttClient for RumqttcClient {
    type Error = MqttError;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), MqttError> {
        self.command_tx
            .blocking_send(Command::Publish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retain,
            })
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.command_tx
            .blocking_send(Command::Subscribe(topic.to_string()))
            .map_err(|e| MqttError::Subscribe(e.to_string()))
    }

    fn try_recv(&mut self) -> Option<MqttMessage> {
        match self.message_rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn take_reconnected(&mut self) -> bool {
        self.reconnected.swap(false, Ordering::SeqCst)
    }
}
