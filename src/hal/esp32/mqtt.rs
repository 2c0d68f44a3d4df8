//! MQTT client for ESP32 (esp-idf-svc).
//!
//! Implements the [`MqttClient`] trait over `EspMqttClient`. A connection
//! thread forwards incoming publishes and connection transitions into
//! channels the broker I/O thread drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS};

use crate::fixed::FixedConfig;
use crate::traits::{MqttClient, MqttMessage};

/// [`MqttClient`] over the esp-idf MQTT stack.
pub struct Esp32Mqtt {
    client: EspMqttClient<'static>,
    message_rx: Receiver<MqttMessage>,
    connected: Arc<AtomicBool>,
    reconnected: Arc<AtomicBool>,
}

impl Esp32Mqtt {
    /// Connect to the configured broker.
    pub fn connect(fixed: &FixedConfig, client_id: &str) -> anyhow::Result<Self> {
        let broker_url = format!("mqtt://{}:{}", fixed.mqtt_host.as_str(), fixed.mqtt_port);
        let id: String = client_id.to_string();

        let config = MqttClientConfiguration {
            client_id: Some(&id),
            keep_alive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let (message_tx, message_rx) = channel::<MqttMessage>();
        let connected = Arc::new(AtomicBool::new(false));
        let reconnected = Arc::new(AtomicBool::new(false));

        let connected_worker = Arc::clone(&connected);
        let reconnected_worker = Arc::clone(&reconnected);

        let (client, mut connection) = EspMqttClient::new(&broker_url, &config)?;

        std::thread::spawn(move || {
            while let Ok(event) = connection.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        log::info!(target: "network", "MQTT connected");
                        connected_worker.store(true, Ordering::SeqCst);
                        reconnected_worker.store(true, Ordering::SeqCst);
                    }
                    EventPayload::Disconnected => {
                        log::warn!(target: "network", "MQTT disconnected");
                        connected_worker.store(false, Ordering::SeqCst);
                    }
                    EventPayload::Received { topic, data, .. } => {
                        if let Some(topic) = topic {
                            let _ = message_tx.send(MqttMessage::new(topic, data.to_vec()));
                        }
                    }
                    _ => {}
                }
            }
            log::warn!(target: "network", "MQTT connection loop ended");
        });

        Ok(Self {
            client,
            message_rx,
            connected,
            reconnected,
        })
    }
}

impl MqttClient for Esp32Mqtt {
    type Error = esp_idf_svc::sys::EspError;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), Self::Error> {
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .map(|_| ())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        self.client.subscribe(topic, QoS::AtMostOnce).map(|_| ())
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
