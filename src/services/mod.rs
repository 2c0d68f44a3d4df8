//! Broker-facing services: topic grammar, outbound queue and state publisher.
//!
//! Everything here is platform-agnostic and runs against the
//! [`MqttClient`](crate::traits::MqttClient) trait:
//!
//! - [`Api`]: parses inbound topics into model/config calls
//! - [`OutboundQueue`]: bounded queue of messages awaiting the broker
//! - [`Publisher`]: periodic retained-state publishing with throttling
//! - [`MqttRunner`]: glue that polls a client and drives the above
//!
//! The `mqtt` feature adds a desktop rumqttc adapter for the bridge binary.

mod api;
mod mqtt_runner;
mod outbound;
mod publisher;

#[cfg(feature = "mqtt")]
mod mqtt;

pub use api::Api;
pub use mqtt_runner::MqttRunner;
pub use outbound::{OutboundQueue, QueuedMessage, MAX_MESSAGE_LEN, MAX_QUEUED};
pub use publisher::Publisher;

#[cfg(feature = "mqtt")]
pub use mqtt::RumqttcClient;
