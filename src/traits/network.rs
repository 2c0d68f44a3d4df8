//! Network abstraction trait for the MQTT broker connection.
//!
//! The whole remote-control surface is MQTT pub/sub; this trait is the only
//! seam between the topic grammar in [`crate::services`] and a concrete
//! broker client.
//!
//! # Topic layout
//!
//! Using base prefix `lights`:
//!
//! ```text
//! lights/preset/<name>     - Select a preset on a light spec
//! lights/set/<spec>        - Set a literal level
//! lights/group/<name>      - Configure group membership
//! lights/levels            - Published level vector (retained)
//! lights/active/<g>/<p>    - Published active-preset flags (retained)
//! ```
//!
//! See [`crate::services::Api`] for the full grammar.

// ============================================================================
// MQTT Client Trait (Sync-First Design)
// ============================================================================

/// MQTT client trait for pub/sub messaging.
///
/// This trait uses a **sync-first design** that works on both ESP32
/// (blocking I/O) and desktop (wrapped in async by the bridge). The design
/// prioritizes embedded compatibility.
///
/// # Implementation Notes
///
/// - `publish` and `subscribe` are synchronous (blocking on ESP32)
/// - `try_recv` is non-blocking for polling patterns
/// - The client should handle reconnection internally and report it via
///   [`take_reconnected`](MqttClient::take_reconnected) so the service layer
///   can replay subscriptions
pub trait MqttClient {
    /// Error type for MQTT operations.
    type Error;

    /// Publish a message to a topic (blocking).
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), Self::Error>;

    /// Subscribe to a topic (blocking).
    ///
    /// Supports wildcards: `lights/#` or `lights/+/set`
    fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    /// Try to receive the next message (non-blocking).
    ///
    /// Returns `None` if no message is available. This must never block.
    fn try_recv(&mut self) -> Option<MqttMessage>;

    /// Check if connected to the broker.
    fn is_connected(&self) -> bool;

    /// Returns true once after each (re)connection.
    ///
    /// The service layer uses this to replay subscriptions and the startup
    /// handshake.
    fn take_reconnected(&mut self) -> bool;
}

/// An MQTT message received from a subscription.
#[derive(Clone, Debug)]
pub struct MqttMessage {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload as raw bytes.
    pub payload: Vec<u8>,
}

impl MqttMessage {
    /// Create a new MQTT message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Returns the payload as a UTF-8 string, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }
}
