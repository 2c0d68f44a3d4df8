//! Mock implementations for testing without hardware.
//!
//! This module provides test doubles for all hardware and network traits,
//! enabling development and testing on desktop without physical hardware.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockClock`] | [`Clock`] | Controllable time source |
//! | [`MockPulseTransmitter`] | [`PulseTransmitter`] | Records pulse trains |
//! | [`MockFrameSink`] | [`FrameSink`] | Records scheduler frames |
//! | [`MockLine`] | [`RawLine`] | Scripted GPIO line values |
//! | [`MockEncoder`] | [`EncoderInput`] | Queued rotation deltas |
//! | [`MockSelector`] | [`SelectorInput`] | Fixed selector position |
//! | [`MockRetained`] | [`RetainedMemory`] | In-memory retained regions |
//! | [`MockMqtt`] | [`MqttClient`] | Captures pub/sub operations |
//!
//! # Example
//!
//! ```rust
//! use luxbus::hal::{MockFrameSink, MockClock};
//! use luxbus::codec::{Frame, FrameSink};
//!
//! let mut sink = MockFrameSink::new();
//! sink.send(Frame::level(0, 128));
//! assert_eq!(sink.frames, vec![Frame::level(0, 128)]);
//! ```
//!
//! [`Clock`]: crate::traits::Clock
//! [`PulseTransmitter`]: crate::traits::PulseTransmitter
//! [`FrameSink`]: crate::codec::FrameSink
//! [`RawLine`]: crate::inputs::RawLine
//! [`EncoderInput`]: crate::traits::EncoderInput
//! [`SelectorInput`]: crate::traits::SelectorInput
//! [`RetainedMemory`]: crate::traits::RetainedMemory
//! [`MqttClient`]: crate::traits::MqttClient

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::{Frame, FrameSink};
use crate::inputs::RawLine;
use crate::traits::{
    Clock, EncoderDebugRecord, EncoderInput, MqttClient, MqttMessage, Pulse, PulseTransmitter,
    RetainedMemory, RetainedRegion, SelectorInput,
};

// ============================================================================
// Clock
// ============================================================================

/// Controllable time source for tests.
///
/// Clones share the same time base. Every read advances the clock by one
/// microsecond so that busy-wait loops always make progress in tests.
#[derive(Clone)]
pub struct MockClock {
    now_us: Arc<AtomicU64>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self {
            now_us: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Advance the clock.
    pub fn advance_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        self.now_us.fetch_add(1, Ordering::SeqCst)
    }
}

// ============================================================================
// Bus output
// ============================================================================

/// Records every transmitted pulse train.
#[derive(Debug, Default)]
pub struct MockPulseTransmitter {
    /// Transmitted pulse trains, in order.
    pub trains: Vec<Vec<Pulse>>,
    /// Whether the transmitter reports ready.
    pub ready: bool,
    /// The configured idle level, if set.
    pub idle_level: Option<bool>,
}

impl MockPulseTransmitter {
    /// Create a ready transmitter.
    pub fn new() -> Self {
        Self {
            trains: Vec::new(),
            ready: true,
            idle_level: None,
        }
    }
}

impl PulseTransmitter for MockPulseTransmitter {
    fn set_idle_level(&mut self, level: bool) {
        self.idle_level = Some(level);
    }

    fn ready(&self) -> bool {
        self.ready
    }

    fn transmit(&mut self, pulses: &[Pulse]) -> bool {
        if !self.ready {
            return false;
        }
        self.trains.push(pulses.to_vec());
        true
    }
}

/// Records every frame the scheduler emits.
///
/// Repeat frames are recorded once with their `repeat` flag set, so tests
/// can assert on logical transmissions.
#[derive(Debug, Default)]
pub struct MockFrameSink {
    /// Sent frames, in order.
    pub frames: Vec<Frame>,
    /// Whether the sink accepts frames; when false, `send` fails and
    /// nothing is recorded.
    pub ready: bool,
}

impl MockFrameSink {
    /// Create a ready sink.
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            ready: true,
        }
    }

    /// Forget recorded frames.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl FrameSink for MockFrameSink {
    fn ready(&mut self) -> bool {
        self.ready
    }

    fn send(&mut self, frame: Frame) -> bool {
        if !self.ready {
            return false;
        }
        self.frames.push(frame);
        true
    }
}

// ============================================================================
// Input lines
// ============================================================================

/// Scripted raw GPIO line.
///
/// `set` changes the value the line reads from then on.
#[derive(Debug, Default)]
pub struct MockLine {
    value: bool,
}

impl MockLine {
    /// Create a line reading `value`.
    pub fn new(value: bool) -> Self {
        Self { value }
    }

    /// Change the line value.
    pub fn set(&mut self, value: bool) {
        self.value = value;
    }
}

impl RawLine for MockLine {
    fn read(&mut self) -> bool {
        self.value
    }
}

/// Queued rotation deltas and canned debug records.
#[derive(Debug, Default)]
pub struct MockEncoder {
    deltas: VecDeque<i32>,
    /// Debug records returned by `debug_records`.
    pub records: Vec<EncoderDebugRecord>,
}

impl MockEncoder {
    /// Create an encoder with no queued rotation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a rotation delta for the next `read_delta` call.
    pub fn queue_delta(&mut self, delta: i32) {
        self.deltas.push_back(delta);
    }
}

impl EncoderInput for MockEncoder {
    fn read_delta(&mut self) -> i32 {
        self.deltas.pop_front().unwrap_or(0)
    }

    fn debug_records(&self) -> Vec<EncoderDebugRecord> {
        self.records.clone()
    }
}

/// Fixed selector position.
#[derive(Debug, Default)]
pub struct MockSelector {
    /// The reported position.
    pub position: u8,
}

impl SelectorInput for MockSelector {
    fn read(&self) -> u8 {
        self.position
    }
}

// ============================================================================
// Retained memory
// ============================================================================

#[derive(Debug, Default)]
struct RetainedStore {
    levels: Vec<u8>,
    switches: Vec<u8>,
}

/// In-memory retained RAM.
///
/// Clones share the same storage (like the physical RAM shared across a
/// reboot) but carry their own reset-reason flag.
#[derive(Clone)]
pub struct MockRetained {
    store: Arc<Mutex<RetainedStore>>,
    /// Report this boot as a cold (power-on) boot.
    pub power_on: bool,
}

impl Default for MockRetained {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRetained {
    /// Create empty retained storage (warm boot).
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(RetainedStore {
                levels: vec![0; RetainedRegion::Levels.len()],
                switches: vec![0; RetainedRegion::Switches.len()],
            })),
            power_on: false,
        }
    }

    /// Alias of [`new`](Self::new), spelled for tests that clone the handle
    /// to simulate a reboot.
    pub fn shared() -> Self {
        Self::new()
    }

    /// Corrupt one bit of a region.
    pub fn flip_bit(&mut self, region: RetainedRegion, byte: usize, bit: u8) {
        let mut store = self.store.lock().unwrap();
        let buf = match region {
            RetainedRegion::Levels => &mut store.levels,
            RetainedRegion::Switches => &mut store.switches,
        };
        buf[byte] ^= 1 << bit;
    }
}

impl RetainedMemory for MockRetained {
    fn load(&mut self, region: RetainedRegion, buf: &mut [u8]) -> bool {
        let store = self.store.lock().unwrap();
        let src = match region {
            RetainedRegion::Levels => &store.levels,
            RetainedRegion::Switches => &store.switches,
        };
        if buf.len() != src.len() {
            return false;
        }
        buf.copy_from_slice(src);
        true
    }

    fn store(&mut self, region: RetainedRegion, buf: &[u8]) {
        let mut store = self.store.lock().unwrap();
        let dst = match region {
            RetainedRegion::Levels => &mut store.levels,
            RetainedRegion::Switches => &mut store.switches,
        };
        if buf.len() == dst.len() {
            dst.copy_from_slice(buf);
        }
    }

    fn power_on_reset(&self) -> bool {
        self.power_on
    }
}

// ============================================================================
// MQTT
// ============================================================================

/// Captures pub/sub operations and feeds scripted inbound messages.
#[derive(Debug, Default)]
pub struct MockMqtt {
    /// Published messages: (topic, payload, retain).
    pub published: Vec<(String, Vec<u8>, bool)>,
    /// Subscribed topic filters.
    pub subscriptions: Vec<String>,
    /// Connection state reported to the runner.
    pub connected: bool,
    inbound: VecDeque<MqttMessage>,
    reconnected: bool,
}

impl MockMqtt {
    /// Create a connected client that reports one initial (re)connection.
    pub fn new() -> Self {
        Self {
            published: Vec::new(),
            subscriptions: Vec::new(),
            connected: true,
            inbound: VecDeque::new(),
            reconnected: true,
        }
    }

    /// Queue an inbound message.
    pub fn inject(&mut self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.inbound.push_back(MqttMessage::new(topic, payload));
    }

    /// Simulate a broker reconnect.
    pub fn reconnect(&mut self) {
        self.connected = true;
        self.reconnected = true;
    }

    /// Find the last published payload for a topic.
    pub fn last_payload(&self, topic: &str) -> Option<&[u8]> {
        self.published
            .iter()
            .rev()
            .find(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.as_slice())
    }
}

impl MqttClient for MockMqtt {
    type Error = ();

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), ()> {
        self.published
            .push((topic.to_string(), payload.to_vec(), retain));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), ()> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn try_recv(&mut self) -> Option<MqttMessage> {
        self.inbound.pop_front()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn take_reconnected(&mut self) -> bool {
        std::mem::take(&mut self.reconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances_on_read() {
        let clock = MockClock::new();
        let first = clock.now_us();
        let second = clock.now_us();
        assert!(second > first);

        clock.advance_us(1000);
        assert!(clock.now_us() >= first + 1000);
    }

    #[test]
    fn mock_clock_clones_share_time() {
        let clock = MockClock::new();
        let other = clock.clone();
        clock.advance_us(500);
        assert!(other.now_us() >= 500);
    }

    #[test]
    fn mock_frame_sink_records() {
        let mut sink = MockFrameSink::new();
        assert!(sink.send(Frame::level(1, 2)));
        sink.ready = false;
        assert!(!sink.send(Frame::level(3, 4)));
        assert_eq!(sink.frames.len(), 1);
    }

    #[test]
    fn mock_encoder_queues() {
        let mut encoder = MockEncoder::new();
        encoder.queue_delta(5);
        encoder.queue_delta(-3);
        assert_eq!(encoder.read_delta(), 5);
        assert_eq!(encoder.read_delta(), -3);
        assert_eq!(encoder.read_delta(), 0);
    }

    #[test]
    fn mock_retained_clones_share_storage() {
        let mut a = MockRetained::new();
        let mut b = a.clone();

        a.store(RetainedRegion::Switches, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = [0u8; 8];
        assert!(b.load(RetainedRegion::Switches, &mut buf));
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

        // The reset reason is per-handle
        b.power_on = true;
        assert!(!a.power_on_reset());
        assert!(b.power_on_reset());
    }

    #[test]
    fn mock_mqtt_round_trip() {
        let mut mqtt = MockMqtt::new();
        assert!(mqtt.take_reconnected());
        assert!(!mqtt.take_reconnected());

        mqtt.subscribe("lights/#").unwrap();
        mqtt.publish("lights/levels", b"0FF", true).unwrap();
        assert_eq!(mqtt.last_payload("lights/levels"), Some(b"0FF".as_ref()));

        mqtt.inject("lights/set/all", "100");
        let msg = mqtt.try_recv().unwrap();
        assert_eq!(msg.topic, "lights/set/all");
        assert!(mqtt.try_recv().is_none());
    }
}
