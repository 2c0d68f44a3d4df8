//! Bounded outbound message queue and human-readable reports.
//!
//! Every publish from the model, config store and publisher goes through
//! this queue; the MQTT runner drains it when the broker is reachable. The
//! queue is bounded: when full the oldest message is dropped and the drop
//! count is reported once the queue recovers.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::fixed::FixedConfig;

/// Maximum queued messages before the oldest is dropped.
pub const MAX_QUEUED: usize = 1000;

/// Maximum topic + payload size accepted into the queue.
pub const MAX_MESSAGE_LEN: usize = 512;

/// A message waiting for the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Destination topic.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Retain flag for the broker.
    pub retain: bool,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<QueuedMessage>,
    dropped: u64,
    oversize: u64,
}

/// The process-wide outbound queue.
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    base_topic: String,
    report_channel: Option<String>,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    /// Create a queue using the build-time fixed configuration.
    pub fn new() -> Self {
        Self::with_fixed(&FixedConfig::default())
    }

    /// Create a queue for an explicit fixed configuration.
    pub fn with_fixed(fixed: &FixedConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            base_topic: fixed.topic.as_str().to_string(),
            report_channel: fixed
                .has_report_channel()
                .then(|| fixed.report_channel.as_str().to_string()),
        }
    }

    /// Queue a message for the broker.
    ///
    /// Oversized messages are rejected and counted; when the queue is full
    /// the oldest message is dropped and counted.
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>, retain: bool) {
        let topic = topic.into();
        let payload = payload.into();

        let mut inner = self.inner.lock().unwrap();
        if topic.len() + payload.len() > MAX_MESSAGE_LEN {
            inner.oversize += 1;
            log::warn!(target: "network", "rejecting oversized message for {}", topic);
            return;
        }

        if inner.queue.len() >= MAX_QUEUED {
            inner.queue.pop_front();
            inner.dropped += 1;
        }
        inner.queue.push_back(QueuedMessage {
            topic,
            payload,
            retain,
        });
    }

    /// Emit a human-readable report: a log line, plus a message to the
    /// configured report channel when one is set.
    pub fn report(&self, tag: &str, message: &str) {
        log::info!(target: "report", "{}: {}", tag, message);

        if let Some(channel) = &self.report_channel {
            let payload = serde_json::json!({
                "to": channel,
                "message": format!("{}: {}", self.base_topic, message),
            });
            self.publish("irc/send", payload.to_string(), false);
        }
    }

    /// Take the next queued message, if any.
    pub fn pop(&self) -> Option<QueuedMessage> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take and reset the overflow drop count (reported on recovery).
    pub fn take_dropped(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.dropped)
    }

    /// Oversized messages rejected since boot.
    pub fn oversize_count(&self) -> u64 {
        self.inner.lock().unwrap().oversize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_pop_in_order() {
        let queue = OutboundQueue::new();
        queue.publish("a", "1", false);
        queue.publish("b", "2", true);

        let first = queue.pop().unwrap();
        assert_eq!(first.topic, "a");
        assert!(!first.retain);

        let second = queue.pop().unwrap();
        assert_eq!(second.topic, "b");
        assert!(second.retain);

        assert!(queue.pop().is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = OutboundQueue::new();
        for i in 0..(MAX_QUEUED + 5) {
            queue.publish("t", i.to_string(), false);
        }
        assert_eq!(queue.len(), MAX_QUEUED);
        assert_eq!(queue.take_dropped(), 5);
        assert_eq!(queue.take_dropped(), 0);

        // The oldest messages are the ones missing
        assert_eq!(queue.pop().unwrap().payload, b"5".to_vec());
    }

    #[test]
    fn oversize_rejected() {
        let queue = OutboundQueue::new();
        queue.publish("t", vec![0u8; MAX_MESSAGE_LEN + 1], false);
        assert!(queue.is_empty());
        assert_eq!(queue.oversize_count(), 1);
    }

    #[test]
    fn report_without_channel_only_logs() {
        let queue = OutboundQueue::new();
        queue.report("lights", "All = off");
        assert!(queue.is_empty());
    }

    #[test]
    fn report_with_channel_queues_json() {
        let fixed = FixedConfig::default()
            .with_topic("house/lights")
            .with_report_channel("#home");
        let queue = OutboundQueue::with_fixed(&fixed);

        queue.report("lights", "Light 5 = 100");
        let msg = queue.pop().unwrap();
        assert_eq!(msg.topic, "irc/send");

        let value: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(value["to"], "#home");
        assert_eq!(value["message"], "house/lights: Light 5 = 100");
    }
}
