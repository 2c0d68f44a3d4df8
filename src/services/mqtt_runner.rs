//! Glue between an [`MqttClient`], the command router and the outbound
//! queue.
//!
//! The runner is polled from the broker I/O thread:
//!
//! - on every (re)connect it replays the subscription list and restarts the
//!   startup handshake
//! - inbound messages route through [`Api::receive`]
//! - the outbound queue drains to the broker, reporting any overflow drops
//!   that happened while the broker was unreachable
//! - the optional [`Publisher`] ticks for retained-state publishing

use std::sync::Arc;

use crate::services::{Api, OutboundQueue, Publisher};
use crate::traits::MqttClient;

/// The broker-side service runner.
pub struct MqttRunner<C: MqttClient> {
    client: C,
    api: Arc<Api>,
    outbound: Arc<OutboundQueue>,
    publisher: Option<Publisher>,
}

impl<C: MqttClient> MqttRunner<C> {
    /// Create the runner. `publisher` is `None` for the remote backend.
    pub fn new(
        client: C,
        api: Arc<Api>,
        outbound: Arc<OutboundQueue>,
        publisher: Option<Publisher>,
    ) -> Self {
        Self {
            client,
            api,
            outbound,
            publisher,
        }
    }

    /// Access the client (tests inspect the mock here).
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Mutable access to the client.
    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// One service iteration: subscriptions, inbound, outbound, publisher.
    pub fn poll(&mut self) {
        if self.client.take_reconnected() {
            for topic in self.api.subscriptions() {
                if self.client.subscribe(&topic).is_err() {
                    log::warn!(target: "network", "subscribe failed: {}", topic);
                }
            }
            self.api.on_connected();
        }

        while let Some(msg) = self.client.try_recv() {
            self.api.receive(&msg.topic, &msg.payload);
        }

        if !self.client.is_connected() {
            return;
        }

        let dropped = self.outbound.take_dropped();
        if dropped > 0 {
            self.outbound
                .report("network", &format!("Dropped {} queued messages", dropped));
        }

        while let Some(msg) = self.outbound.pop() {
            if self
                .client
                .publish(&msg.topic, &msg.payload, msg.retain)
                .is_err()
            {
                log::warn!(target: "network", "publish failed: {}", msg.topic);
                break;
            }
        }

        if let Some(publisher) = &mut self.publisher {
            publisher.tick();
        }
    }
}
