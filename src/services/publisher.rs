//! Periodic retained-state publishing with throttling.
//!
//! Publishes, once the startup handshake has completed:
//!
//! - the `levels` vector (on change, or at most once per minute)
//! - `active/<group>/<preset>` flags, change-driven plus a rotating
//!   five-entry window once per minute (the full group x preset grid can
//!   be large, so only a slice is refreshed per period)
//! - delayed "dimmed to N" reports once the encoder has been quiet
//! - the uptime, once per minute
//!
//! Only the local backend publishes; a remote-forwarding controller has no
//! authoritative state of its own.

use std::sync::Arc;

use crate::config::ConfigStore;
use crate::fixed::FixedConfig;
use crate::lights::Lights;
use crate::parsing;
use crate::services::OutboundQueue;
use crate::traits::Clock;

/// Active-preset grid entries refreshed per forced period.
const REPUBLISH_PER_PERIOD: usize = 5;

const ACTIVE_PUBLISH_PERIOD_US: u64 = 60_000_000;
const UPTIME_PERIOD_US: u64 = 60_000_000;

/// The retained-state publisher, ticked by the MQTT runner.
pub struct Publisher {
    lights: Arc<Lights>,
    config: Arc<ConfigStore>,
    outbound: Arc<OutboundQueue>,
    clock: Arc<dyn Clock + Send + Sync>,
    topic_prefix: String,
    last_uptime_us: u64,
}

impl Publisher {
    /// Create the publisher for the local backend.
    pub fn new(
        lights: Arc<Lights>,
        outbound: Arc<OutboundQueue>,
        clock: Arc<dyn Clock + Send + Sync>,
        fixed: &FixedConfig,
    ) -> Self {
        Self {
            config: Arc::clone(lights.config()),
            lights,
            outbound,
            clock,
            topic_prefix: fixed.topic.as_str().to_string(),
            last_uptime_us: 0,
        }
    }

    /// Run one publish tick. Call when the broker is reachable.
    pub fn tick(&mut self) {
        if !self.lights.is_startup_complete() {
            return;
        }

        if let Some(payload) = self.lights.take_levels_publish() {
            self.outbound
                .publish(format!("{}/levels", self.topic_prefix), payload, true);
        }

        self.publish_active_presets();
        self.publish_dim_reports();
        self.publish_uptime();
    }

    fn publish_active_presets(&mut self) {
        let now = self.clock.now_us();

        // Take the republish bookkeeping under the publish lock, then build
        // the grid without holding it
        let (groups_to_do, presets_to_do, force, window_start) = {
            let mut publish = self.lights.publish.lock().unwrap();
            let force = publish.last_publish_active_us == 0
                || now.wrapping_sub(publish.last_publish_active_us) >= ACTIVE_PUBLISH_PERIOD_US;
            if !force && publish.republish_groups.is_empty() && publish.republish_presets.is_empty()
            {
                return;
            }
            (
                std::mem::take(&mut publish.republish_groups),
                std::mem::take(&mut publish.republish_presets),
                force,
                publish.publish_index,
            )
        };

        let group_names = self.config.group_names();
        let preset_names = self.config.preset_names();
        let present = self.config.get_addresses();
        let mut index = 0usize;

        for group in &group_names {
            let members = self.config.get_group_addresses(group) & present;
            let republish_group = groups_to_do.contains(group);

            for preset in &preset_names {
                let republish_preset = presets_to_do.contains(preset);
                let in_window = force
                    && index >= window_start
                    && index < window_start + REPUBLISH_PER_PERIOD;

                if republish_group || republish_preset || in_window {
                    let active = self.lights.preset_active_in(preset, members);
                    self.outbound.publish(
                        format!("{}/active/{}/{}", self.topic_prefix, group, preset),
                        if active { "1" } else { "0" },
                        true,
                    );
                }
                index += 1;
            }
        }

        if force {
            let total = (group_names.len() * preset_names.len()).max(1);
            let mut publish = self.lights.publish.lock().unwrap();
            publish.publish_index = (window_start + REPUBLISH_PER_PERIOD) % total;
            publish.last_publish_active_us = now;
        }
    }

    fn publish_dim_reports(&self) {
        let present = self.config.get_addresses();
        for (address, level) in self.lights.take_dim_reports() {
            self.outbound.report(
                "lights",
                &format!(
                    "{} dimmed to {}",
                    parsing::lights_text(parsing::addr_bit(address), present),
                    level
                ),
            );
        }
    }

    fn publish_uptime(&mut self) {
        let now = self.clock.now_us();
        if self.last_uptime_us != 0 && now.wrapping_sub(self.last_uptime_us) < UPTIME_PERIOD_US {
            return;
        }
        self.last_uptime_us = now;
        self.outbound.publish(
            format!("{}/uptime_us", self.topic_prefix),
            now.to_string(),
            false,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MockClock, MockRetained};
    use crate::lights::LightsSink;

    struct Fixture {
        config: Arc<ConfigStore>,
        lights: Arc<Lights>,
        outbound: Arc<OutboundQueue>,
        clock: MockClock,
        publisher: Publisher,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(ConfigStore::new());
        config.set_addresses("0001");
        config.set_group_addresses("hall", "0001").unwrap();
        config.set_preset_level("evening", "all", 128).unwrap();

        let fixed = FixedConfig::default().with_topic("lights");
        let outbound = Arc::new(OutboundQueue::with_fixed(&fixed));
        let clock = MockClock::new();
        let lights = Arc::new(Lights::with_clock(
            Arc::clone(&config),
            Arc::clone(&outbound),
            Box::new(MockRetained::new()),
            Arc::new(clock.clone()),
        ));
        lights.startup_complete(true);

        let publisher = Publisher::new(
            Arc::clone(&lights),
            Arc::clone(&outbound),
            Arc::new(clock.clone()),
            &fixed,
        );

        Fixture {
            config,
            lights,
            outbound,
            clock,
            publisher,
        }
    }

    fn drain(outbound: &OutboundQueue) -> Vec<(String, Vec<u8>, bool)> {
        let mut out = Vec::new();
        while let Some(msg) = outbound.pop() {
            out.push((msg.topic, msg.payload, msg.retain));
        }
        out
    }

    #[test]
    fn nothing_before_startup_complete() {
        let mut fixture = fixture();
        fixture.lights.startup_complete(false);
        fixture.publisher.tick();
        assert!(fixture.outbound.is_empty());
    }

    #[test]
    fn levels_published_on_change_then_throttled() {
        let mut fixture = fixture();
        fixture.lights.set_level("0", 100);
        fixture.publisher.tick();

        let msgs = drain(&fixture.outbound);
        let levels = msgs.iter().find(|(t, _, _)| t == "lights/levels").unwrap();
        assert!(levels.2, "levels topic is retained");
        assert_eq!(&levels.1[0..3], b"164");

        // No change: nothing for a minute
        fixture.publisher.tick();
        assert!(drain(&fixture.outbound)
            .iter()
            .all(|(t, _, _)| t != "lights/levels"));

        fixture.clock.advance_us(61_000_000);
        fixture.publisher.tick();
        assert!(drain(&fixture.outbound)
            .iter()
            .any(|(t, _, _)| t == "lights/levels"));
    }

    #[test]
    fn active_preset_flags_follow_changes() {
        let mut fixture = fixture();
        fixture.lights.select_preset("evening", "all", false);
        fixture.publisher.tick();

        let msgs = drain(&fixture.outbound);
        assert!(msgs
            .iter()
            .any(|(t, p, _)| t == "lights/active/hall/evening" && p == b"1"));

        fixture.lights.set_level("all", 5);
        fixture.publisher.tick();
        let msgs = drain(&fixture.outbound);
        assert!(msgs
            .iter()
            .any(|(t, p, _)| t == "lights/active/hall/evening" && p == b"0"));
        assert!(msgs
            .iter()
            .any(|(t, p, _)| t == "lights/active/hall/custom" && p == b"1"));
    }

    #[test]
    fn forced_window_rotates() {
        let mut fixture = fixture();
        // First tick is forced (never published): publishes a window slice
        fixture.publisher.tick();
        let first = drain(&fixture.outbound);
        let active_count = first
            .iter()
            .filter(|(t, _, _)| t.starts_with("lights/active/"))
            .count();
        assert!(active_count <= REPUBLISH_PER_PERIOD);
        assert!(active_count > 0);
    }

    #[test]
    fn dim_reports_flow_through_tick() {
        let mut fixture = fixture();
        fixture.config.set_dimmer_groups(0, "hall").unwrap();
        fixture.lights.set_level("all", 100);
        fixture.lights.dim_adjust(0, 10);
        drain(&fixture.outbound);

        fixture
            .clock
            .advance_us(crate::lights::DIM_REPORT_DELAY_US);
        fixture.publisher.tick();

        // Both addresses settled at 110; the report goes to the log (and
        // the report channel when configured), so nothing queues here, but
        // the timestamps are consumed.
        assert!(fixture.lights.take_dim_reports().is_empty());
    }

    #[test]
    fn uptime_published_once_per_minute() {
        let mut fixture = fixture();
        fixture.publisher.tick();
        let count = |msgs: &[(String, Vec<u8>, bool)]| {
            msgs.iter()
                .filter(|(t, _, _)| t == "lights/uptime_us")
                .count()
        };
        assert_eq!(count(&drain(&fixture.outbound)), 1);

        fixture.publisher.tick();
        assert_eq!(count(&drain(&fixture.outbound)), 0);

        fixture.clock.advance_us(UPTIME_PERIOD_US);
        fixture.publisher.tick();
        assert_eq!(count(&drain(&fixture.outbound)), 1);
    }
}
