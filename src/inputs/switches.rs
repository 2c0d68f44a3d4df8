//! Wall-switch handling.
//!
//! Each switch is a debounced line bound (via [`ConfigStore`]) to a group
//! and optionally a preset. On a stable transition the switch reports the
//! new power state for the group's members; a rising edge on an armed
//! switch also re-applies its preset, because lamps that just regained
//! power come up at their fixture defaults.
//!
//! Debounced positions are mirrored to battery-backed RAM so a warm reboot
//! does not treat the first stable read as a transition.

use std::sync::{Arc, Mutex};

use crate::config::{ConfigStore, NUM_SWITCHES};
use crate::fixed::FixedConfig;
use crate::lights::LightsSink;
use crate::retained::{self, BootStatus, SwitchPositions};
use crate::services::OutboundQueue;
use crate::traits::{Clock, DebouncedLine, RetainedMemory};

const REPUBLISH_PERIOD_US: u64 = 60_000_000;

struct SwitchState {
    report_us: u64,
    value: Option<bool>,
}

/// The switch input runner. Owns the debounced lines and is polled by the
/// input thread.
pub struct Switches<D: DebouncedLine> {
    lines: Vec<D>,
    config: Arc<ConfigStore>,
    lights: Arc<dyn LightsSink>,
    outbound: Arc<OutboundQueue>,
    clock: Arc<dyn Clock + Send + Sync>,
    retained: Mutex<Box<dyn RetainedMemory>>,
    topic_prefix: String,
    state: Vec<SwitchState>,
}

impl<D: DebouncedLine> Switches<D> {
    /// Create the runner. `lines` must have one entry per configured
    /// switch; preload their debouncers with [`restore_positions`]
    /// (Self::restore_positions) before constructing.
    pub fn new(
        lines: Vec<D>,
        config: Arc<ConfigStore>,
        lights: Arc<dyn LightsSink>,
        outbound: Arc<OutboundQueue>,
        clock: Arc<dyn Clock + Send + Sync>,
        retained: Box<dyn RetainedMemory>,
        fixed: &FixedConfig,
    ) -> Self {
        let state = (0..lines.len()).map(|_| SwitchState {
            report_us: 0,
            value: None,
        });
        Self {
            state: state.collect(),
            lines,
            config,
            lights,
            outbound,
            clock,
            retained: Mutex::new(retained),
            topic_prefix: fixed.topic.as_str().to_string(),
        }
    }

    /// Read the saved switch positions, for preloading the debouncers.
    pub fn restore_positions(
        retained: &mut dyn RetainedMemory,
    ) -> (Option<SwitchPositions>, BootStatus) {
        retained::load_switches(retained)
    }

    /// Access a switch's debounced line (tests flip the mock here).
    pub fn line_mut(&mut self, id: usize) -> &mut D {
        &mut self.lines[id]
    }

    /// Poll every switch once. Returns the smallest wait hint in
    /// milliseconds.
    pub fn poll_once(&mut self) -> u32 {
        let mut wait_ms = u32::MAX;
        for id in 0..self.lines.len().min(NUM_SWITCHES) {
            wait_ms = wait_ms.min(self.poll_switch(id));
        }
        wait_ms
    }

    fn poll_switch(&mut self, id: usize) -> u32 {
        let event = self.lines[id].poll();
        let now = self.clock.now_us();

        if event.changed && !event.first {
            self.state[id].value = Some(event.value);
            self.save_positions();
            self.publish_state(id, event.value, now);

            let Some(switch) = self.config.get_switch(id) else {
                return event.wait_ms;
            };
            let name = if switch.name.is_empty() {
                format!("Light switch {}", id)
            } else {
                switch.name.clone()
            };
            self.outbound.report(
                "switch",
                &format!(
                    "{} {}{}",
                    name,
                    if event.value { "ON" } else { "OFF" },
                    if switch.armed() && event.value {
                        format!(" (levels reset to {})", switch.preset)
                    } else {
                        String::new()
                    }
                ),
            );

            let members =
                self.config.get_group_addresses(&switch.group) & self.config.get_addresses();
            if members != 0 {
                self.lights.set_power(members, event.value);
            }
            if switch.armed() && event.value {
                self.lights.select_preset(&switch.preset, &switch.group, true);
            }
        } else if let Some(value) = self.state[id].value {
            // Keep the retained topic fresh
            if self.state[id].report_us != 0
                && now.wrapping_sub(self.state[id].report_us) >= REPUBLISH_PERIOD_US
            {
                self.publish_state(id, value, now);
            }
        }

        event.wait_ms
    }

    fn publish_state(&mut self, id: usize, value: bool, now: u64) {
        self.outbound.publish(
            format!("{}/switch/{}/state", self.topic_prefix, id),
            if value { "1" } else { "0" },
            true,
        );
        self.state[id].report_us = now;
    }

    fn save_positions(&self) {
        let mut positions = SwitchPositions::default();
        for (id, state) in self.state.iter().enumerate() {
            if let Some(value) = state.value {
                positions.known |= 1 << id;
                if value {
                    positions.values |= 1 << id;
                }
            }
        }
        let mut retained = self.retained.lock().unwrap();
        retained::save_switches(&mut **retained, positions);
    }
}
