//! Rotary dimmer handling.
//!
//! The encoder ISR accumulates full quadrature cycles into an atomic
//! counter; this runner drains that counter, converts cycles into level
//! steps through the dimmer binding and calls
//! [`dim_adjust`](crate::lights::LightsSink::dim_adjust).
//!
//! The conversion keeps a per-dimmer remainder so slow rotation across
//! several polls still accumulates into whole steps: `encoder_steps` is the
//! cycles-per-step divisor (its sign flips the rotation direction, zero
//! disables the dimmer) and `level_steps` is the level change per step.

use std::sync::Arc;

use crate::codec::MAX_LEVEL;
use crate::config::{ConfigStore, NUM_DIMMERS};
use crate::fixed::FixedConfig;
use crate::lights::LightsSink;
use crate::services::OutboundQueue;
use crate::traits::EncoderInput;

/// The dimmer input runner. Owns the encoder handles and is polled by the
/// dimmer thread.
pub struct Dimmers<E: EncoderInput> {
    encoders: Vec<E>,
    config: Arc<ConfigStore>,
    lights: Arc<dyn LightsSink>,
    accumulated: [i64; NUM_DIMMERS],
}

impl<E: EncoderInput> Dimmers<E> {
    /// Create the runner with one encoder per configured dimmer.
    pub fn new(encoders: Vec<E>, config: Arc<ConfigStore>, lights: Arc<dyn LightsSink>) -> Self {
        Self {
            encoders,
            config,
            lights,
            accumulated: [0; NUM_DIMMERS],
        }
    }

    /// Access an encoder (tests queue deltas here).
    pub fn encoder_mut(&mut self, id: usize) -> &mut E {
        &mut self.encoders[id]
    }

    /// Drain every encoder once.
    pub fn poll_once(&mut self) {
        for id in 0..self.encoders.len().min(NUM_DIMMERS) {
            self.run_dimmer(id);
        }
    }

    fn run_dimmer(&mut self, id: usize) {
        let Some(dimmer) = self.config.get_dimmer(id) else {
            return;
        };

        let change = self.encoders[id].read_delta() as i64;
        if dimmer.encoder_steps == 0 {
            self.accumulated[id] = 0;
            return;
        }
        self.accumulated[id] = self.accumulated[id].saturating_add(change);
        if self.accumulated[id] == 0 {
            return;
        }

        let divisor = (dimmer.encoder_steps as i64).abs();
        let encoder_forward = self.accumulated[id] > 0;
        let steps_forward = dimmer.encoder_steps > 0;

        let mut step_count = self.accumulated[id].abs() / divisor;
        if step_count == 0 {
            return;
        }
        if !encoder_forward {
            step_count = -step_count;
        }
        self.accumulated[id] -= step_count * divisor;

        if !steps_forward {
            step_count = -step_count;
        }

        let level_change = (step_count * dimmer.level_steps as i64)
            .clamp(-(MAX_LEVEL as i64), MAX_LEVEL as i64);
        if level_change != 0 {
            self.lights.dim_adjust(id, level_change);
        }
    }

    /// Dump an encoder's raw edge records to its debug topic.
    pub fn publish_debug(&self, id: usize, outbound: &OutboundQueue, fixed: &FixedConfig) {
        if id >= self.encoders.len() {
            return;
        }
        let topic = fixed.topic(&format!("dimmer/{}/debug_log", id));
        for record in self.encoders[id].debug_records() {
            let pin = match (record.pin, record.state) {
                (0, true) => 'A',
                (0, false) => 'a',
                (_, true) => 'B',
                (_, false) => 'b',
            };
            outbound.publish(topic.clone(), format!("{} {}", record.time_us, pin), false);
        }
    }
}
