//! Hardware abstraction layer: desktop mocks and ESP32 implementations.
//!
//! The [`mock`] module is always available and backs the host test suite
//! and the desktop bridge. The `esp32` module (feature `esp32`) maps the
//! same traits onto esp-idf peripherals.

pub mod mock;

pub use mock::{
    MockClock, MockEncoder, MockFrameSink, MockLine, MockMqtt, MockPulseTransmitter, MockRetained,
    MockSelector,
};

#[cfg(feature = "esp32")]
pub mod esp32;

use crate::traits::Clock;
use std::time::Instant;

/// Wall-clock [`Clock`] backed by `std::time::Instant`.
///
/// The default time source on desktop; esp-idf's `std` port also backs
/// `Instant` with the high-resolution timer.
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    /// Create a clock with its epoch at construction time.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}
