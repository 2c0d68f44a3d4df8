//! High-resolution time source for ESP32.

use crate::traits::Clock;

/// [`Clock`] backed by the esp-idf high-resolution timer.
///
/// `esp_timer_get_time` is monotonic from boot and safe from any task.
#[derive(Clone, Copy, Default)]
pub struct Esp32Clock;

impl Esp32Clock {
    /// Create the clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for Esp32Clock {
    fn now_us(&self) -> u64 {
        unsafe { esp_idf_svc::sys::esp_timer_get_time() as u64 }
    }
}
