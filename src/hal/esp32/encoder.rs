//! ISR-driven quadrature rotary encoder.
//!
//! Both encoder pins interrupt on any edge. The ISR never takes a lock and
//! never allocates: it updates per-pin active state, runs a 4-phase
//! quadrature matcher and accumulates full cycles into an atomic counter
//! that the dimmer thread drains with an exchange.
//!
//! Two robustness mechanisms learned from the field:
//!
//! - **Phase timeout**: edges more than 125 ms apart never complete a
//!   cycle, so contact shuffle at rest cannot creep the level.
//! - **Auto-polarity**: if a pin reads active for more than 250 ms while
//!   the other is idle, the wiring is treated as inverted for that pin and
//!   the pull direction flipped.
//!
//! A bounded ring of raw edges (two full rotations) is kept for the
//! `dimmer/<id>/get_debug` dump.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use esp_idf_hal::gpio::{AnyIOPin, Input, InterruptType, PinDriver, Pull};

use crate::traits::{EncoderDebugRecord, EncoderInput};

/// One rotation is 100 detents of 4 edges; keep two rotations.
pub const DEBUG_RECORDS: usize = 800;

const PHASE_TIMEOUT_US: u32 = 125_000;
const POLARITY_TIMEOUT_US: u32 = 250_000;

struct Shared {
    delta: AtomicI32,
    state: [AtomicBool; 2],
    inverted: [AtomicBool; 2],
    first: AtomicI32,
    last_edge_us: AtomicU32,
    active_since_us: [AtomicU32; 2],
    debug: Vec<AtomicU32>,
    debug_pos: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            delta: AtomicI32::new(0),
            state: [AtomicBool::new(false), AtomicBool::new(false)],
            inverted: [AtomicBool::new(false), AtomicBool::new(false)],
            first: AtomicI32::new(-1),
            last_edge_us: AtomicU32::new(0),
            active_since_us: [AtomicU32::new(0), AtomicU32::new(0)],
            debug: (0..DEBUG_RECORDS).map(|_| AtomicU32::new(0)).collect(),
            debug_pos: AtomicUsize::new(0),
        }
    }

    fn record_debug(&self, pin: usize, state: bool, now_us: u32) {
        // pin:1 | state:1 | time:30, packed for the lock-free ring
        let packed =
            ((pin as u32) << 31) | ((state as u32) << 30) | (now_us & 0x3FFF_FFFF);
        let pos = self.debug_pos.fetch_add(1, Ordering::Relaxed) % DEBUG_RECORDS;
        self.debug[pos].store(packed, Ordering::Relaxed);
    }

    /// The ISR body; `level_active` is the raw pin level interpreted
    /// through the learned polarity.
    fn edge(&self, pin: usize, raw_low: bool, now_us: u32) {
        let state = raw_low != self.inverted[pin].load(Ordering::Relaxed);

        if state != self.state[pin].load(Ordering::Relaxed) {
            self.state[pin].store(state, Ordering::Relaxed);
            self.record_debug(pin, state, now_us);
        }

        if state {
            self.active_since_us[pin].store(now_us, Ordering::Relaxed);
            if self.first.load(Ordering::Relaxed) == -1 {
                self.first.store(pin as i32, Ordering::Relaxed);
            }
        } else {
            self.first.store(-1, Ordering::Relaxed);
            return;
        }

        // Ignore edges separated by more than the phase timeout
        let last = self.last_edge_us.swap(now_us, Ordering::Relaxed);
        if last != 0 && now_us.wrapping_sub(last) > PHASE_TIMEOUT_US {
            return;
        }

        if !self.state[0].load(Ordering::Relaxed) || !self.state[1].load(Ordering::Relaxed) {
            return;
        }

        // Both pins active: a full A-leads-B or B-leads-A cycle
        match self.first.load(Ordering::Relaxed) {
            0 => {
                self.delta.fetch_add(1, Ordering::Relaxed);
            }
            1 => {
                self.delta.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// A two-pin quadrature encoder with ISR decoding.
pub struct Esp32Encoder<'d> {
    pins: [PinDriver<'d, AnyIOPin, Input>; 2],
    shared: Arc<Shared>,
}

impl<'d> Esp32Encoder<'d> {
    /// Configure both pins with pull-ups and edge interrupts.
    ///
    /// `wake` runs from the ISR after each accumulated cycle; pass a
    /// task-notification trampoline, never anything that can block.
    pub fn new(
        pin_a: AnyIOPin,
        pin_b: AnyIOPin,
        wake: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, esp_idf_hal::sys::EspError> {
        let shared = Arc::new(Shared::new());
        let wake = Arc::new(wake);

        let mut a = PinDriver::input(pin_a)?;
        let mut b = PinDriver::input(pin_b)?;
        a.set_pull(Pull::Up)?;
        b.set_pull(Pull::Up)?;
        a.set_interrupt_type(InterruptType::AnyEdge)?;
        b.set_interrupt_type(InterruptType::AnyEdge)?;

        let mut pins = [a, b];
        for (index, pin) in pins.iter_mut().enumerate() {
            let shared_isr = Arc::clone(&shared);
            let wake_isr = Arc::clone(&wake);
            let pin_num = pin.pin();
            // Safety: the handler only touches atomics and the notification
            unsafe {
                pin.subscribe(move || {
                    let now = esp_idf_svc::sys::esp_timer_get_time() as u32;
                    // Active low behind the pull-up
                    let raw_low = esp_idf_svc::sys::gpio_get_level(pin_num) == 0;
                    shared_isr.edge(index, raw_low, now);
                    wake_isr();
                })?;
            }
            pin.enable_interrupt()?;
        }

        Ok(Self { pins, shared })
    }

    /// Re-learn pin polarity: a pin held active for longer than the
    /// polarity timeout while idle is treated as inverted. Called from the
    /// dimmer thread, not the ISR.
    pub fn maintain_polarity(&mut self) {
        let now = unsafe { esp_idf_svc::sys::esp_timer_get_time() as u32 };
        for pin in 0..2 {
            let since = self.shared.active_since_us[pin].load(Ordering::Relaxed);
            if self.shared.state[pin].load(Ordering::Relaxed)
                && since != 0
                && now.wrapping_sub(since) > POLARITY_TIMEOUT_US
            {
                let inverted = !self.shared.inverted[pin].load(Ordering::Relaxed);
                self.shared.inverted[pin].store(inverted, Ordering::Relaxed);
                self.shared.state[pin].store(false, Ordering::Relaxed);
                let _ = self.pins[pin].set_pull(if inverted { Pull::Down } else { Pull::Up });
                log::warn!(target: "dimmers", "encoder pin {} polarity relearned", pin);
            }
        }
    }
}

impl EncoderInput for Esp32Encoder<'_> {
    fn read_delta(&mut self) -> i32 {
        self.shared.delta.swap(0, Ordering::AcqRel)
    }

    fn debug_records(&self) -> Vec<EncoderDebugRecord> {
        let pos = self.shared.debug_pos.load(Ordering::Relaxed);
        (0..DEBUG_RECORDS)
            .map(|i| {
                let packed = self.shared.debug[(pos + i) % DEBUG_RECORDS].load(Ordering::Relaxed);
                EncoderDebugRecord {
                    pin: (packed >> 31) as u8,
                    state: packed & (1 << 30) != 0,
                    time_us: packed & 0x3FFF_FFFF,
                }
            })
            .collect()
    }
}
