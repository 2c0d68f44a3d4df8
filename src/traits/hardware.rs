//! Hardware abstraction traits for the bus output, input lines and retained RAM.
//!
//! This module defines the hardware interfaces that allow luxbus to work
//! across different platforms (ESP32, desktop mocks, etc.).
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`PulseTransmitter`] | Drives the bus line with timed pulse trains |
//! | [`DebouncedLine`] | Debounced GPIO line for switches and buttons |
//! | [`EncoderInput`] | Quadrature rotary encoder delta counter |
//! | [`SelectorInput`] | Hardware selector position |
//! | [`Clock`] | Monotonic microsecond time source |
//! | [`RetainedMemory`] | Battery-backed RAM regions |
//!
//! # Implementation
//!
//! For testing and desktop development, use the mock implementations
//! from [`crate::hal`]. For ESP32 hardware, use the implementations from
//! `hal::esp32` (requires `esp32` feature).

/// A single pulse on the bus output pin: hold `level` for `half_bits`
/// half-bit cells.
///
/// The half-bit cell duration is fixed by the wire format
/// ([`crate::codec::HALF_BIT_US`]); expressing pulses in half-bit units
/// keeps the encoder independent of the transmitter's clock resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pulse {
    /// Electrical level to drive on the output pin.
    pub level: bool,
    /// Duration in half-bit cells (at least 1).
    pub half_bits: u16,
}

impl Pulse {
    /// Create a pulse holding `level` for `half_bits` half-bit cells.
    pub const fn new(level: bool, half_bits: u16) -> Self {
        Self { level, half_bits }
    }
}

/// Pulse-train output for the lighting bus.
///
/// Implementations queue a sequence of [`Pulse`]s and drive them onto the
/// output pin with half-bit-accurate timing. On ESP32 this maps to the RMT
/// peripheral; the mock records the pulses for inspection.
///
/// # Implementation Notes
///
/// - `transmit` blocks until the final pulse has been driven
/// - After `transmit` returns the pin must be back at the idle level
/// - `ready` must be cheap; the scheduler polls it before every frame
pub trait PulseTransmitter {
    /// Set the electrical level the pin rests at between transmissions.
    fn set_idle_level(&mut self, level: bool);

    /// Returns true if the transmitter can accept a new pulse train now.
    fn ready(&self) -> bool;

    /// Drive the pulse train onto the pin, blocking until complete.
    ///
    /// Returns false if the transmitter was not ready or the train could
    /// not be queued; the caller retries on its next pass.
    fn transmit(&mut self, pulses: &[Pulse]) -> bool;
}

/// A stable (reported) state change on a debounced input line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineEvent {
    /// The debounced logical value of the line.
    pub value: bool,
    /// True if `value` differs from the previously reported stable value.
    pub changed: bool,
    /// True while the line has never reported a stable value before.
    ///
    /// The first stable read after boot is not a transition.
    pub first: bool,
    /// Hint for when the caller should poll again, in milliseconds.
    pub wait_ms: u32,
}

/// Debounced GPIO input line (wall switches, pushbuttons).
///
/// An edge interrupt wakes the owning thread; `poll` runs the debounce
/// window and reports stable transitions. See
/// [`crate::inputs::Debouncer`] for the reusable state machine.
pub trait DebouncedLine {
    /// Sample the line and advance the debounce state machine.
    fn poll(&mut self) -> LineEvent;
}

/// Rotary encoder input.
///
/// Abstracts a quadrature encoder used for dimming. The ISR-side decoding
/// accumulates full quadrature cycles into a counter; positive deltas are
/// clockwise.
pub trait EncoderInput {
    /// Returns accumulated cycles since the last call (positive = clockwise).
    ///
    /// Resets the internal counter (atomic exchange on hardware).
    fn read_delta(&mut self) -> i32;

    /// Raw edge records for diagnostics, oldest first.
    ///
    /// Default implementation returns nothing; hardware backends keep a
    /// bounded ring of recent edges.
    fn debug_records(&self) -> Vec<EncoderDebugRecord> {
        Vec::new()
    }
}

/// One raw encoder edge, for the `dimmer/<id>/get_debug` dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderDebugRecord {
    /// Which of the two encoder pins changed (0 = A, 1 = B).
    pub pin: u8,
    /// The pin's new active state.
    pub state: bool,
    /// Timestamp of the edge, microseconds, truncated to 30 bits.
    pub time_us: u32,
}

/// Hardware selector (rotary position switch read from GPIO).
///
/// Chooses between alternative group lists when a binding's own group list
/// is empty.
pub trait SelectorInput {
    /// Current selector position.
    fn read(&self) -> u8;
}

/// Monotonic time source.
///
/// On desktop this wraps `std::time::Instant`; on ESP32 the high-resolution
/// timer.
pub trait Clock {
    /// Returns current time in microseconds since an arbitrary epoch.
    ///
    /// Must be monotonically increasing.
    fn now_us(&self) -> u64;
}

/// Identifies one of the battery-backed RAM regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetainedRegion {
    /// The 64-byte level vector plus checksum.
    Levels,
    /// Packed switch positions plus checksum.
    Switches,
}

impl RetainedRegion {
    /// Size of the region in bytes, including the checksum word.
    pub const fn len(self) -> usize {
        match self {
            RetainedRegion::Levels => crate::retained::LEVELS_REGION_LEN,
            RetainedRegion::Switches => crate::retained::SWITCHES_REGION_LEN,
        }
    }

    /// Regions are never zero-sized.
    pub const fn is_empty(self) -> bool {
        false
    }
}

/// Battery-backed memory surviving warm reboot but not cold boot.
///
/// The checksum and validity logic lives in [`crate::retained`]; this trait
/// only moves raw bytes and reports the reset cause.
pub trait RetainedMemory: Send {
    /// Copy the region's bytes into `buf`. Returns false if unavailable.
    ///
    /// `buf` must be exactly `region.len()` bytes.
    fn load(&mut self, region: RetainedRegion, buf: &mut [u8]) -> bool;

    /// Write the region's bytes from `buf`.
    fn store(&mut self, region: RetainedRegion, buf: &[u8]);

    /// True if this boot was a cold (first power-on) boot; retained
    /// contents are then discarded.
    fn power_on_reset(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_construction() {
        let p = Pulse::new(true, 3);
        assert!(p.level);
        assert_eq!(p.half_bits, 3);
    }

    #[test]
    fn region_lengths() {
        assert_eq!(RetainedRegion::Levels.len(), 68);
        assert_eq!(RetainedRegion::Switches.len(), 8);
        assert!(!RetainedRegion::Levels.is_empty());
    }

    #[test]
    fn line_event_fields() {
        let ev = LineEvent {
            value: true,
            changed: true,
            first: false,
            wait_ms: 20,
        };
        assert!(ev.value && ev.changed && !ev.first);
        assert_eq!(ev.wait_ms, 20);
    }
}
