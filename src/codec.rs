//! Bus frame types, command constants and bit-exact pulse encoding.
//!
//! A forward frame is 1 start bit (logical 1), 8 address bits and 8 data
//! bits, MSB first. Every bit is Manchester coded as two half-bit cells of
//! opposite polarity: a rising edge in the middle of the cell pair encodes
//! a 1, a falling edge a 0. After the data bits the line rests at idle for
//! 2 stop half-bits plus a minimum 11 half-bit inter-frame gap.
//!
//! The line is driven through an inverting opto-isolator; the idle level on
//! the output pin is high.
//!
//! # Example
//!
//! ```rust
//! use luxbus::codec::{encode_pulses, Frame};
//!
//! // Direct power level 200 to address 0
//! let frame = Frame::level(0, 200);
//! assert_eq!(frame.address_byte, 0x00);
//! assert_eq!(frame.data_byte, 200);
//!
//! let pulses = encode_pulses(&frame);
//! // Every frame ends back at the idle level
//! assert!(pulses.last().unwrap().level);
//! ```

use crate::traits::{Clock, Pulse, PulseTransmitter};

/// Highest addressable fixture on the bus.
pub const MAX_ADDR: u8 = 63;
/// Highest group id usable in group-addressed frames.
pub const MAX_GROUP: u8 = 15;
/// Highest drive level; 255 is reserved as the no-change sentinel.
pub const MAX_LEVEL: u8 = 254;

/// Half-bit cell duration in microseconds.
///
/// 1200 baud is 416.7 us per half bit; rounding up keeps the inter-frame
/// gap above the minimum at the slow end of the +/-10% tolerance.
pub const HALF_BIT_US: u32 = 417;

/// Half-bit cells of idle after the data bits: 2 stop + 11 line idle.
pub const IDLE_HALF_BITS: u16 = 13;

/// Data half-bit cells per frame: (1 start + 16 data bits) * 2.
pub const DATA_HALF_BITS: u16 = 34;

/// Nominal wall-clock duration of one frame, including the idle gap.
pub const FRAME_TIME_US: u32 = (DATA_HALF_BITS as u32 + IDLE_HALF_BITS as u32) * HALF_BIT_US;

/// Bus command opcodes used by the controller.
pub mod commands {
    /// Copy the fixture's actual level into its data transfer register.
    pub const STORE_ACTUAL_LEVEL_IN_DTR: u8 = 0x21;
    /// Program the system-failure level from the DTR.
    pub const SET_SYSTEM_FAILURE_LEVEL_FROM_DTR: u8 = 0x2C;
    /// Program the power-on level from the DTR.
    pub const SET_POWER_ON_LEVEL_FROM_DTR: u8 = 0x2D;

    /// Add the addressed fixture to group `g`.
    pub const fn add_to_group(g: u8) -> u8 {
        0x60 + (g & 0x0F)
    }

    /// Remove the addressed fixture from group `g`.
    pub const fn remove_from_group(g: u8) -> u8 {
        0x70 + (g & 0x0F)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One forward frame: an address byte, a data byte and the repeat flag.
///
/// Commands that change non-volatile parameters or group membership are
/// sent twice back to back (`repeat = true`); level frames are sent once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    /// The address byte, encoding target and level/command selection.
    pub address_byte: u8,
    /// The level or command opcode.
    pub data_byte: u8,
    /// Send the frame twice back to back.
    pub repeat: bool,
}

impl Frame {
    /// Direct power level to a single address.
    pub fn level(address: u8, level: u8) -> Self {
        Self {
            address_byte: (address & MAX_ADDR) << 1,
            data_byte: level,
            repeat: false,
        }
    }

    /// Direct power level to a group.
    pub fn group_level(group: u8, level: u8) -> Self {
        Self {
            address_byte: 0x80 | ((group & MAX_GROUP) << 1),
            data_byte: level,
            repeat: false,
        }
    }

    /// Command to a single address.
    pub fn command(address: u8, command: u8) -> Self {
        Self {
            address_byte: ((address & MAX_ADDR) << 1) | 1,
            data_byte: command,
            repeat: false,
        }
    }

    /// Command to a group.
    pub fn group_command(group: u8, command: u8) -> Self {
        Self {
            address_byte: 0x80 | ((group & MAX_GROUP) << 1) | 1,
            data_byte: command,
            repeat: false,
        }
    }

    /// Broadcast command to every fixture.
    pub fn broadcast(command: u8) -> Self {
        Self {
            address_byte: 0xFF,
            data_byte: command,
            repeat: false,
        }
    }

    /// Mark the frame for back-to-back repetition.
    pub fn repeated(mut self) -> Self {
        self.repeat = true;
        self
    }
}

// ============================================================================
// Pulse encoding
// ============================================================================

/// Maximum pulses per encoded frame after merging adjacent equal levels.
pub const MAX_PULSES: usize = DATA_HALF_BITS as usize + 1;

/// Encode a frame into the pulse train that drives the output pin.
///
/// Adjacent half-bit cells at the same level are merged into one pulse so
/// the train fits hardware pulse queues. The final pulse is always the
/// idle-level tail covering the stop half-bits and the inter-frame gap.
pub fn encode_pulses(frame: &Frame) -> heapless::Vec<Pulse, MAX_PULSES> {
    let mut pulses: heapless::Vec<Pulse, MAX_PULSES> = heapless::Vec::new();

    let mut push = |level: bool, half_bits: u16| {
        if let Some(last) = pulses.last_mut() {
            if last.level == level {
                last.half_bits += half_bits;
                return;
            }
        }
        // Cannot overflow MAX_PULSES: 35 cells merge to at most 35 pulses.
        let _ = pulses.push(Pulse::new(level, half_bits));
    };

    let mut push_bit = |bit: bool| {
        // 1 = low then high (rising edge), 0 = high then low (falling edge)
        push(!bit, 1);
        push(bit, 1);
    };

    push_bit(true); // start bit

    for byte in [frame.address_byte, frame.data_byte] {
        for i in (0..8).rev() {
            push_bit(byte & (1 << i) != 0);
        }
    }

    push(true, IDLE_HALF_BITS);

    pulses
}

// ============================================================================
// FrameSink
// ============================================================================

/// The seam between the scheduler and the physical bus.
///
/// The scheduler only ever emits [`Frame`]s; [`BusCodec`] turns them into
/// pulses while the mock records them for test assertions.
pub trait FrameSink {
    /// True if a frame can be sent right now.
    fn ready(&mut self) -> bool;

    /// Send a frame, blocking for its duration. Returns false if the bus
    /// was not ready; the caller retries on its next pass.
    fn send(&mut self, frame: Frame) -> bool;

    /// Nominal single-frame duration, for the scheduler's sleep budget.
    fn frame_time_us(&self) -> u32 {
        FRAME_TIME_US
    }
}

/// Transmit timing statistics, published in the status report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames transmitted since boot.
    pub count: u64,
    /// Shortest observed transmit duration in microseconds.
    pub min_us: u64,
    /// Longest observed transmit duration in microseconds.
    pub max_us: u64,
    /// Total time spent transmitting in microseconds.
    pub total_us: u64,
}

impl FrameStats {
    fn record(&mut self, duration_us: u64) {
        if self.count == 0 || duration_us < self.min_us {
            self.min_us = duration_us;
        }
        if duration_us > self.max_us {
            self.max_us = duration_us;
        }
        self.count += 1;
        self.total_us += duration_us;
    }
}

// ============================================================================
// BusCodec
// ============================================================================

/// How long `send` waits for the transmitter to become ready before
/// deferring the frame to the next scheduler pass.
const READY_TIMEOUT_US: u64 = 5_000;

/// Drives frames onto the wire through a [`PulseTransmitter`].
///
/// `send` blocks until the line is idle, emits the framed bit pattern
/// (twice for repeat frames) and returns with the minimum inter-frame gap
/// already elapsed, because the encoded train ends with the idle tail.
pub struct BusCodec<T, C> {
    tx: T,
    clock: C,
    stats: FrameStats,
}

impl<T: PulseTransmitter, C: Clock> BusCodec<T, C> {
    /// Create a codec over a transmitter, setting the line to idle.
    pub fn new(mut tx: T, clock: C) -> Self {
        tx.set_idle_level(true);
        Self {
            tx,
            clock,
            stats: FrameStats::default(),
        }
    }

    /// Transmit timing statistics since boot.
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Access the underlying transmitter (used by tests).
    pub fn transmitter(&self) -> &T {
        &self.tx
    }
}

impl<T: PulseTransmitter, C: Clock> FrameSink for BusCodec<T, C> {
    fn ready(&mut self) -> bool {
        self.tx.ready()
    }

    fn send(&mut self, frame: Frame) -> bool {
        let start = self.clock.now_us();

        while !self.tx.ready() {
            if self.clock.now_us() - start > READY_TIMEOUT_US {
                return false;
            }
            std::thread::yield_now();
        }

        let pulses = encode_pulses(&frame);
        let sends = if frame.repeat { 2 } else { 1 };

        for _ in 0..sends {
            if !self.tx.transmit(&pulses) {
                return false;
            }
        }

        self.stats.record(self.clock.now_us() - start);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MockClock, MockPulseTransmitter};

    // =========================================================================
    // Frame byte layout
    // =========================================================================

    #[test]
    fn level_frame_layout() {
        let f = Frame::level(0, 200);
        assert_eq!((f.address_byte, f.data_byte), (0x00, 200));

        let f = Frame::level(1, 150);
        assert_eq!((f.address_byte, f.data_byte), (0x02, 150));

        let f = Frame::level(2, 100);
        assert_eq!((f.address_byte, f.data_byte), (0x04, 100));

        let f = Frame::level(63, 254);
        assert_eq!((f.address_byte, f.data_byte), (0x7E, 254));
    }

    #[test]
    fn group_level_frame_layout() {
        let f = Frame::group_level(3, 130);
        assert_eq!((f.address_byte, f.data_byte), (0x86, 130));

        let f = Frame::group_level(15, 0);
        assert_eq!(f.address_byte, 0x9E);
    }

    #[test]
    fn command_frame_layout() {
        let f = Frame::command(5, commands::add_to_group(2));
        assert_eq!((f.address_byte, f.data_byte), (0x0B, 0x62));

        let f = Frame::group_command(1, commands::remove_from_group(1));
        assert_eq!((f.address_byte, f.data_byte), (0x83, 0x71));
    }

    #[test]
    fn broadcast_frame_layout() {
        let f = Frame::broadcast(commands::STORE_ACTUAL_LEVEL_IN_DTR);
        assert_eq!((f.address_byte, f.data_byte), (0xFF, 0x21));
    }

    #[test]
    fn repeated_sets_flag() {
        let f = Frame::command(0, commands::SET_POWER_ON_LEVEL_FROM_DTR).repeated();
        assert!(f.repeat);
        assert!(!Frame::level(0, 0).repeat);
    }

    // =========================================================================
    // Pulse encoding
    // =========================================================================

    fn total_half_bits(pulses: &[Pulse]) -> u32 {
        pulses.iter().map(|p| p.half_bits as u32).sum()
    }

    /// Expand a merged pulse train back into per-half-bit levels.
    fn expand(pulses: &[Pulse]) -> Vec<bool> {
        let mut cells = Vec::new();
        for p in pulses {
            for _ in 0..p.half_bits {
                cells.push(p.level);
            }
        }
        cells
    }

    /// Decode the data half-bit cells back into (address, data).
    fn decode(pulses: &[Pulse]) -> (u8, u8) {
        let cells = expand(pulses);
        let mut bits = Vec::new();
        for pair in cells[..DATA_HALF_BITS as usize].chunks(2) {
            // rising = 1, falling = 0
            bits.push(!pair[0] && pair[1]);
        }
        assert!(bits[0], "start bit must be 1");
        let byte = |range: &[bool]| range.iter().fold(0u8, |acc, &b| (acc << 1) | b as u8);
        (byte(&bits[1..9]), byte(&bits[9..17]))
    }

    #[test]
    fn frame_length_is_exact() {
        let pulses = encode_pulses(&Frame::level(0, 0));
        assert_eq!(
            total_half_bits(&pulses),
            DATA_HALF_BITS as u32 + IDLE_HALF_BITS as u32
        );
    }

    #[test]
    fn frame_ends_at_idle() {
        let pulses = encode_pulses(&Frame::level(63, 254));
        let last = pulses.last().unwrap();
        assert!(last.level);
        assert!(last.half_bits >= IDLE_HALF_BITS);
    }

    #[test]
    fn encode_decode_round_trip() {
        for (addr, level) in [(0u8, 200u8), (1, 150), (2, 100), (63, 0), (17, 254)] {
            let frame = Frame::level(addr, level);
            let pulses = encode_pulses(&frame);
            assert_eq!(decode(&pulses), (frame.address_byte, frame.data_byte));
        }
    }

    #[test]
    fn encode_broadcast_all_ones_address() {
        let pulses = encode_pulses(&Frame::broadcast(0x21));
        assert_eq!(decode(&pulses), (0xFF, 0x21));
    }

    #[test]
    fn zero_byte_alternates() {
        // Address byte 0 is eight 0-bits: each cell pair must be high-low.
        let pulses = encode_pulses(&Frame::level(0, 0));
        let cells = expand(&pulses);
        // Skip the start bit (cells 0..2 = low, high)
        assert!(!cells[0] && cells[1]);
        for pair in cells[2..DATA_HALF_BITS as usize].chunks(2) {
            assert!(pair[0] && !pair[1]);
        }
    }

    #[test]
    fn nominal_frame_time() {
        assert_eq!(FRAME_TIME_US, 47 * 417);
    }

    // =========================================================================
    // BusCodec
    // =========================================================================

    #[test]
    fn codec_sends_once() {
        let clock = MockClock::new();
        let mut codec = BusCodec::new(MockPulseTransmitter::new(), clock);

        assert!(codec.send(Frame::level(5, 100)));
        assert_eq!(codec.transmitter().trains.len(), 1);
        assert_eq!(codec.stats().count, 1);
    }

    #[test]
    fn codec_sends_repeat_twice() {
        let clock = MockClock::new();
        let mut codec = BusCodec::new(MockPulseTransmitter::new(), clock);

        assert!(codec.send(Frame::command(5, commands::add_to_group(3)).repeated()));
        assert_eq!(codec.transmitter().trains.len(), 2);
        assert_eq!(codec.transmitter().trains[0], codec.transmitter().trains[1]);
        // A repeated frame is one logical transmit in the stats
        assert_eq!(codec.stats().count, 1);
    }

    #[test]
    fn codec_defers_when_not_ready() {
        let clock = MockClock::new();
        let mut tx = MockPulseTransmitter::new();
        tx.ready = false;
        let mut codec = BusCodec::new(tx, clock);

        assert!(!codec.send(Frame::level(0, 0)));
        assert_eq!(codec.transmitter().trains.len(), 0);
        assert_eq!(codec.stats().count, 0);
    }

    #[test]
    fn codec_sets_idle_level_on_construction() {
        let codec = BusCodec::new(MockPulseTransmitter::new(), MockClock::new());
        assert_eq!(codec.transmitter().idle_level, Some(true));
    }

    #[test]
    fn stats_track_min_max() {
        let mut stats = FrameStats::default();
        stats.record(100);
        stats.record(50);
        stats.record(200);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_us, 50);
        assert_eq!(stats.max_us, 200);
        assert_eq!(stats.total_us, 350);
    }
}
