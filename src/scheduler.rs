//! The bus driver: converts the light model into a stream of frames.
//!
//! The scheduler owns a cache of what it believes the bus already holds
//! (`tx_levels`, `tx_group_levels`, `tx_group_members`) and each pass emits
//! only the difference, re-snapshotting the model between frames so a
//! rotary dimmer stays responsive mid-burst:
//!
//! 1. group-level changes, in round-robin cursor order
//! 2. per-address level changes and forced retransmissions
//! 3. repeat 1–2 until a pass emits nothing ("settled")
//! 4. pending group-membership rewrites (broadcast remove, per-member add)
//! 5. pending broadcast programming (power-on / system-failure levels)
//! 6. when nothing else was sent, exactly one fair-refresh frame
//!
//! A transmit that fails the bus-ready check is deferred to the next pass;
//! nothing is retried eagerly and no state is mutated for deferred frames.
//! The refresh loop guarantees eventual convergence.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use luxbus::{ConfigStore, Lights, LightsSink, Scheduler};
//! use luxbus::hal::{MockFrameSink, MockRetained};
//! use luxbus::services::OutboundQueue;
//!
//! let config = Arc::new(ConfigStore::new());
//! config.set_addresses("00");
//! let lights = Arc::new(Lights::new(
//!     Arc::clone(&config),
//!     Arc::new(OutboundQueue::new()),
//!     Box::new(MockRetained::new()),
//! ));
//! lights.set_level("0", 128);
//!
//! let mut scheduler = Scheduler::new(Arc::clone(&lights), MockFrameSink::new());
//! assert_eq!(scheduler.pass(), 1);
//! assert_eq!(scheduler.pass(), 1); // settled: one refresh frame per pass
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::codec::{commands, Frame, FrameSink, MAX_ADDR};
use crate::lights::{Lights, LEVEL_UNSET};
use crate::parsing::addr_bit;

/// Total time to re-transmit every present lamp once.
pub const REFRESH_PERIOD_US: u64 = 5_000_000;

/// Hardware watchdog timeout; the driver sleeps at most a quarter of it.
pub const WATCHDOG_PERIOD_US: u64 = 10_000_000;

/// Worst-case burst statistics, published in the status report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BurstStats {
    /// Largest number of frames emitted by a single pass.
    pub worst_frames: u32,
    /// Nominal duration of that burst in microseconds.
    pub worst_us: u64,
}

/// The bus-transmit scheduler.
///
/// Generic over the [`FrameSink`] so tests drive it against a recording
/// mock while the firmware uses [`crate::codec::BusCodec`].
pub struct Scheduler<S: FrameSink> {
    lights: Arc<Lights>,
    sink: S,
    tx_levels: [u8; 64],
    tx_group_levels: [u8; 16],
    tx_group_members: [u64; 16],
    next_address: u8,
    next_group: u8,
    stats: BurstStats,
}

impl<S: FrameSink> Scheduler<S> {
    /// Create a scheduler with an empty transmit cache.
    pub fn new(lights: Arc<Lights>, sink: S) -> Self {
        Self {
            lights,
            sink,
            tx_levels: [LEVEL_UNSET; 64],
            tx_group_levels: [LEVEL_UNSET; 16],
            tx_group_members: [0; 16],
            next_address: 0,
            next_group: 0,
            stats: BurstStats::default(),
        }
    }

    /// The frame sink (tests inspect recorded frames here).
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Mutable access to the frame sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Worst-case burst statistics since boot.
    pub fn stats(&self) -> BurstStats {
        self.stats
    }

    /// The cached per-address levels (tests assert convergence on these).
    pub fn tx_levels(&self) -> &[u8; 64] {
        &self.tx_levels
    }

    /// Run one full scheduler pass. Returns the number of frames emitted.
    pub fn pass(&mut self) -> usize {
        let mut total = 0;

        loop {
            let sent = self.level_pass();
            total += sent;
            if sent == 0 {
                break;
            }
        }

        total += self.group_sync_pass();
        total += self.broadcast_pass();

        if total == 0 {
            total += self.refresh_pass();
        } else if total as u32 > self.stats.worst_frames {
            self.stats.worst_frames = total as u32;
            self.stats.worst_us = total as u64 * self.sink.frame_time_us() as u64;
        }

        total
    }

    /// How long to sleep after a pass: short enough to keep the refresh
    /// period and the watchdog, minus the time one frame occupies the bus.
    pub fn sleep_interval(&self) -> Duration {
        let state = self.lights.snapshot();
        let lamps = state.present.count_ones().max(1) as u64;
        let refresh_slot =
            (REFRESH_PERIOD_US / lamps).saturating_sub(self.sink.frame_time_us() as u64);
        Duration::from_micros(refresh_slot.min(WATCHDOG_PERIOD_US / 4).max(1_000))
    }

    /// The driver thread: pass, sleep until woken or the refresh slot
    /// elapses, repeat. `tick` runs every iteration (watchdog feed).
    pub fn run_loop(&mut self, tick: impl Fn()) -> !
    where
        S: Send,
    {
        let wake = self.lights.wake_signal();
        loop {
            tick();
            self.pass();
            wake.wait_timeout(self.sleep_interval());
        }
    }

    // ========================================================================
    // Change-driven transmission
    // ========================================================================

    /// One iteration of the settle loop: group-level changes, then
    /// per-address changes. Re-snapshots the model after every frame.
    fn level_pass(&mut self) -> usize {
        let mut sent = 0;
        let mut state = self.lights.snapshot();
        // Members already covered by a group frame this pass are
        // cache-correct; skip their per-address refresh.
        let mut covered = 0u64;

        for i in 0..16 {
            let g = ((self.next_group as usize + i) % 16) as u8;
            let desired = state.group_levels[g as usize];
            if desired == LEVEL_UNSET || desired == self.tx_group_levels[g as usize] {
                continue;
            }

            if !self.sink.send(Frame::group_level(g, desired)) {
                return sent;
            }
            sent += 1;
            self.next_group = (g + 1) % 16;

            self.tx_group_levels[g as usize] = desired;
            let members = state.group_members[g as usize] & state.present;
            for a in 0..=MAX_ADDR {
                if members & addr_bit(a) != 0 {
                    self.tx_levels[a as usize] = desired;
                }
            }
            covered |= members;
            state = self.lights.snapshot();
        }

        for i in 0..=MAX_ADDR {
            let a = (self.next_address + i) % (MAX_ADDR + 1);
            let idx = a as usize;
            let bit = addr_bit(a);
            if state.present & bit == 0 {
                continue;
            }

            let forced = state.force_refresh[idx] > 0;
            // Group-masked addresses are handled by group frames, except
            // when a forced retransmission is owed.
            if (state.group_mask & bit != 0 || covered & bit != 0) && !forced {
                continue;
            }

            let desired = state.levels[idx];
            if desired == LEVEL_UNSET {
                // Nothing to restore; retire any owed retransmissions.
                for _ in 0..state.force_refresh[idx] {
                    self.lights.completed_force_refresh(a);
                }
                continue;
            }
            if desired == self.tx_levels[idx] && !forced {
                continue;
            }

            if !self.sink.send(Frame::level(a, desired)) {
                return sent;
            }
            sent += 1;

            self.tx_levels[idx] = desired;
            if forced {
                self.lights.completed_force_refresh(a);
            }
            state = self.lights.snapshot();
        }

        sent
    }

    // ========================================================================
    // Group sync
    // ========================================================================

    /// Rewrite the bus-side membership for every group with a pending sync
    /// request: empty the group with a broadcast remove, then add each
    /// member. Membership commands are repeated frames.
    fn group_sync_pass(&mut self) -> usize {
        let state = self.lights.snapshot();
        let mut sent = 0;

        for g in 0..16u8 {
            if state.group_sync_pending & (1 << g) == 0 {
                continue;
            }

            if !self
                .sink
                .send(Frame::broadcast(commands::remove_from_group(g)).repeated())
            {
                return sent;
            }
            sent += 1;

            let members = state.group_members[g as usize] & state.present;
            for a in 0..=MAX_ADDR {
                if members & addr_bit(a) == 0 {
                    continue;
                }
                if !self
                    .sink
                    .send(Frame::command(a, commands::add_to_group(g)).repeated())
                {
                    return sent;
                }
                sent += 1;
            }

            self.tx_group_members[g as usize] = members;
            self.lights.completed_group_sync(g);
        }

        sent
    }

    // ========================================================================
    // Broadcast programming
    // ========================================================================

    /// Program the power-on and/or system-failure levels from the lamps'
    /// actual levels. A single DTR store serves both when both are pending.
    fn broadcast_pass(&mut self) -> usize {
        let state = self.lights.snapshot();
        let power_on = state.broadcast_power_on_pending;
        let system_failure = state.broadcast_system_failure_pending;
        if !power_on && !system_failure {
            return 0;
        }

        let mut sent = 0;
        if !self
            .sink
            .send(Frame::broadcast(commands::STORE_ACTUAL_LEVEL_IN_DTR).repeated())
        {
            return sent;
        }
        sent += 1;

        if power_on {
            if !self
                .sink
                .send(Frame::broadcast(commands::SET_POWER_ON_LEVEL_FROM_DTR).repeated())
            {
                return sent;
            }
            sent += 1;
        }
        if system_failure {
            if !self
                .sink
                .send(Frame::broadcast(commands::SET_SYSTEM_FAILURE_LEVEL_FROM_DTR).repeated())
            {
                return sent;
            }
            sent += 1;
        }

        self.lights.completed_broadcasts(power_on, system_failure);
        sent
    }

    // ========================================================================
    // Fair refresh
    // ========================================================================

    /// Retransmit one cached level so lamps that forget are eventually
    /// restored. Advances the round-robin cursor.
    fn refresh_pass(&mut self) -> usize {
        let state = self.lights.snapshot();

        for i in 0..=MAX_ADDR {
            let a = (self.next_address + i) % (MAX_ADDR + 1);
            let idx = a as usize;
            if state.present & addr_bit(a) == 0 || state.levels[idx] == LEVEL_UNSET {
                continue;
            }

            if self.sink.send(Frame::level(a, state.levels[idx])) {
                self.next_address = (a + 1) % (MAX_ADDR + 1);
                return 1;
            }
            return 0;
        }

        0
    }
}
