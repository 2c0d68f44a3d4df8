//! Debounce state machine for GPIO input lines.
//!
//! After the first edge, the line must hold its new value for the whole
//! debounce window before a logical transition is reported. The initial
//! stable value after boot is not a transition; a warm reboot can preload
//! the last known value so the first read is not misreported either.

use crate::traits::{Clock, DebouncedLine, LineEvent};

/// Debounce window for wall switches.
pub const SWITCH_DEBOUNCE_US: u64 = 20_000;

/// Debounce window for pushbuttons.
pub const BUTTON_DEBOUNCE_US: u64 = 50_000;

/// Poll hint while a line is quiet (the edge interrupt wakes us earlier).
const IDLE_POLL_MS: u32 = 2_500;

/// A raw, un-debounced input line.
///
/// The mock scripts values; the ESP32 implementation reads the GPIO level.
pub trait RawLine {
    /// Sample the line.
    fn read(&mut self) -> bool;
}

/// The reusable debounce state machine.
///
/// Feed it samples with [`step`](Self::step); it reports stable
/// transitions and tells the caller when to poll again.
#[derive(Clone, Debug)]
pub struct Debouncer {
    window_us: u64,
    stable: Option<bool>,
    candidate: Option<(bool, u64)>,
}

impl Debouncer {
    /// Create a machine with the given debounce window.
    pub fn new(window_us: u64) -> Self {
        Self {
            window_us,
            stable: None,
            candidate: None,
        }
    }

    /// Preload the stable value (restored switch position after a warm
    /// reboot). The next matching read reports no transition.
    pub fn with_initial(mut self, value: bool) -> Self {
        self.stable = Some(value);
        self
    }

    /// The current stable value, if one has been established.
    pub fn value(&self) -> Option<bool> {
        self.stable
    }

    /// Advance the machine with a fresh sample.
    pub fn step(&mut self, value: bool, now_us: u64) -> LineEvent {
        let stable = match self.stable {
            Some(stable) => stable,
            None => {
                // Establishing the boot value still runs the window
                match self.candidate {
                    Some((candidate, since)) if candidate == value => {
                        if now_us.wrapping_sub(since) >= self.window_us {
                            self.stable = Some(value);
                            self.candidate = None;
                            return LineEvent {
                                value,
                                changed: true,
                                first: true,
                            wait_ms: IDLE_POLL_MS,
                            };
                        }
                        return self.pending_event(value, since, now_us);
                    }
                    _ => {
                        self.candidate = Some((value, now_us));
                        return self.pending_event(value, now_us, now_us);
                    }
                }
            }
        };

        if value == stable {
            self.candidate = None;
            return LineEvent {
                value: stable,
                changed: false,
                first: false,
                wait_ms: IDLE_POLL_MS,
            };
        }

        match self.candidate {
            Some((candidate, since)) if candidate == value => {
                if now_us.wrapping_sub(since) >= self.window_us {
                    self.stable = Some(value);
                    self.candidate = None;
                    LineEvent {
                        value,
                        changed: true,
                        first: false,
                        wait_ms: IDLE_POLL_MS,
                    }
                } else {
                    self.pending_event(value, since, now_us)
                }
            }
            _ => {
                self.candidate = Some((value, now_us));
                self.pending_event(value, now_us, now_us)
            }
        }
    }

    fn pending_event(&self, value: bool, since: u64, now_us: u64) -> LineEvent {
        let elapsed = now_us.wrapping_sub(since);
        let remaining_us = self.window_us.saturating_sub(elapsed).max(1_000);
        LineEvent {
            value: self.stable.unwrap_or(value),
            changed: false,
            first: self.stable.is_none(),
            wait_ms: (remaining_us / 1_000) as u32,
        }
    }
}

/// A [`RawLine`] plus [`Debouncer`] plus clock, forming a
/// [`DebouncedLine`].
pub struct DebouncedInput<L: RawLine, C: Clock> {
    line: L,
    clock: C,
    debouncer: Debouncer,
}

impl<L: RawLine, C: Clock> DebouncedInput<L, C> {
    /// Debounce `line` with the given window.
    pub fn new(line: L, clock: C, window_us: u64) -> Self {
        Self {
            line,
            clock,
            debouncer: Debouncer::new(window_us),
        }
    }

    /// Preload the stable value (see [`Debouncer::with_initial`]).
    pub fn with_initial(mut self, value: bool) -> Self {
        self.debouncer = self.debouncer.clone().with_initial(value);
        self
    }

    /// Access the raw line (tests flip the mock here).
    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }
}

impl<L: RawLine, C: Clock> DebouncedLine for DebouncedInput<L, C> {
    fn poll(&mut self) -> LineEvent {
        let value = self.line.read();
        self.debouncer.step(value, self.clock.now_us())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_value_is_not_a_transition() {
        let mut debouncer = Debouncer::new(SWITCH_DEBOUNCE_US);

        let ev = debouncer.step(true, 0);
        assert!(!ev.changed);
        assert!(ev.first);

        let ev = debouncer.step(true, SWITCH_DEBOUNCE_US);
        assert!(ev.changed);
        assert!(ev.first, "boot stabilisation is flagged as first");
        assert_eq!(debouncer.value(), Some(true));
    }

    #[test]
    fn transition_needs_full_window() {
        let mut debouncer = Debouncer::new(SWITCH_DEBOUNCE_US).with_initial(false);

        let ev = debouncer.step(true, 0);
        assert!(!ev.changed);
        assert!(ev.wait_ms <= 20);

        // Still inside the window
        let ev = debouncer.step(true, SWITCH_DEBOUNCE_US - 1);
        assert!(!ev.changed);

        let ev = debouncer.step(true, SWITCH_DEBOUNCE_US);
        assert!(ev.changed);
        assert!(!ev.first);
        assert!(ev.value);
    }

    #[test]
    fn bounce_restarts_window() {
        let mut debouncer = Debouncer::new(SWITCH_DEBOUNCE_US).with_initial(false);

        debouncer.step(true, 0);
        debouncer.step(false, 10_000); // bounced back
        debouncer.step(true, 15_000); // window restarts here

        let ev = debouncer.step(true, 15_000 + SWITCH_DEBOUNCE_US - 1);
        assert!(!ev.changed);
        let ev = debouncer.step(true, 15_000 + SWITCH_DEBOUNCE_US);
        assert!(ev.changed);
    }

    #[test]
    fn return_to_stable_cancels_candidate() {
        let mut debouncer = Debouncer::new(SWITCH_DEBOUNCE_US).with_initial(false);

        debouncer.step(true, 0);
        let ev = debouncer.step(false, 5_000);
        assert!(!ev.changed);

        // A later long-stable high still needs a full window from scratch
        debouncer.step(true, 100_000);
        let ev = debouncer.step(true, 100_000 + SWITCH_DEBOUNCE_US);
        assert!(ev.changed);
    }

    #[test]
    fn preloaded_value_suppresses_first_transition() {
        let mut debouncer = Debouncer::new(SWITCH_DEBOUNCE_US).with_initial(true);

        // The line reads back the restored value: nothing to report
        let ev = debouncer.step(true, 0);
        assert!(!ev.changed);
        assert!(!ev.first);

        // A real change is reported as a normal transition
        debouncer.step(false, 0);
        let ev = debouncer.step(false, SWITCH_DEBOUNCE_US);
        assert!(ev.changed);
        assert!(!ev.first);
        assert!(!ev.value);
    }

    #[test]
    fn wait_hint_counts_down() {
        let mut debouncer = Debouncer::new(BUTTON_DEBOUNCE_US).with_initial(false);

        let ev = debouncer.step(true, 0);
        assert_eq!(ev.wait_ms, 50);
        let ev = debouncer.step(true, 30_000);
        assert_eq!(ev.wait_ms, 20);
    }

    #[test]
    fn debounced_input_combines_line_and_clock() {
        use crate::hal::{MockClock, MockLine};

        let clock = MockClock::new();
        let mut input =
            DebouncedInput::new(MockLine::new(false), clock.clone(), SWITCH_DEBOUNCE_US)
                .with_initial(false);

        input.line_mut().set(true);
        let ev = input.poll();
        assert!(!ev.changed);

        clock.advance_us(SWITCH_DEBOUNCE_US);
        let ev = input.poll();
        assert!(ev.changed);
        assert!(ev.value);
    }
}
