//! Pushbutton handling.
//!
//! A button binds (via [`ConfigStore`]) to a group list and a preset. On a
//! stable press with both set, the preset is applied to those groups as a
//! normal user action (reported, not internal). Releases are ignored.
//!
//! When a button's own group list is empty the hardware selector position
//! chooses an alternative list.

use std::sync::Arc;

use crate::config::{ConfigStore, NUM_BUTTONS};
use crate::lights::LightsSink;
use crate::traits::{DebouncedLine, SelectorInput};

/// The pushbutton runner. Shares the input thread with the switches.
pub struct Buttons<D: DebouncedLine> {
    lines: Vec<D>,
    config: Arc<ConfigStore>,
    lights: Arc<dyn LightsSink>,
    selector: Arc<dyn SelectorInput + Send + Sync>,
}

impl<D: DebouncedLine> Buttons<D> {
    /// Create the runner with one debounced line per button.
    pub fn new(
        lines: Vec<D>,
        config: Arc<ConfigStore>,
        lights: Arc<dyn LightsSink>,
        selector: Arc<dyn SelectorInput + Send + Sync>,
    ) -> Self {
        Self {
            lines,
            config,
            lights,
            selector,
        }
    }

    /// Access a button's debounced line (tests flip the mock here).
    pub fn line_mut(&mut self, id: usize) -> &mut D {
        &mut self.lines[id]
    }

    /// Poll every button once. Returns the smallest wait hint in
    /// milliseconds.
    pub fn poll_once(&mut self) -> u32 {
        let mut wait_ms = u32::MAX;
        for id in 0..self.lines.len().min(NUM_BUTTONS) {
            let event = self.lines[id].poll();
            wait_ms = wait_ms.min(event.wait_ms);

            if !event.changed || event.first || !event.value {
                continue;
            }

            let position = self.selector.read();
            let groups = self.config.button_active_groups(id, position);
            let preset = self
                .config
                .get_button(id)
                .map(|b| b.preset)
                .unwrap_or_default();

            log::info!(target: "buttons", "button {} pressed", id);

            if !groups.is_empty() && !preset.is_empty() {
                self.lights.select_preset(&preset, &groups.join(","), false);
            }
        }
        wait_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MockClock, MockLine, MockRetained, MockSelector};
    use crate::inputs::{DebouncedInput, BUTTON_DEBOUNCE_US};
    use crate::lights::Lights;
    use crate::services::OutboundQueue;

    type TestLine = DebouncedInput<MockLine, MockClock>;

    struct Fixture {
        config: Arc<ConfigStore>,
        lights: Arc<Lights>,
        clock: MockClock,
        buttons: Buttons<TestLine>,
    }

    fn fixture(selector_position: u8) -> Fixture {
        let config = Arc::new(ConfigStore::new());
        config.set_addresses("0102");
        config.set_group_addresses("hall", "01").unwrap();
        config.set_group_addresses("porch", "02").unwrap();
        config.set_preset_level("night", "all", 30).unwrap();
        config.set_button_preset(0, "night").unwrap();

        let clock = MockClock::new();
        let lights = Arc::new(Lights::with_clock(
            Arc::clone(&config),
            Arc::new(OutboundQueue::new()),
            Box::new(MockRetained::new()),
            Arc::new(clock.clone()),
        ));

        let lines = (0..NUM_BUTTONS)
            .map(|_| {
                DebouncedInput::new(MockLine::new(false), clock.clone(), BUTTON_DEBOUNCE_US)
                    .with_initial(false)
            })
            .collect();
        let buttons = Buttons::new(
            lines,
            Arc::clone(&config),
            lights.clone() as Arc<dyn LightsSink>,
            Arc::new(MockSelector {
                position: selector_position,
            }),
        );

        Fixture {
            config,
            lights,
            clock,
            buttons,
        }
    }

    fn press(fixture: &mut Fixture, id: usize) {
        fixture.buttons.line_mut(id).line_mut().set(true);
        fixture.buttons.poll_once();
        fixture.clock.advance_us(BUTTON_DEBOUNCE_US);
        fixture.buttons.poll_once();
    }

    #[test]
    fn press_applies_bound_preset() {
        let mut fixture = fixture(0);
        fixture.config.set_button_groups(0, "hall").unwrap();

        press(&mut fixture, 0);
        assert_eq!(fixture.lights.snapshot().levels[1], 30);
        assert_eq!(fixture.lights.snapshot().levels[2], crate::lights::LEVEL_UNSET);
    }

    #[test]
    fn empty_groups_fall_back_to_selector() {
        let mut fixture = fixture(3);
        fixture.config.set_selector_groups(3, "porch").unwrap();

        press(&mut fixture, 0);
        assert_eq!(fixture.lights.snapshot().levels[2], 30);
        assert_eq!(fixture.lights.snapshot().levels[1], crate::lights::LEVEL_UNSET);
    }

    #[test]
    fn unarmed_button_does_nothing() {
        let mut fixture = fixture(0);
        // No groups bound anywhere
        press(&mut fixture, 0);
        let state = fixture.lights.snapshot();
        assert!(state.levels.iter().all(|l| *l == crate::lights::LEVEL_UNSET));
    }

    #[test]
    fn release_is_ignored() {
        let mut fixture = fixture(0);
        fixture.config.set_button_groups(0, "hall").unwrap();
        press(&mut fixture, 0);
        fixture.lights.set_level("1", 99);

        // Release
        fixture.buttons.line_mut(0).line_mut().set(false);
        fixture.buttons.poll_once();
        fixture.clock.advance_us(BUTTON_DEBOUNCE_US);
        fixture.buttons.poll_once();

        assert_eq!(fixture.lights.snapshot().levels[1], 99);
    }
}
