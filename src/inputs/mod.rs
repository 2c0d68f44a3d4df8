//! Physical input handling: debounced switches, pushbuttons and rotary
//! dimmers.
//!
//! Each input class turns raw hardware events into semantic calls on the
//! [`LightsSink`](crate::lights::LightsSink):
//!
//! - wall switches report power state and re-apply their bound preset
//! - pushbuttons apply their bound preset on press
//! - rotary dimmers accumulate encoder cycles into level adjustments
//!
//! The state machines are pure and host-testable; the ISR-side decoding
//! lives in the platform HAL.

mod buttons;
mod debounce;
mod dimmers;
mod switches;

pub use buttons::Buttons;
pub use debounce::{
    DebouncedInput, Debouncer, RawLine, BUTTON_DEBOUNCE_US, SWITCH_DEBOUNCE_US,
};
pub use dimmers::Dimmers;
pub use switches::Switches;
