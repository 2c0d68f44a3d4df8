//! Raw GPIO input lines for switches and buttons.
//!
//! The edge interrupt only posts a wake to the input thread; the debounce
//! window itself runs in [`crate::inputs::Debouncer`] on the thread side.

use std::sync::Arc;

use esp_idf_hal::gpio::{AnyIOPin, Input, InterruptType, PinDriver, Pull};

use crate::inputs::RawLine;
use crate::lights::WakeSignal;

/// A pulled-up GPIO input whose edges wake the input thread.
pub struct Esp32Line<'d> {
    pin: PinDriver<'d, AnyIOPin, Input>,
    active_low: bool,
}

impl<'d> Esp32Line<'d> {
    /// Configure the pin with a pull-up and an any-edge interrupt that
    /// notifies `wake`.
    pub fn new(
        pin: AnyIOPin,
        active_low: bool,
        wake: Arc<WakeSignal>,
    ) -> Result<Self, esp_idf_hal::sys::EspError> {
        let mut pin = PinDriver::input(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_interrupt_type(InterruptType::AnyEdge)?;

        // Safety: the handler only signals the wake condvar state flag
        unsafe {
            pin.subscribe(move || {
                wake.notify();
            })?;
        }
        pin.enable_interrupt()?;

        Ok(Self { pin, active_low })
    }
}

impl RawLine for Esp32Line<'_> {
    fn read(&mut self) -> bool {
        let _ = self.pin.enable_interrupt();
        self.pin.is_low() == self.active_low
    }
}
