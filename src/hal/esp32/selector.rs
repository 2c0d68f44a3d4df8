//! Hardware selector input (two GPIO bits).

use esp_idf_hal::gpio::{AnyIOPin, Input, PinDriver, Pull};

use crate::traits::SelectorInput;

/// Two pulled-up inputs read as an active-low 2-bit position.
pub struct Esp32Selector<'d> {
    pins: [PinDriver<'d, AnyIOPin, Input>; 2],
}

impl<'d> Esp32Selector<'d> {
    /// Configure the selector inputs.
    pub fn new(bit0: AnyIOPin, bit1: AnyIOPin) -> Result<Self, esp_idf_hal::sys::EspError> {
        let mut low = PinDriver::input(bit0)?;
        let mut high = PinDriver::input(bit1)?;
        low.set_pull(Pull::Up)?;
        high.set_pull(Pull::Up)?;
        Ok(Self { pins: [low, high] })
    }
}

impl SelectorInput for Esp32Selector<'_> {
    fn read(&self) -> u8 {
        let mut value = 0;
        for (bit, pin) in self.pins.iter().enumerate() {
            if pin.is_low() {
                value |= 1 << bit;
            }
        }
        value
    }
}
