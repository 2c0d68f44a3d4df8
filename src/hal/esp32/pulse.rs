//! RMT-based bus pulse output.
//!
//! The RMT peripheral plays the encoded half-bit pulse train with
//! hardware timing, so the driver task never bit-bangs under interrupt
//! pressure. The channel is clocked at 1 MHz (1 tick = 1 us) and each
//! [`Pulse`] maps to one RMT item of `half_bits * HALF_BIT_US` ticks.

use esp_idf_hal::gpio::OutputPin;
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::rmt::config::TransmitConfig;
use esp_idf_hal::rmt::{
    PinState, Pulse as RmtPulse, PulseTicks, RmtChannel, TxRmtDriver, VariableLengthSignal,
};

use crate::codec::HALF_BIT_US;
use crate::traits::{Pulse, PulseTransmitter};

/// [`PulseTransmitter`] over an RMT transmit channel.
pub struct RmtPulseTransmitter<'d> {
    driver: TxRmtDriver<'d>,
    idle_high: bool,
}

impl<'d> RmtPulseTransmitter<'d> {
    /// Claim an RMT channel for the bus output pin.
    pub fn new<C: RmtChannel>(
        channel: impl Peripheral<P = C> + 'd,
        pin: impl Peripheral<P = impl OutputPin> + 'd,
    ) -> Result<Self, esp_idf_hal::sys::EspError> {
        let config = TransmitConfig::new()
            .clock_divider(80) // 80 MHz APB / 80 = 1 tick per microsecond
            .idle(Some(PinState::High));
        let driver = TxRmtDriver::new(channel, pin, &config)?;
        Ok(Self {
            driver,
            idle_high: true,
        })
    }

    fn ticks(half_bits: u16) -> Result<PulseTicks, esp_idf_hal::sys::EspError> {
        PulseTicks::new(half_bits * HALF_BIT_US as u16)
    }
}

impl PulseTransmitter for RmtPulseTransmitter<'_> {
    fn set_idle_level(&mut self, level: bool) {
        self.idle_high = level;
    }

    fn ready(&self) -> bool {
        // start_blocking returns only after the train has been played
        true
    }

    fn transmit(&mut self, pulses: &[Pulse]) -> bool {
        let mut signal = VariableLengthSignal::new();

        for pulse in pulses {
            let state = if pulse.level {
                PinState::High
            } else {
                PinState::Low
            };
            let Ok(ticks) = Self::ticks(pulse.half_bits) else {
                return false;
            };
            if signal.push([&RmtPulse::new(state, ticks)]).is_err() {
                return false;
            }
        }

        self.driver.start_blocking(&signal).is_ok()
    }
}
