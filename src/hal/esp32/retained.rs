//! Battery-backed RAM in the RTC noinit region.
//!
//! The two retained regions live in `.rtc_noinit`, which the linker keeps
//! out of the normal RAM init path so a warm reset preserves it. A cold
//! boot leaves garbage; the checksums in [`crate::retained`] reject it,
//! and the power-on reset reason discards it outright.

use crate::retained::{LEVELS_REGION_LEN, SWITCHES_REGION_LEN};
use crate::traits::{RetainedMemory, RetainedRegion};

use esp_idf_svc::sys::{esp_reset_reason, esp_reset_reason_t_ESP_RST_POWERON};

#[link_section = ".rtc_noinit"]
static mut RTC_LEVELS: [u8; LEVELS_REGION_LEN] = [0; LEVELS_REGION_LEN];

#[link_section = ".rtc_noinit"]
static mut RTC_SWITCHES: [u8; SWITCHES_REGION_LEN] = [0; SWITCHES_REGION_LEN];

/// [`RetainedMemory`] over the RTC noinit statics.
///
/// Only one instance may exist per region user; the model and the switch
/// runner each get their own handle, and all access is serialized behind
/// their mutexes.
pub struct RtcRetained {
    power_on: bool,
}

impl Default for RtcRetained {
    fn default() -> Self {
        Self::new()
    }
}

impl RtcRetained {
    /// Create a handle, latching the reset reason once at boot.
    pub fn new() -> Self {
        let reason = unsafe { esp_reset_reason() };
        Self {
            power_on: reason == esp_reset_reason_t_ESP_RST_POWERON,
        }
    }
}

impl RetainedMemory for RtcRetained {
    fn load(&mut self, region: RetainedRegion, buf: &mut [u8]) -> bool {
        // Safety: exclusive access is guaranteed by the owning mutex
        unsafe {
            let src: &[u8] = match region {
                RetainedRegion::Levels => &*core::ptr::addr_of!(RTC_LEVELS),
                RetainedRegion::Switches => &*core::ptr::addr_of!(RTC_SWITCHES),
            };
            if buf.len() != src.len() {
                return false;
            }
            buf.copy_from_slice(src);
        }
        true
    }

    fn store(&mut self, region: RetainedRegion, buf: &[u8]) {
        // Safety: exclusive access is guaranteed by the owning mutex
        unsafe {
            let dst: &mut [u8] = match region {
                RetainedRegion::Levels => &mut *core::ptr::addr_of_mut!(RTC_LEVELS),
                RetainedRegion::Switches => &mut *core::ptr::addr_of_mut!(RTC_SWITCHES),
            };
            if buf.len() == dst.len() {
                dst.copy_from_slice(buf);
            }
        }
    }

    fn power_on_reset(&self) -> bool {
        self.power_on
    }
}
