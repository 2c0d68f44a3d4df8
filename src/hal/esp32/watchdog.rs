//! Task watchdog wrapper.
//!
//! Every worker thread subscribes and feeds at least four times per
//! timeout. If the startup broker round trip does not complete within a
//! minute after a firmware upgrade, nothing feeds the main subscription
//! and the hardware reboots into rollback.

use esp_idf_svc::sys::{
    esp_task_wdt_add, esp_task_wdt_config_t, esp_task_wdt_reconfigure, esp_task_wdt_reset, ESP_OK,
};

/// Watchdog timeout; workers sleep at most a quarter of this.
pub const WATCHDOG_TIMEOUT_MS: u32 = 10_000;

/// A per-task watchdog subscription.
pub struct Watchdog {
    subscribed: bool,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    /// Subscribe the calling task to the TWDT, configuring it on first use.
    pub fn new() -> Self {
        unsafe {
            let config = esp_task_wdt_config_t {
                timeout_ms: WATCHDOG_TIMEOUT_MS,
                idle_core_mask: 0,
                trigger_panic: true,
            };
            let ret = esp_task_wdt_reconfigure(&config);
            if ret != ESP_OK {
                log::warn!(target: "watchdog", "reconfigure returned {}", ret);
            }

            let ret = esp_task_wdt_add(core::ptr::null_mut());
            let subscribed = ret == ESP_OK;
            if !subscribed {
                log::warn!(target: "watchdog", "subscribe failed: {}", ret);
            }
            Self { subscribed }
        }
    }

    /// Feed the watchdog from the subscribed task.
    pub fn feed(&self) {
        if self.subscribed {
            unsafe {
                esp_task_wdt_reset();
            }
        }
    }
}
