//! ESP32 lighting controller firmware entry point.
//!
//! Boot order: logger, filesystem, config load, retained-RAM restore,
//! WiFi, backend selection (local bus vs remote forwarding), worker
//! threads, broker loop.
//!
//! Threads:
//! - **driver**: the bus scheduler (highest priority, owns the RMT output)
//! - **inputs**: debounced switches and buttons
//! - **dimmers**: encoder deltas to level adjustments
//! - **config-save**: asynchronous CBOR persistence
//! - **main**: broker I/O, selector, watchdog, reboot handling
//!
//! The hardware watchdog reboots us if the startup broker round trip does
//! not complete within a minute after a firmware upgrade, which triggers
//! the bootloader's rollback.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::nvs::EspDefaultNvsPartition;

use luxbus::codec::BusCodec;
use luxbus::hal::esp32::{
    pins, Esp32Clock, Esp32Encoder, Esp32Line, Esp32Mqtt, Esp32Selector, Esp32Wifi, RmtPulseTransmitter,
    RtcRetained, Watchdog,
};
use luxbus::inputs::{
    Buttons, DebouncedInput, Dimmers, Switches, BUTTON_DEBOUNCE_US, SWITCH_DEBOUNCE_US,
};
use luxbus::lights::WakeSignal;
use luxbus::services::{Api, MqttRunner, OutboundQueue, Publisher};
use luxbus::traits::SelectorInput;
use luxbus::{
    persist, ConfigStore, FixedConfig, Lights, LightsSink, RemoteLights, Scheduler, NUM_BUTTONS,
    NUM_SWITCHES,
};

/// Time allowed for the startup round trip before the watchdog is let go.
const STARTUP_DEADLINE_US: u64 = 60_000_000;

fn mount_filesystem() -> anyhow::Result<()> {
    use esp_idf_svc::sys::{esp, esp_vfs_spiffs_conf_t, esp_vfs_spiffs_register};

    let base_path = c"/spiffs";
    let conf = esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: true,
    };
    // The only fatal boot error: without flash there is no configuration
    esp!(unsafe { esp_vfs_spiffs_register(&conf) })?;
    Ok(())
}

fn unique_id() -> u64 {
    let mut mac = [0u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

fn main() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let fixed = FixedConfig::default();
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let clock = Arc::new(Esp32Clock::new());

    // =========================================================================
    // Filesystem and configuration
    // =========================================================================
    mount_filesystem()?;

    let config = Arc::new(ConfigStore::with_paths(
        "/spiffs/config.cbor".into(),
        "/spiffs/config.cbor~".into(),
    ));
    let outcome = persist::load(&config);
    log::info!("config: {:?}", outcome);

    let outbound = Arc::new(OutboundQueue::with_fixed(&fixed));
    config.attach_outbound(Arc::clone(&outbound));

    // =========================================================================
    // Backend: local bus or remote forwarding
    // =========================================================================
    let mut local: Option<Arc<Lights>> = None;
    let sink: Arc<dyn LightsSink> = if fixed.is_remote() {
        Arc::new(RemoteLights::new(
            Arc::clone(&config),
            Arc::clone(&outbound),
            fixed.remote_topic.as_str(),
        ))
    } else {
        let lights = Arc::new(Lights::with_clock(
            Arc::clone(&config),
            Arc::clone(&outbound),
            Box::new(RtcRetained::new()),
            clock.clone(),
        ));
        log::info!("levels restore: {}", lights.boot_status().as_str());
        local = Some(Arc::clone(&lights));
        lights
    };

    // =========================================================================
    // Bus driver thread
    // =========================================================================
    if let Some(lights) = &local {
        let transmitter =
            RmtPulseTransmitter::new(peripherals.rmt.channel0, peripherals.pins.gpio21)?;
        let codec = BusCodec::new(transmitter, Esp32Clock::new());
        let mut scheduler = Scheduler::new(Arc::clone(lights), codec);

        thread::Builder::new()
            .name("driver".into())
            .stack_size(8192)
            .spawn(move || {
                let watchdog = Watchdog::new();
                scheduler.run_loop(|| watchdog.feed());
            })?;
    }

    // =========================================================================
    // Input thread (switches + buttons)
    // =========================================================================
    let selector: Arc<dyn SelectorInput + Send + Sync> = Arc::new(Esp32Selector::new(
        peripherals.pins.gpio16.into(),
        peripherals.pins.gpio17.into(),
    )?);

    {
        let input_wake = Arc::new(WakeSignal::new());
        let mut retained = RtcRetained::new();
        let (positions, status) =
            Switches::<DebouncedInput<Esp32Line, Esp32Clock>>::restore_positions(&mut retained);
        log::info!("switch restore: {}", status.as_str());

        let switch_pins = [
            peripherals.pins.gpio5.into(),
            peripherals.pins.gpio6.into(),
        ];
        let mut switch_lines = Vec::new();
        for (i, pin) in switch_pins.into_iter().enumerate() {
            let mut line = DebouncedInput::new(
                Esp32Line::new(pin, true, Arc::clone(&input_wake))?,
                Esp32Clock::new(),
                SWITCH_DEBOUNCE_US,
            );
            if let Some(p) = positions {
                if p.known & (1 << i) != 0 {
                    line = line.with_initial(p.values & (1 << i) != 0);
                }
            }
            switch_lines.push(line);
        }
        debug_assert_eq!(switch_lines.len(), NUM_SWITCHES);

        let button_pins = [
            peripherals.pins.gpio18.into(),
            peripherals.pins.gpio39.into(),
            peripherals.pins.gpio41.into(),
            peripherals.pins.gpio42.into(),
        ];
        let mut button_lines = Vec::new();
        for pin in button_pins {
            button_lines.push(DebouncedInput::new(
                Esp32Line::new(pin, true, Arc::clone(&input_wake))?,
                Esp32Clock::new(),
                BUTTON_DEBOUNCE_US,
            ));
        }
        debug_assert_eq!(button_lines.len(), NUM_BUTTONS);

        let mut switches = Switches::new(
            switch_lines,
            Arc::clone(&config),
            Arc::clone(&sink),
            Arc::clone(&outbound),
            clock.clone(),
            Box::new(retained),
            &fixed,
        );
        let mut buttons = Buttons::new(
            button_lines,
            Arc::clone(&config),
            Arc::clone(&sink),
            Arc::clone(&selector),
        );

        thread::Builder::new()
            .name("inputs".into())
            .stack_size(8192)
            .spawn(move || {
                let watchdog = Watchdog::new();
                loop {
                    watchdog.feed();
                    let wait_ms = switches.poll_once().min(buttons.poll_once());
                    input_wake.wait_timeout(Duration::from_millis(wait_ms.min(2_500) as u64));
                }
            })?;
    }

    // =========================================================================
    // Dimmer thread
    // =========================================================================
    let api = {
        let dimmer_wake = Arc::new(WakeSignal::new());
        let mut encoders = Vec::new();
        let dimmer_pins: [[esp_idf_hal::gpio::AnyIOPin; 2]; 2] = [
            [
                peripherals.pins.gpio1.into(),
                peripherals.pins.gpio2.into(),
            ],
            [
                peripherals.pins.gpio3.into(),
                peripherals.pins.gpio4.into(),
            ],
        ];
        for [a, b] in dimmer_pins {
            let wake = Arc::clone(&dimmer_wake);
            encoders.push(Esp32Encoder::new(a, b, move || wake.notify())?);
        }
        let mut dimmers = Dimmers::new(encoders, Arc::clone(&config), Arc::clone(&sink));

        let api = Arc::new(match &local {
            Some(lights) => Api::new_local(
                fixed.clone(),
                Arc::clone(&config),
                Arc::clone(lights),
                Arc::clone(&outbound),
                clock.clone(),
                unique_id(),
            ),
            None => Api::new_remote(
                fixed.clone(),
                Arc::clone(&config),
                Arc::clone(&sink),
                Arc::clone(&outbound),
                clock.clone(),
                unique_id(),
            ),
        });

        let debug_outbound = Arc::clone(&outbound);
        let debug_fixed = fixed.clone();
        let (debug_tx, debug_rx) = std::sync::mpsc::channel::<usize>();
        let debug_tx = std::sync::Mutex::new(debug_tx);
        api.set_debug_hook(Box::new(move |id| {
            let _ = debug_tx.lock().unwrap().send(id);
        }));

        thread::Builder::new()
            .name("dimmers".into())
            .stack_size(8192)
            .spawn(move || {
                let watchdog = Watchdog::new();
                loop {
                    watchdog.feed();
                    dimmers.poll_once();
                    while let Ok(id) = debug_rx.try_recv() {
                        dimmers.publish_debug(id, &debug_outbound, &debug_fixed);
                    }
                    dimmer_wake.wait_timeout(Duration::from_millis(2_500));
                }
            })?;

        api
    };

    // =========================================================================
    // Config save thread
    // =========================================================================
    {
        let config = Arc::clone(&config);
        let outbound_save = Arc::clone(&outbound);
        let fixed_save = fixed.clone();
        thread::Builder::new()
            .name("config-save".into())
            .stack_size(8192)
            .spawn(move || {
                let watchdog = Watchdog::new();
                loop {
                    watchdog.feed();
                    match persist::save(&config) {
                        Ok(true) => outbound_save.publish(
                            fixed_save.topic("saved_config"),
                            fixed_save.topic.as_str(),
                            false,
                        ),
                        Ok(false) => {}
                        Err(e) => log::error!("config save: {}", e),
                    }
                    thread::sleep(Duration::from_secs(1));
                }
            })?;
    }

    // =========================================================================
    // Network and main loop
    // =========================================================================
    let _wifi = Esp32Wifi::connect(peripherals.modem, sysloop, Some(nvs), &fixed)?;
    let client = Esp32Mqtt::connect(&fixed, api.device_id())?;

    let publisher = local.as_ref().map(|lights| {
        Publisher::new(
            Arc::clone(lights),
            Arc::clone(&outbound),
            clock.clone(),
            &fixed,
        )
    });
    let mut runner = MqttRunner::new(client, Arc::clone(&api), Arc::clone(&outbound), publisher);

    let watchdog = Watchdog::new();
    let mut app_marked_valid = false;
    let boot_us = unsafe { esp_idf_svc::sys::esp_timer_get_time() as u64 };

    loop {
        runner.poll();
        sink.set_selector_position(selector.read());

        if api.take_reboot_request() {
            log::warn!("rebooting by request");
            let _file = config.hold_file_lock();
            unsafe {
                esp_idf_svc::sys::esp_restart();
            }
        }

        if api.startup_complete() && !app_marked_valid {
            unsafe {
                esp_idf_svc::sys::esp_ota_mark_app_valid_cancel_rollback();
            }
            app_marked_valid = true;
        }

        // Until the startup round trip completes, only feed the watchdog
        // inside the grace period; a broken image reboots into rollback
        let now_us = unsafe { esp_idf_svc::sys::esp_timer_get_time() as u64 };
        if api.startup_complete() || now_us - boot_us < STARTUP_DEADLINE_US {
            watchdog.feed();
        }

        thread::sleep(Duration::from_millis(50));
    }
}
