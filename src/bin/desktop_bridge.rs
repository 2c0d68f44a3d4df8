//! Desktop bridge: the full light-state engine against a real broker, with
//! the bus replaced by a recording sink.
//!
//! Useful for exercising the topic grammar, the scheduler and persistence
//! without hardware:
//!
//! ```bash
//! LUXBUS_MQTT_HOST=localhost cargo run --features mqtt --bin desktop_bridge
//! ```
//!
//! Levels, presets and groups behave exactly as on the device; emitted bus
//! frames are logged instead of driven onto a wire.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use luxbus::codec::{Frame, FrameSink};
use luxbus::hal::MockRetained;
use luxbus::services::{Api, MqttRunner, OutboundQueue, Publisher, RumqttcClient};
use luxbus::{persist, ConfigStore, FixedConfig, Lights, Scheduler};

/// Logs frames instead of transmitting them.
struct LoggingSink;

impl FrameSink for LoggingSink {
    fn ready(&mut self) -> bool {
        true
    }

    fn send(&mut self, frame: Frame) -> bool {
        log::debug!(
            target: "bus",
            "frame {:02X} {:02X}{}",
            frame.address_byte,
            frame.data_byte,
            if frame.repeat { " (x2)" } else { "" }
        );
        true
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let fixed = FixedConfig::default();
    log::info!(
        "bridge for {} via {}:{}",
        fixed.topic.as_str(),
        fixed.mqtt_host.as_str(),
        fixed.mqtt_port
    );

    let state_dir = std::env::temp_dir().join("luxbus-bridge");
    std::fs::create_dir_all(&state_dir)?;
    let config = Arc::new(ConfigStore::with_paths(
        state_dir.join("config.cbor"),
        state_dir.join("config.cbor~"),
    ));
    let outcome = persist::load(&config);
    log::info!("config: {:?}", outcome);

    let outbound = Arc::new(OutboundQueue::with_fixed(&fixed));
    config.attach_outbound(Arc::clone(&outbound));

    let lights = Arc::new(Lights::new(
        Arc::clone(&config),
        Arc::clone(&outbound),
        Box::new(MockRetained::new()),
    ));

    // Scheduler against the logging sink
    {
        let mut scheduler = Scheduler::new(Arc::clone(&lights), LoggingSink);
        thread::spawn(move || scheduler.run_loop(|| {}));
    }

    // Config save task
    {
        let config = Arc::clone(&config);
        thread::spawn(move || loop {
            if let Err(e) = persist::save(&config) {
                log::error!("config save: {}", e);
            }
            thread::sleep(Duration::from_secs(1));
        });
    }

    let clock = Arc::new(luxbus::hal::SystemClock::new());
    let api = Arc::new(Api::new_local(
        fixed.clone(),
        Arc::clone(&config),
        Arc::clone(&lights),
        Arc::clone(&outbound),
        clock.clone(),
        std::process::id() as u64,
    ));
    let publisher = Publisher::new(
        Arc::clone(&lights),
        Arc::clone(&outbound),
        clock,
        &fixed,
    );

    let client = RumqttcClient::connect(&fixed, api.device_id());
    let mut runner = MqttRunner::new(client, Arc::clone(&api), outbound, Some(publisher));

    loop {
        runner.poll();
        if api.take_reboot_request() {
            log::info!("reboot requested; exiting");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }
}
