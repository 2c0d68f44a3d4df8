//! # luxbus
//!
//! Firmware core for a networked lighting controller that drives lamps over a
//! two-wire lighting bus and is remote-controlled over MQTT.
//!
//! ## Features
//!
//! - **Shared light model**: per-address and per-group target levels, named
//!   presets, power-switch tracking, mutated concurrently from the broker,
//!   switch and dimmer threads
//! - **Bus-transmit scheduler**: change-driven bursts, round-robin fairness,
//!   periodic refresh, group re-sync and broadcast programming flows
//! - **Bit-exact framing**: Manchester-coded forward frames with the mandated
//!   half-bit timing and inter-frame idle gap
//! - **Persistence**: CBOR config file with backup-and-verify, checksummed
//!   battery-backed RAM for the level vector and switch positions
//!
//! ## Architecture
//!
//! The crate is structured so that everything above the GPIO layer can be
//! exercised on the desktop without hardware:
//!
//! - `traits` - Hardware and network abstractions
//! - `codec` - Bus frame types and pulse encoding
//! - `scheduler` - The bus driver task
//! - `lights` - The authoritative desired-state model
//! - `config` / `persist` - Validated runtime configuration and its CBOR file
//! - `retained` - Battery-backed RAM regions
//! - `inputs` - Debounced switches, pushbuttons and rotary dimmers
//! - `services` - MQTT topic grammar, outbound queue, state publisher
//! - `hal` - Concrete implementations (mock for testing, esp32 for hardware)
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use luxbus::{ConfigStore, Lights, LightsSink, Scheduler};
//! use luxbus::hal::{MockFrameSink, MockRetained};
//! use luxbus::services::OutboundQueue;
//!
//! let config = Arc::new(ConfigStore::new());
//! config.set_addresses("0001");
//! config.set_preset_level("evening", "all", 128).unwrap();
//!
//! let outbound = Arc::new(OutboundQueue::new());
//! let lights = Arc::new(Lights::new(
//!     Arc::clone(&config),
//!     Arc::clone(&outbound),
//!     Box::new(MockRetained::new()),
//! ));
//!
//! lights.select_preset("evening", "all", false);
//!
//! // Drive one scheduler pass against a recording sink
//! let mut scheduler = Scheduler::new(Arc::clone(&lights), MockFrameSink::new());
//! scheduler.pass();
//! assert_eq!(scheduler.sink().frames.len(), 2);
//! ```

#![warn(missing_docs)]

/// Bus frame types, command constants and bit-exact pulse encoding.
pub mod codec;
/// Validated runtime configuration: addresses, groups, presets, bindings.
pub mod config;
/// Fixed (build-time) configuration: network endpoints and identity.
pub mod fixed;
/// Hardware abstraction layer with mock implementations for testing.
pub mod hal;
/// Debounced switches, pushbuttons and rotary dimmer input handling.
pub mod inputs;
/// The authoritative light-state model shared between all input sources.
pub mod lights;
/// Light-spec grammar, hex codecs and number parsing.
pub mod parsing;
/// CBOR config file persistence with backup-and-verify.
pub mod persist;
/// Checksummed battery-backed RAM for levels and switch positions.
pub mod retained;
/// The bus driver task: converts the light model into a stream of frames.
pub mod scheduler;
/// MQTT topic grammar, outbound queue and state publisher.
pub mod services;
/// Core traits for hardware and network abstraction.
pub mod traits;

// Re-exports for convenience
pub use codec::{commands, BusCodec, Frame, FrameStats, MAX_ADDR, MAX_GROUP, MAX_LEVEL};
pub use config::{
    ConfigData, ConfigStore, DimmerConfig, DimmerMode, GroupConfig, SwitchConfig, NUM_BUTTONS,
    NUM_DIMMERS, NUM_SELECTOR_POSITIONS, NUM_SWITCHES,
};
pub use fixed::FixedConfig;
pub use lights::{LightState, Lights, LightsSink, RemoteLights, LEVEL_UNSET};
pub use parsing::LightSpec;
pub use retained::BootStatus;
pub use scheduler::Scheduler;
pub use traits::{
    Clock, DebouncedLine, EncoderInput, LineEvent, MqttClient, MqttMessage, Pulse,
    PulseTransmitter, RetainedMemory, SelectorInput,
};
