//! The inbound command router: MQTT topics to model and config calls.
//!
//! All remote control happens through a topic tree under the fixed base
//! prefix. Parse failures drop the message with a log line and never
//! mutate state partially.
//!
//! # Topic tree (base prefix `T`)
//!
//! | Topic | Payload | Effect |
//! |-------|---------|--------|
//! | `T/reboot` | - | Save config, restart |
//! | `T/reload` | - | Reload config from flash |
//! | `T/status` | - | Publish a status report |
//! | `T/addresses` | hex pairs | Set the present-address set |
//! | `T/group/<name>` | hex / empty / `sync` | Set membership / delete / resync |
//! | `T/groups/sync` | - | Resync every group |
//! | `T/switch/<id>/...` | text | Bind a switch |
//! | `T/dimmer/<id>/...` | text | Bind a dimmer |
//! | `T/preset/<name>` | light spec | Select the preset |
//! | `T/preset/<name>/delete` | - | Delete the preset |
//! | `T/preset/<name>/levels` | 128 hex | Replace the level vector |
//! | `T/preset/<name>/<spec>` | integer / empty | Merge a level |
//! | `T/preset/order` | csv | Replace the ordered list |
//! | `T/set/<spec>` | integer | Set a literal level |
//! | `T/command/store/power_on_level` | - | Broadcast-program power-on |
//! | `T/command/store/system_failure_level` | - | Broadcast-program failure |
//!
//! Plus the `meta/mqtt-agents` poll/reply pair and the `T/startup_complete`
//! round trip that triggers the retained config echo exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{ConfigStore, RESERVED_PRESET_ORDER};
use crate::fixed::FixedConfig;
use crate::lights::{Lights, LightsSink};
use crate::parsing;
use crate::persist;
use crate::services::OutboundQueue;
use crate::traits::Clock;

/// Hook invoked for `dimmer/<id>/get_debug` (wired to the dimmer runner).
pub type DebugHook = Box<dyn Fn(usize) + Send + Sync>;

/// The command router.
pub struct Api {
    fixed: FixedConfig,
    config: Arc<ConfigStore>,
    lights: Arc<dyn LightsSink>,
    /// Present only for the local backend; carries the hooks that have no
    /// meaning when forwarding to a remote controller.
    local: Option<Arc<Lights>>,
    outbound: Arc<OutboundQueue>,
    clock: Arc<dyn Clock + Send + Sync>,
    device_id: String,
    startup_complete: AtomicBool,
    reboot_requested: AtomicBool,
    debug_hook: Mutex<Option<DebugHook>>,
}

impl Api {
    /// Create the router for the local backend.
    pub fn new_local(
        fixed: FixedConfig,
        config: Arc<ConfigStore>,
        lights: Arc<Lights>,
        outbound: Arc<OutboundQueue>,
        clock: Arc<dyn Clock + Send + Sync>,
        unique_id: u64,
    ) -> Self {
        let device_id = fixed.device_id(unique_id);
        Self {
            fixed,
            config,
            lights: Arc::clone(&lights) as Arc<dyn LightsSink>,
            local: Some(lights),
            outbound,
            clock,
            device_id,
            startup_complete: AtomicBool::new(false),
            reboot_requested: AtomicBool::new(false),
            debug_hook: Mutex::new(None),
        }
    }

    /// Create the router for a remote-forwarding backend.
    pub fn new_remote(
        fixed: FixedConfig,
        config: Arc<ConfigStore>,
        lights: Arc<dyn LightsSink>,
        outbound: Arc<OutboundQueue>,
        clock: Arc<dyn Clock + Send + Sync>,
        unique_id: u64,
    ) -> Self {
        let device_id = fixed.device_id(unique_id);
        Self {
            fixed,
            config,
            lights,
            local: None,
            outbound,
            clock,
            device_id,
            startup_complete: AtomicBool::new(false),
            reboot_requested: AtomicBool::new(false),
            debug_hook: Mutex::new(None),
        }
    }

    /// Install the dimmer debug-dump hook.
    pub fn set_debug_hook(&self, hook: DebugHook) {
        *self.debug_hook.lock().unwrap() = Some(hook);
    }

    /// The broker client id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// True after the startup round trip completed.
    pub fn startup_complete(&self) -> bool {
        self.startup_complete.load(Ordering::SeqCst)
    }

    /// Take a pending reboot request (the platform loop acts on it).
    pub fn take_reboot_request(&self) -> bool {
        self.reboot_requested.swap(false, Ordering::SeqCst)
    }

    /// The topic filters to subscribe on every (re)connect.
    pub fn subscriptions(&self) -> Vec<String> {
        let t = |s: &str| self.fixed.topic(s);
        vec![
            "meta/mqtt-agents/poll".to_string(),
            t("startup_complete"),
            t("reboot"),
            t("reload"),
            t("status"),
            t("addresses"),
            t("group/+"),
            t("groups/sync"),
            t("switch/+/name"),
            t("switch/+/group"),
            t("switch/+/preset"),
            t("dimmer/+/groups"),
            t("dimmer/+/encoder_steps"),
            t("dimmer/+/level_steps"),
            t("dimmer/+/mode"),
            t("dimmer/+/get_debug"),
            t("preset/+"),
            t("preset/+/+"),
            t("set/+"),
            t("command/store/power_on_level"),
            t("command/store/system_failure_level"),
        ]
    }

    /// Called after every (re)connect: restart the startup handshake.
    pub fn on_connected(&self) {
        self.startup_complete.store(false, Ordering::SeqCst);
        if let Some(local) = &self.local {
            local.startup_complete(false);
        }
        self.outbound
            .publish("meta/mqtt-agents/announce", self.device_id.clone(), false);
        self.outbound
            .publish(self.fixed.topic("startup_complete"), "", false);
    }

    /// Route one inbound message.
    pub fn receive(&self, topic: &str, payload: &[u8]) {
        let payload_str = String::from_utf8_lossy(payload).into_owned();

        if topic == "meta/mqtt-agents/poll" {
            self.outbound
                .publish("meta/mqtt-agents/reply", self.device_id.clone(), false);
            return;
        }

        let prefix = format!("{}/", self.fixed.topic.as_str());
        let Some(rest) = topic.strip_prefix(&prefix) else {
            return;
        };
        let mut parts = rest.split('/');
        let Some(head) = parts.next() else {
            return;
        };

        match head {
            "startup_complete" => self.handle_startup_complete(),
            "reboot" => {
                if let Err(e) = persist::save(&self.config) {
                    log::error!(target: "api", "save before reboot: {}", e);
                }
                self.reboot_requested.store(true, Ordering::SeqCst);
            }
            "reload" => self.handle_reload(),
            "status" => self.status_report(),
            "addresses" => {
                self.config.set_addresses(&payload_str);
                if let Some(local) = &self.local {
                    local.address_config_changed(None);
                }
            }
            "group" => {
                if let Some(name) = parts.next() {
                    self.handle_group(name, &payload_str);
                }
            }
            "groups" => {
                if parts.next() == Some("sync") {
                    self.lights.request_group_sync(None);
                }
            }
            "switch" => self.handle_switch(&mut parts, &payload_str),
            "dimmer" => self.handle_dimmer(&mut parts, &payload_str),
            "preset" => self.handle_preset(&mut parts, &payload_str),
            "set" => {
                if let (Some(spec), Some(level)) =
                    (parts.next(), parsing::parse_long(&payload_str))
                {
                    self.lights.set_level(spec, level);
                }
            }
            "command" => {
                if parts.next() == Some("store") {
                    match parts.next() {
                        Some("power_on_level") => self.lights.request_broadcast_power_on_level(),
                        Some("system_failure_level") => {
                            self.lights.request_broadcast_system_failure_level()
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn handle_startup_complete(&self) {
        if self.startup_complete.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "api", "startup complete");
        if let Some(local) = &self.local {
            local.startup_complete(true);
        }
        if let Err(e) = persist::save(&self.config) {
            log::error!(target: "api", "save at startup: {}", e);
        }
        self.publish_config();
    }

    fn handle_reload(&self) {
        let outcome = persist::load(&self.config);
        log::info!(target: "api", "config reload: {:?}", outcome);
        self.outbound.publish(
            self.fixed.topic("loaded_config"),
            format!("{:?}", outcome),
            false,
        );
        if let Err(e) = persist::save(&self.config) {
            log::error!(target: "api", "save after reload: {}", e);
        }
        self.publish_config();
        if let Some(local) = &self.local {
            local.address_config_changed(None);
        }
        self.lights.request_group_sync(None);
    }

    fn handle_group(&self, name: &str, payload: &str) {
        if payload == "sync" {
            self.lights.request_group_sync(Some(name));
            return;
        }
        if payload.is_empty() {
            if self.config.delete_group(name) {
                if let Some(local) = &self.local {
                    local.address_config_changed(Some(name));
                }
            }
            return;
        }
        match self.config.set_group_addresses(name, payload) {
            Ok(changed) => {
                if changed {
                    if let Some(local) = &self.local {
                        local.address_config_changed(Some(name));
                    }
                    self.lights.request_group_sync(Some(name));
                }
            }
            Err(e) => log::warn!(target: "api", "group {}: {}", name, e),
        }
    }

    fn handle_switch<'a>(&self, parts: &mut impl Iterator<Item = &'a str>, payload: &str) {
        let (Some(id), Some(field)) = (parts.next(), parts.next()) else {
            return;
        };
        let Some(id) = parsing::parse_long(id).filter(|v| *v >= 0) else {
            return;
        };
        let id = id as usize;

        let result = match field {
            "name" => self.config.set_switch_name(id, payload),
            "group" => self.config.set_switch_group(id, payload),
            "preset" => self.config.set_switch_preset(id, payload),
            _ => return,
        };
        if let Err(e) = result {
            log::warn!(target: "api", "switch {} {}: {}", id, field, e);
        }
    }

    fn handle_dimmer<'a>(&self, parts: &mut impl Iterator<Item = &'a str>, payload: &str) {
        let (Some(id), Some(field)) = (parts.next(), parts.next()) else {
            return;
        };
        let Some(id) = parsing::parse_long(id).filter(|v| *v >= 0) else {
            return;
        };
        let id = id as usize;

        let result = match field {
            "groups" => self.config.set_dimmer_groups(id, payload),
            "encoder_steps" => match parsing::parse_long(payload) {
                Some(value) => self.config.set_dimmer_encoder_steps(id, value),
                None => return,
            },
            "level_steps" => match parsing::parse_long(payload) {
                Some(value) => self.config.set_dimmer_level_steps(id, value),
                None => return,
            },
            "mode" => self.config.set_dimmer_mode(id, payload),
            "get_debug" => {
                if let Some(hook) = self.debug_hook.lock().unwrap().as_ref() {
                    hook(id);
                }
                return;
            }
            _ => return,
        };
        if let Err(e) = result {
            log::warn!(target: "api", "dimmer {} {}: {}", id, field, e);
        }
    }

    fn handle_preset<'a>(&self, parts: &mut impl Iterator<Item = &'a str>, payload: &str) {
        let Some(name) = parts.next() else {
            return;
        };

        let Some(sub) = parts.next() else {
            if name == RESERVED_PRESET_ORDER {
                self.config.set_ordered_presets(payload);
                self.publish_order();
                return;
            }
            let spec = if payload.is_empty() { "all" } else { payload };
            self.lights.select_preset(name, spec, false);
            return;
        };

        match sub {
            "delete" => {
                if self.config.delete_preset(name) {
                    // Clear the retained echo
                    self.outbound.publish(
                        self.fixed.topic(&format!("preset/{}/levels", name)),
                        "",
                        true,
                    );
                }
            }
            "levels" => match self.config.set_preset_levels_hex(name, payload) {
                Ok(changed) => {
                    if changed {
                        self.publish_preset(name);
                    }
                }
                Err(e) => log::warn!(target: "api", "preset {}: {}", name, e),
            },
            spec => {
                let level = if payload.is_empty() {
                    Some(-1)
                } else {
                    parsing::parse_long(payload)
                };
                let Some(level) = level else {
                    return;
                };
                match self.config.set_preset_level(name, spec, level) {
                    Ok(()) => self.publish_preset(name),
                    Err(e) => log::warn!(target: "api", "preset {}: {}", name, e),
                }
            }
        }
    }

    // ========================================================================
    // Outbound echo
    // ========================================================================

    /// Publish the retained configuration echo.
    pub fn publish_config(&self) {
        let config = self.config.snapshot();

        self.outbound.publish(
            self.fixed.topic("addresses"),
            parsing::addresses_text(config.lights),
            true,
        );

        for (name, group) in &config.groups {
            self.outbound.publish(
                self.fixed.topic(&format!("group/{}", name)),
                parsing::addresses_text(group.members),
                true,
            );
        }

        for (id, switch) in config.switches.iter().enumerate() {
            let base = format!("switch/{}", id);
            self.outbound
                .publish(self.fixed.topic(&format!("{}/name", base)), switch.name.clone(), true);
            self.outbound.publish(
                self.fixed.topic(&format!("{}/group", base)),
                switch.group.clone(),
                true,
            );
            self.outbound.publish(
                self.fixed.topic(&format!("{}/preset", base)),
                switch.preset.clone(),
                true,
            );
        }

        for (id, dimmer) in config.dimmers.iter().enumerate() {
            let base = format!("dimmer/{}", id);
            self.outbound.publish(
                self.fixed.topic(&format!("{}/groups", base)),
                dimmer.groups.join(","),
                true,
            );
            self.outbound.publish(
                self.fixed.topic(&format!("{}/encoder_steps", base)),
                dimmer.encoder_steps.to_string(),
                true,
            );
            self.outbound.publish(
                self.fixed.topic(&format!("{}/level_steps", base)),
                dimmer.level_steps.to_string(),
                true,
            );
            self.outbound.publish(
                self.fixed.topic(&format!("{}/mode", base)),
                dimmer.mode.as_str(),
                true,
            );
        }

        for name in config.presets.keys() {
            self.publish_preset(name);
        }
        self.publish_order();
    }

    fn publish_preset(&self, name: &str) {
        if let Some(levels) = self.config.get_preset(name) {
            self.outbound.publish(
                self.fixed.topic(&format!("preset/{}/levels", name)),
                parsing::levels_text(&levels, None),
                true,
            );
        }
    }

    fn publish_order(&self) {
        let order = self.config.snapshot().order.join(",");
        self.outbound
            .publish(self.fixed.topic("preset/order"), order, true);
    }

    /// Publish the status report.
    pub fn status_report(&self) {
        self.outbound.publish(
            self.fixed.topic("uptime_us"),
            self.clock.now_us().to_string(),
            false,
        );
        if let Some(local) = &self.local {
            self.outbound.publish(
                self.fixed.topic("boot/levels"),
                local.boot_status().as_str(),
                false,
            );
        }
        self.outbound.publish(
            self.fixed.topic("queue/oversize"),
            self.outbound.oversize_count().to_string(),
            false,
        );
    }
}
