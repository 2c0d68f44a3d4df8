//! The authoritative light-state model.
//!
//! [`Lights`] holds the desired per-address and per-group levels and is
//! mutated concurrently from the broker callback, the debounced switch
//! thread and the dimmer thread. The bus scheduler consumes coherent
//! by-value snapshots and never holds the model lock while transmitting.
//!
//! # Locking
//!
//! Two locks, acquired in the order *publish, then data* when both are
//! needed:
//!
//! - the **data lock** guards every runtime vector (levels, group levels,
//!   power state, pending flags)
//! - the **publish lock** guards republish bookkeeping consumed by the
//!   state publisher
//!
//! Public operations take the data lock once and call `_locked` helpers, so
//! higher-level operations can reuse lower-level logic without reentrancy.
//!
//! # Persistence
//!
//! Any mutation that changes a level rewrites the checksummed level vector
//! in battery-backed RAM, so a warm reboot restores the lamps without
//! waiting for the broker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::codec::{MAX_ADDR, MAX_LEVEL};
use crate::config::{
    ConfigStore, DimmerMode, RESERVED_PRESET_CUSTOM, RESERVED_PRESET_UNKNOWN,
};
use crate::parsing::{self, addr_bit};
use crate::retained::{self, BootStatus};
use crate::services::OutboundQueue;
use crate::traits::{Clock, RetainedMemory};

/// Internal no-change sentinel for levels (`-1` in the external form).
pub const LEVEL_UNSET: u8 = 0xFF;

/// Retransmissions armed when a power switch turns a circuit back on.
pub const FORCE_REFRESH_COUNT: u8 = 2;

/// The system is idle when nothing user-initiated happened for this long.
pub const IDLE_TIME_US: u64 = 10_000_000;

/// Delay after the last encoder activity before the settled level is
/// reported.
pub const DIM_REPORT_DELAY_US: u64 = 1_000_000;

// ============================================================================
// Wake signal
// ============================================================================

/// Condition-variable wakeup for the scheduler driver thread.
///
/// The model notifies it after every mutation; the driver waits with a
/// timeout so the periodic refresh and the watchdog keep running even when
/// nothing changes.
pub struct WakeSignal {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    /// Create an unsignalled wake signal.
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Wake the waiting thread.
    pub fn notify(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.condvar.notify_all();
    }

    /// Wait until notified or the timeout elapses. Returns true if woken
    /// by a notification.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock().unwrap();
        if !*flag {
            let (guard, _) = self
                .condvar
                .wait_timeout_while(flag, timeout, |signalled| !*signalled)
                .unwrap();
            flag = guard;
        }
        std::mem::take(&mut *flag)
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// A coherent by-value snapshot of the model, consumed by the scheduler.
#[derive(Clone, Debug)]
pub struct LightState {
    /// Present-address bitset at snapshot time.
    pub present: u64,
    /// Desired per-address levels ([`LEVEL_UNSET`] = untouched).
    pub levels: [u8; 64],
    /// Desired per-group levels ([`LEVEL_UNSET`] = not set).
    pub group_levels: [u8; 16],
    /// Group membership bitsets indexed by bus group id.
    pub group_members: [u64; 16],
    /// Addresses whose level is governed by a group entry.
    pub group_mask: u64,
    /// Remaining forced retransmissions per address.
    pub force_refresh: [u8; 64],
    /// Bit per group id: membership needs re-establishing on the bus.
    pub group_sync_pending: u16,
    /// One-shot broadcast power-on-level programming request.
    pub broadcast_power_on_pending: bool,
    /// One-shot broadcast system-failure-level programming request.
    pub broadcast_system_failure_pending: bool,
}

// ============================================================================
// Capability trait and remote backend
// ============================================================================

/// The mutating operations a lights backend exposes to the command router
/// and the input threads.
///
/// Implemented by [`Lights`] (drives the local bus) and [`RemoteLights`]
/// (forwards commands to another controller over the broker). Chosen once
/// at boot.
pub trait LightsSink: Send + Sync {
    /// Apply a preset (by name, or by index into the preset order) to a
    /// light spec.
    fn select_preset(&self, name_or_index: &str, spec: &str, internal: bool);

    /// Set a literal level on a light spec.
    fn set_level(&self, spec: &str, level: i64);

    /// Apply an encoder delta through a dimmer binding.
    fn dim_adjust(&self, dimmer_id: usize, delta: i64);

    /// Record physical power-switch state for a set of addresses.
    fn set_power(&self, addresses: u64, on: bool);

    /// Request a bus-side membership rewrite for one group, or all.
    fn request_group_sync(&self, group: Option<&str>);

    /// Request broadcast programming of the power-on level.
    fn request_broadcast_power_on_level(&self);

    /// Request broadcast programming of the system-failure level.
    fn request_broadcast_system_failure_level(&self);

    /// Record the hardware selector position.
    fn set_selector_position(&self, position: u8);
}

// ============================================================================
// Model internals
// ============================================================================

struct LightsData {
    levels: [u8; 64],
    group_levels: [u8; 16],
    group_mask: u64,
    active_presets: [String; 64],
    power_on: u64,
    power_known: u64,
    force_refresh: [u8; 64],
    group_sync_pending: u16,
    broadcast_power_on_pending: bool,
    broadcast_system_failure_pending: bool,
    last_activity_us: u64,
    dim_time_us: [u64; 64],
}

pub(crate) struct PublishState {
    pub(crate) startup_complete: bool,
    pub(crate) republish_groups: HashSet<String>,
    pub(crate) republish_presets: HashSet<String>,
    pub(crate) last_publish_active_us: u64,
    pub(crate) publish_index: usize,
    pub(crate) last_publish_levels_us: u64,
    pub(crate) levels_dirty: bool,
}

/// The light-state model. One instance per process, created at boot.
pub struct Lights {
    config: Arc<ConfigStore>,
    outbound: Arc<OutboundQueue>,
    clock: Arc<dyn Clock + Send + Sync>,
    wake: Arc<WakeSignal>,
    data: Mutex<LightsData>,
    pub(crate) publish: Mutex<PublishState>,
    retained: Mutex<Box<dyn RetainedMemory>>,
    selector: AtomicU8,
    boot_status: BootStatus,
}

impl Lights {
    /// Create the model, restoring the level vector from battery-backed RAM
    /// when its checksum matches.
    pub fn new(
        config: Arc<ConfigStore>,
        outbound: Arc<OutboundQueue>,
        retained: Box<dyn RetainedMemory>,
    ) -> Self {
        Self::with_clock(config, outbound, retained, Arc::new(crate::hal::SystemClock::new()))
    }

    /// Create the model with an explicit clock (tests).
    pub fn with_clock(
        config: Arc<ConfigStore>,
        outbound: Arc<OutboundQueue>,
        mut retained: Box<dyn RetainedMemory>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let (saved, boot_status) = retained::load_levels(&mut *retained);
        let mut levels = saved.unwrap_or([LEVEL_UNSET; 64]);

        // Only present addresses may carry a level
        let present = config.get_addresses();
        for a in 0..=MAX_ADDR {
            if present & addr_bit(a) == 0 {
                levels[a as usize] = LEVEL_UNSET;
            }
        }

        log::info!(target: "lights", "boot level restore: {}", boot_status.as_str());

        Self {
            config,
            outbound,
            clock,
            wake: Arc::new(WakeSignal::new()),
            data: Mutex::new(LightsData {
                levels,
                group_levels: [LEVEL_UNSET; 16],
                group_mask: 0,
                active_presets: std::array::from_fn(|_| RESERVED_PRESET_UNKNOWN.to_string()),
                power_on: 0,
                power_known: 0,
                force_refresh: [0; 64],
                group_sync_pending: 0,
                broadcast_power_on_pending: false,
                broadcast_system_failure_pending: false,
                last_activity_us: 0,
                dim_time_us: [0; 64],
            }),
            publish: Mutex::new(PublishState {
                startup_complete: false,
                republish_groups: HashSet::new(),
                republish_presets: HashSet::new(),
                last_publish_active_us: 0,
                publish_index: 0,
                last_publish_levels_us: 0,
                levels_dirty: false,
            }),
            retained: Mutex::new(retained),
            selector: AtomicU8::new(0),
            boot_status,
        }
    }

    /// How the boot-time level restore went.
    pub fn boot_status(&self) -> BootStatus {
        self.boot_status
    }

    /// The wake signal the scheduler driver waits on.
    pub fn wake_signal(&self) -> Arc<WakeSignal> {
        Arc::clone(&self.wake)
    }

    /// The configuration store this model reads.
    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// A coherent snapshot for the scheduler.
    pub fn snapshot(&self) -> LightState {
        let present = self.config.get_addresses();
        let by_id = {
            let snapshot = self.config.snapshot();
            snapshot.groups_by_id()
        };
        let mut group_members = [0u64; 16];
        for (id, entry) in by_id.iter().enumerate() {
            if let Some((_, members)) = entry {
                group_members[id] = *members;
            }
        }

        let data = self.data.lock().unwrap();
        LightState {
            present,
            levels: data.levels,
            group_levels: data.group_levels,
            group_members,
            group_mask: data.group_mask,
            force_refresh: data.force_refresh,
            group_sync_pending: data.group_sync_pending,
            broadcast_power_on_pending: data.broadcast_power_on_pending,
            broadcast_system_failure_pending: data.broadcast_system_failure_pending,
        }
    }

    /// Power-switch state: (known mask, on mask).
    pub fn power_state(&self) -> (u64, u64) {
        let data = self.data.lock().unwrap();
        (data.power_known, data.power_on)
    }

    /// Active-preset label for one address (tests and the publisher).
    pub fn active_preset(&self, address: u8) -> String {
        let data = self.data.lock().unwrap();
        data.active_presets[(address & MAX_ADDR) as usize].clone()
    }

    // ========================================================================
    // Startup and config-change hooks
    // ========================================================================

    /// Mark the broker startup handshake complete (or lost).
    pub fn startup_complete(&self, state: bool) {
        let mut publish = self.publish.lock().unwrap();
        publish.startup_complete = state;
    }

    /// True once the startup handshake completed.
    pub fn is_startup_complete(&self) -> bool {
        self.publish.lock().unwrap().startup_complete
    }

    /// The address or group configuration changed; re-publish everything
    /// affected and re-establish invariants.
    pub fn address_config_changed(&self, group: Option<&str>) {
        {
            let mut publish = self.publish.lock().unwrap();
            match group {
                Some(name) => {
                    publish.republish_groups.insert(name.to_string());
                }
                None => {
                    for name in self.config.group_names() {
                        publish.republish_groups.insert(name);
                    }
                }
            }
            publish.levels_dirty = true;
        }

        // Un-presenting an address clears its level and active preset
        let present = self.config.get_addresses();
        let mut changed = false;
        {
            let mut publish = self.publish.lock().unwrap();
            let mut data = self.data.lock().unwrap();
            for a in 0..=MAX_ADDR {
                let i = a as usize;
                if present & addr_bit(a) == 0 {
                    if data.levels[i] != LEVEL_UNSET {
                        data.levels[i] = LEVEL_UNSET;
                        changed = true;
                    }
                    data.group_mask &= !addr_bit(a);
                    if !data.active_presets[i].is_empty() {
                        let old = std::mem::take(&mut data.active_presets[i]);
                        publish.republish_presets.insert(old);
                    }
                }
            }
            if changed {
                self.persist_levels_locked(&data);
            }
        }

        self.wake.notify();
    }

    // ========================================================================
    // Core operations
    // ========================================================================

    fn resolve_preset_name(&self, name_or_index: &str) -> Option<String> {
        if !name_or_index.is_empty() && name_or_index.bytes().all(|b| b.is_ascii_digit()) {
            let index: u64 = name_or_index.parse().ok()?;
            self.config.ordered_preset(index)
        } else {
            Some(name_or_index.to_string())
        }
    }

    fn select_preset_impl(&self, name_or_index: &str, spec_text: &str, internal: bool) {
        let Some(name) = self.resolve_preset_name(name_or_index) else {
            log::warn!(target: "lights", "no ordered preset for index {}", name_or_index);
            return;
        };
        let Some(preset) = self.config.get_preset(&name) else {
            log::warn!(target: "lights", "unknown preset {}", name);
            return;
        };

        let spec = parsing::parse_light_spec(spec_text, |g| self.config.group_lookup(g));
        let present = self.config.get_addresses();
        let group_members = self.group_members_by_id();
        let now = self.now_us();

        let mut publish = self.publish.lock().unwrap();
        let mut data = self.data.lock().unwrap();

        if spec.idle_only && !internal && now.wrapping_sub(data.last_activity_us) < IDLE_TIME_US {
            drop(data);
            drop(publish);
            self.outbound.report(
                "lights",
                &format!("Ignored preset {} (not idle)", name),
            );
            return;
        }

        if !spec.idle_only {
            data.last_activity_us = now;
        }

        let mut applied = 0u64;
        for a in 0..=MAX_ADDR {
            let i = a as usize;
            let bit = addr_bit(a);
            if present & bit != 0 {
                if spec.mask & bit != 0 {
                    if let Some(level) = preset[i] {
                        data.levels[i] = level;
                        data.dim_time_us[i] = 0;
                        applied |= bit;

                        let old = std::mem::replace(&mut data.active_presets[i], name.clone());
                        publish.republish_presets.insert(old);
                        publish.republish_presets.insert(name.clone());
                    }
                }
            } else {
                if data.levels[i] != LEVEL_UNSET {
                    data.levels[i] = LEVEL_UNSET;
                }
                if !data.active_presets[i].is_empty() {
                    let old = std::mem::take(&mut data.active_presets[i]);
                    publish.republish_presets.insert(old);
                }
            }
        }

        if applied == 0 {
            return;
        }

        self.invalidate_group_levels_locked(&mut data, &group_members, applied);

        self.persist_levels_locked(&data);
        publish.levels_dirty = true;
        drop(data);
        drop(publish);

        if !internal {
            self.outbound.report(
                "lights",
                &format!("{} = {}", parsing::lights_text(spec.mask, present), name),
            );
        }
        self.wake.notify();
    }

    fn set_level_impl(&self, spec_text: &str, level: i64) {
        if !(0..=MAX_LEVEL as i64).contains(&level) {
            return;
        }

        let spec = parsing::parse_light_spec(spec_text, |g| self.config.group_lookup(g));
        let present = self.config.get_addresses();
        let group_members = self.group_members_by_id();
        let now = self.now_us();

        let mut publish = self.publish.lock().unwrap();
        let mut data = self.data.lock().unwrap();

        if spec.idle_only && now.wrapping_sub(data.last_activity_us) < IDLE_TIME_US {
            drop(data);
            drop(publish);
            self.outbound
                .report("lights", &format!("Ignored level {} (not idle)", level));
            return;
        }

        if !spec.idle_only {
            data.last_activity_us = now;
        }

        let mut applied = 0u64;
        for a in 0..=MAX_ADDR {
            let bit = addr_bit(a);
            if present & bit == 0 || spec.mask & bit == 0 {
                continue;
            }
            let i = a as usize;
            data.levels[i] = level as u8;
            data.dim_time_us[i] = 0;
            applied |= bit;

            let old =
                std::mem::replace(&mut data.active_presets[i], RESERVED_PRESET_CUSTOM.to_string());
            publish.republish_presets.insert(old);
            publish
                .republish_presets
                .insert(RESERVED_PRESET_CUSTOM.to_string());
        }

        if applied == 0 {
            return;
        }

        self.invalidate_group_levels_locked(&mut data, &group_members, applied);

        self.persist_levels_locked(&data);
        publish.levels_dirty = true;
        drop(data);
        drop(publish);

        self.outbound.report(
            "lights",
            &format!("{} = {}", parsing::lights_text(spec.mask, present), level),
        );
        self.wake.notify();
    }

    fn dim_adjust_impl(&self, dimmer_id: usize, delta: i64) {
        if delta == 0 || delta.abs() > MAX_LEVEL as i64 {
            return;
        }
        let Some(dimmer) = self.config.get_dimmer(dimmer_id) else {
            return;
        };

        let selector = self.selector.load(Ordering::Relaxed);
        let groups = self.config.dimmer_active_groups(dimmer_id, selector);
        if groups.is_empty() {
            return;
        }

        let present = self.config.get_addresses();
        let now = self.now_us();

        match dimmer.mode {
            DimmerMode::Group => self.dim_groups(&groups, delta, present, now),
            DimmerMode::Individual => self.dim_individual(&groups, delta, present, now),
        }
    }

    fn dim_groups(&self, groups: &[String], delta: i64, present: u64, now: u64) {
        // Resolve everything that needs the config store before locking
        let mut resolved: Vec<(u8, u64)> = Vec::new();
        for name in groups {
            let Some(group) = self.config.get_group(name) else {
                continue;
            };
            // Overlapping groups: an address dims with its owning group only
            let mut members = 0u64;
            for a in 0..=MAX_ADDR {
                if group.members & present & addr_bit(a) != 0
                    && self.config.group_for_address(a).as_deref() == Some(name.as_str())
                {
                    members |= addr_bit(a);
                }
            }
            resolved.push((group.id, members));
        }

        let mut publish = self.publish.lock().unwrap();
        let mut data = self.data.lock().unwrap();
        data.last_activity_us = now;
        let mut changed = false;

        for (id, members) in resolved {
            // Mean of the members that have a level, rounding against the
            // direction of travel
            let mut sum: i64 = 0;
            let mut count: i64 = 0;
            for a in 0..=MAX_ADDR {
                if members & addr_bit(a) != 0 && data.levels[a as usize] != LEVEL_UNSET {
                    sum += data.levels[a as usize] as i64;
                    count += 1;
                }
            }
            if count == 0 {
                continue;
            }
            let mean = if delta > 0 {
                sum.div_euclid(count)
            } else {
                // Round up for negative deltas
                (sum + count - 1).div_euclid(count)
            };
            let level = (mean + delta).clamp(0, MAX_LEVEL as i64) as u8;

            data.group_levels[id as usize] = level;
            data.group_mask |= members;
            for a in 0..=MAX_ADDR {
                if members & addr_bit(a) != 0 {
                    let i = a as usize;
                    data.levels[i] = level;
                    data.dim_time_us[i] = now;
                    let old = std::mem::replace(
                        &mut data.active_presets[i],
                        RESERVED_PRESET_CUSTOM.to_string(),
                    );
                    publish.republish_presets.insert(old);
                    publish
                        .republish_presets
                        .insert(RESERVED_PRESET_CUSTOM.to_string());
                }
            }
            changed = true;
        }

        if changed {
            self.persist_levels_locked(&data);
            publish.levels_dirty = true;
            drop(data);
            drop(publish);
            self.wake.notify();
        }
    }

    fn dim_individual(&self, groups: &[String], delta: i64, present: u64, now: u64) {
        let mut resolved: Vec<(u8, u64)> = Vec::new();
        let mut selected = 0u64;
        for name in groups {
            if let Some(group) = self.config.get_group(name) {
                resolved.push((group.id, group.members));
                selected |= group.members & present;
            }
        }

        let mut publish = self.publish.lock().unwrap();
        let mut data = self.data.lock().unwrap();
        data.last_activity_us = now;
        let mut changed = false;

        for a in 0..=MAX_ADDR {
            if selected & addr_bit(a) == 0 {
                continue;
            }
            let i = a as usize;
            if data.levels[i] == LEVEL_UNSET {
                continue;
            }
            data.levels[i] = (data.levels[i] as i64 + delta).clamp(0, MAX_LEVEL as i64) as u8;
            data.dim_time_us[i] = now;
            let old =
                std::mem::replace(&mut data.active_presets[i], RESERVED_PRESET_CUSTOM.to_string());
            publish.republish_presets.insert(old);
            publish
                .republish_presets
                .insert(RESERVED_PRESET_CUSTOM.to_string());
            changed = true;
        }

        // Individually adjusted members can no longer be represented as a
        // single group level
        for (id, members) in resolved {
            if data.group_levels[id as usize] != LEVEL_UNSET {
                data.group_levels[id as usize] = LEVEL_UNSET;
                data.group_mask &= !members;
            }
        }

        if changed {
            self.persist_levels_locked(&data);
            publish.levels_dirty = true;
            drop(data);
            drop(publish);
            self.wake.notify();
        }
    }

    fn set_power_impl(&self, addresses: u64, on: bool) {
        let mut data = self.data.lock().unwrap();
        data.power_known |= addresses;

        if on {
            let turning_on = addresses & !data.power_on;
            data.power_on |= addresses;
            // The fixtures may have forgotten their level while unpowered
            for a in 0..=MAX_ADDR {
                if turning_on & addr_bit(a) != 0 {
                    data.force_refresh[a as usize] = FORCE_REFRESH_COUNT;
                }
            }
            if turning_on != 0 {
                drop(data);
                self.wake.notify();
            }
        } else {
            data.power_on &= !addresses;
        }
    }

    fn request_group_sync_impl(&self, group: Option<&str>) {
        let mut pending: u16 = 0;
        match group {
            Some(name) => {
                if let Some(group) = self.config.get_group(name) {
                    pending |= 1 << group.id;
                }
            }
            None => {
                for name in self.config.group_names() {
                    if let Some(group) = self.config.get_group(&name) {
                        pending |= 1 << group.id;
                    }
                }
            }
        }
        if pending == 0 {
            return;
        }

        let mut data = self.data.lock().unwrap();
        data.group_sync_pending |= pending;
        drop(data);
        self.wake.notify();
    }

    // ========================================================================
    // Scheduler acknowledgements
    // ========================================================================

    /// One forced retransmission for `address` went out.
    pub fn completed_force_refresh(&self, address: u8) {
        let mut data = self.data.lock().unwrap();
        let slot = &mut data.force_refresh[(address & MAX_ADDR) as usize];
        *slot = slot.saturating_sub(1);
    }

    /// The scheduler finished rewriting group `id`'s bus membership.
    pub fn completed_group_sync(&self, id: u8) {
        let mut data = self.data.lock().unwrap();
        data.group_sync_pending &= !(1 << (id & 0x0F));
        drop(data);
        self.outbound
            .report("groups", &format!("Synchronised group {}", id));
    }

    /// The scheduler finished the broadcast programming flow.
    pub fn completed_broadcasts(&self, power_on: bool, system_failure: bool) {
        let mut data = self.data.lock().unwrap();
        if power_on {
            data.broadcast_power_on_pending = false;
        }
        if system_failure {
            data.broadcast_system_failure_pending = false;
        }
        drop(data);
        if power_on {
            self.outbound.report("lights", "Stored power-on levels");
        }
        if system_failure {
            self.outbound.report("lights", "Stored system-failure levels");
        }
    }

    // ========================================================================
    // Publisher support
    // ========================================================================

    /// The `levels` topic payload: three hex digits per address with the
    /// present and power flags folded in.
    pub fn levels_payload(&self) -> String {
        const LEVEL_PRESENT: u32 = 1 << 8;
        const LEVEL_POWER_ON: u32 = 1 << 9;
        const LEVEL_POWER_OFF: u32 = 1 << 10;

        let present = self.config.get_addresses();
        let data = self.data.lock().unwrap();
        let mut out = String::with_capacity(3 * 64);
        for a in 0..=MAX_ADDR {
            let i = a as usize;
            let mut value = data.levels[i] as u32;
            if present & addr_bit(a) != 0 {
                value |= LEVEL_PRESENT;
            }
            if data.power_known & addr_bit(a) != 0 {
                value |= if data.power_on & addr_bit(a) != 0 {
                    LEVEL_POWER_ON
                } else {
                    LEVEL_POWER_OFF
                };
            }
            out.push_str(&format!("{:03X}", value));
        }
        out
    }

    /// True if any member address currently carries `preset` as its active
    /// preset label.
    pub fn preset_active_in(&self, preset: &str, members: u64) -> bool {
        let data = self.data.lock().unwrap();
        (0..=MAX_ADDR).any(|a| {
            members & addr_bit(a) != 0 && data.active_presets[a as usize] == preset
        })
    }

    /// The levels payload, when due: on change, or at most once per minute.
    pub fn take_levels_publish(&self) -> Option<String> {
        const LEVELS_PUBLISH_PERIOD_US: u64 = 60_000_000;

        let now = self.now_us();
        let mut publish = self.publish.lock().unwrap();
        let due = publish.levels_dirty
            || publish.last_publish_levels_us == 0
            || now.wrapping_sub(publish.last_publish_levels_us) >= LEVELS_PUBLISH_PERIOD_US;
        if !due {
            return None;
        }
        publish.levels_dirty = false;
        publish.last_publish_levels_us = now;
        drop(publish);
        Some(self.levels_payload())
    }

    /// Addresses whose dimming settled [`DIM_REPORT_DELAY_US`] ago, with
    /// their final levels. Clears the timestamps it reports.
    pub fn take_dim_reports(&self) -> Vec<(u8, u8)> {
        let now = self.now_us();
        let mut data = self.data.lock().unwrap();
        let mut reports = Vec::new();
        for a in 0..=MAX_ADDR {
            let i = a as usize;
            if data.dim_time_us[i] != 0 && now.wrapping_sub(data.dim_time_us[i]) >= DIM_REPORT_DELAY_US
            {
                data.dim_time_us[i] = 0;
                reports.push((a, data.levels[i]));
            }
        }
        reports
    }

    // ========================================================================
    // Internal helpers (data lock held)
    // ========================================================================

    fn group_members_by_id(&self) -> [u64; 16] {
        let snapshot = self.config.snapshot();
        let mut members = [0u64; 16];
        for (id, entry) in snapshot.groups_by_id().iter().enumerate() {
            if let Some((_, m)) = entry {
                members[id] = *m;
            }
        }
        members
    }

    /// Individually set addresses can no longer be represented by a group
    /// level: clear the mask for them and drop the group level of every
    /// group they intersect.
    fn invalidate_group_levels_locked(
        &self,
        data: &mut LightsData,
        group_members: &[u64; 16],
        applied: u64,
    ) {
        data.group_mask &= !applied;
        for (id, members) in group_members.iter().enumerate() {
            if data.group_levels[id] != LEVEL_UNSET && members & applied != 0 {
                data.group_levels[id] = LEVEL_UNSET;
                data.group_mask &= !members;
            }
        }
    }

    fn persist_levels_locked(&self, data: &LightsData) {
        let mut retained = self.retained.lock().unwrap();
        retained::save_levels(&mut **retained, &data.levels);
    }
}

impl LightsSink for Lights {
    fn select_preset(&self, name_or_index: &str, spec: &str, internal: bool) {
        self.select_preset_impl(name_or_index, spec, internal);
    }

    fn set_level(&self, spec: &str, level: i64) {
        self.set_level_impl(spec, level);
    }

    fn dim_adjust(&self, dimmer_id: usize, delta: i64) {
        self.dim_adjust_impl(dimmer_id, delta);
    }

    fn set_power(&self, addresses: u64, on: bool) {
        self.set_power_impl(addresses, on);
    }

    fn request_group_sync(&self, group: Option<&str>) {
        self.request_group_sync_impl(group);
    }

    fn request_broadcast_power_on_level(&self) {
        let mut data = self.data.lock().unwrap();
        data.broadcast_power_on_pending = true;
        drop(data);
        self.wake.notify();
    }

    fn request_broadcast_system_failure_level(&self) {
        let mut data = self.data.lock().unwrap();
        data.broadcast_system_failure_pending = true;
        drop(data);
        self.wake.notify();
    }

    fn set_selector_position(&self, position: u8) {
        self.selector.store(position, Ordering::Relaxed);
    }
}

// ============================================================================
// Remote backend
// ============================================================================

/// Forwards light commands to another controller over the broker.
///
/// Used when this device has the physical switches and dimmers but another
/// controller drives the bus.
pub struct RemoteLights {
    config: Arc<ConfigStore>,
    outbound: Arc<OutboundQueue>,
    remote_topic: String,
    selector: AtomicU8,
}

impl RemoteLights {
    /// Create the remote backend forwarding to `remote_topic`.
    pub fn new(config: Arc<ConfigStore>, outbound: Arc<OutboundQueue>, remote_topic: &str) -> Self {
        Self {
            config,
            outbound,
            remote_topic: remote_topic.to_string(),
            selector: AtomicU8::new(0),
        }
    }
}

impl LightsSink for RemoteLights {
    fn select_preset(&self, name_or_index: &str, spec: &str, _internal: bool) {
        self.outbound.publish(
            self.remote_topic.clone(),
            format!("pt {} {}", name_or_index, spec),
            false,
        );
    }

    fn set_level(&self, spec: &str, level: i64) {
        if !(0..=MAX_LEVEL as i64).contains(&level) {
            return;
        }
        self.outbound.publish(
            self.remote_topic.clone(),
            format!("sl {} {}", spec, level),
            false,
        );
    }

    fn dim_adjust(&self, dimmer_id: usize, delta: i64) {
        if delta == 0 || delta.abs() > MAX_LEVEL as i64 {
            return;
        }
        let Some(dimmer) = self.config.get_dimmer(dimmer_id) else {
            return;
        };
        let selector = self.selector.load(Ordering::Relaxed);
        let groups = self.config.dimmer_active_groups(dimmer_id, selector);
        if groups.is_empty() {
            return;
        }

        let verb = match dimmer.mode {
            DimmerMode::Individual => "di",
            DimmerMode::Group => "dg",
        };
        self.outbound.publish(
            self.remote_topic.clone(),
            format!("{} {} {}", verb, delta, groups.join(",")),
            false,
        );
    }

    fn set_power(&self, _addresses: u64, _on: bool) {
        // Power sensing stays local; the remote controller's own refresh
        // logic restores levels.
    }

    fn request_group_sync(&self, _group: Option<&str>) {}

    fn request_broadcast_power_on_level(&self) {}

    fn request_broadcast_system_failure_level(&self) {}

    fn set_selector_position(&self, position: u8) {
        self.selector.store(position, Ordering::Relaxed);
    }
}
