//! Validated runtime configuration: addresses, groups, presets and bindings.
//!
//! [`ConfigStore`] is the process-wide configuration singleton. All mutation
//! goes through validating setters; readers get cheap copies and never block
//! on disk. Persistence is asynchronous: setters only mark the store dirty,
//! and the background save task in [`crate::persist`] writes the CBOR file.
//!
//! # Locking
//!
//! Two locks, never held across each other in the wrong order:
//!
//! - the **data lock** guards the in-memory [`ConfigData`] and is held only
//!   for short CRUD sections
//! - the **file lock** is held across filesystem calls (the flash
//!   filesystem is not reentrant) and only by the save task and the
//!   explicit load/reboot handlers
//!
//! # Example
//!
//! ```rust
//! use luxbus::config::ConfigStore;
//!
//! let store = ConfigStore::new();
//! store.set_addresses("000102");
//! store.set_group_addresses("kitchen", "0102").unwrap();
//!
//! assert_eq!(store.get_group("kitchen").unwrap().id, 0);
//! store.set_preset_level("evening", "all", 200).unwrap();
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::codec::{MAX_ADDR, MAX_GROUP, MAX_LEVEL};
use crate::parsing::{self, addr_bit};
use crate::services::OutboundQueue;

/// Number of wall-switch inputs.
pub const NUM_SWITCHES: usize = 2;
/// Number of pushbutton inputs.
pub const NUM_BUTTONS: usize = 4;
/// Number of rotary dimmer inputs.
pub const NUM_DIMMERS: usize = 2;
/// Number of hardware selector positions (two GPIO bits).
pub const NUM_SELECTOR_POSITIONS: usize = 4;

/// Maximum number of user groups (limited by 4-bit bus group ids).
pub const MAX_GROUPS: usize = MAX_GROUP as usize + 1;
/// Maximum number of user presets.
pub const MAX_PRESETS: usize = 50;

const MAX_GROUP_NAME_LEN: usize = 20;
const MAX_PRESET_NAME_LEN: usize = 50;
const MAX_BINDING_NAME_LEN: usize = 50;

/// The built-in all-zeros preset.
pub const BUILTIN_PRESET_OFF: &str = "off";
/// Active-preset label after a literal level write.
pub const RESERVED_PRESET_CUSTOM: &str = "custom";
/// Active-preset label before anything has set an address.
pub const RESERVED_PRESET_UNKNOWN: &str = "unknown";
/// Topic word selecting the ordered-preset list, not a preset.
pub const RESERVED_PRESET_ORDER: &str = "order";

const RESERVED_GROUP_WORDS: [&str; 5] = ["all", "idle", "delete", "levels", "sync"];
const RESERVED_PRESET_WORDS: [&str; 4] = [
    BUILTIN_PRESET_OFF,
    RESERVED_PRESET_CUSTOM,
    RESERVED_PRESET_ORDER,
    RESERVED_PRESET_UNKNOWN,
];

/// Per-address preset levels; `None` is the no-change sentinel.
pub type PresetLevels = [Option<u8>; 64];

// ============================================================================
// Errors
// ============================================================================

/// Why a configuration mutation was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The name fails the character/length rules or is reserved.
    InvalidName,
    /// A numeric argument is outside its allowed range.
    OutOfRange,
    /// The group or preset table is full.
    TableFull,
    /// The referenced binding index does not exist.
    NoSuchBinding,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName => write!(f, "invalid or reserved name"),
            Self::OutOfRange => write!(f, "value out of range"),
            Self::TableFull => write!(f, "table full"),
            Self::NoSuchBinding => write!(f, "no such binding"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Data model
// ============================================================================

/// A named group: a bus group id and an address membership bitset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupConfig {
    /// Bus group id in `0..=15`, pairwise distinct across groups.
    pub id: u8,
    /// Membership bitset; intersected with present addresses when applied.
    pub members: u64,
}

/// A wall-switch binding. Armed when both group and preset are set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwitchConfig {
    /// Friendly name used in reports.
    pub name: String,
    /// Bound group name.
    pub group: String,
    /// Preset applied when the switch turns on.
    pub preset: String,
}

impl SwitchConfig {
    /// A switch acts on the lights only when fully bound.
    pub fn armed(&self) -> bool {
        !self.group.is_empty() && !self.preset.is_empty()
    }
}

/// A pushbutton binding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ButtonConfig {
    /// Bound group names; empty falls back to the selector's list.
    pub groups: Vec<String>,
    /// Preset applied on press.
    pub preset: String,
}

/// Dimmer operating mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DimmerMode {
    /// Adjust each addressed light independently.
    #[default]
    Individual,
    /// Adjust the group as a whole around the member mean.
    Group,
}

impl DimmerMode {
    /// Stable text form.
    pub const fn as_str(self) -> &'static str {
        match self {
            DimmerMode::Individual => "individual",
            DimmerMode::Group => "group",
        }
    }

    /// Parse the text form.
    pub fn from_text(text: &str) -> Option<Self> {
        match text {
            "individual" => Some(DimmerMode::Individual),
            "group" => Some(DimmerMode::Group),
            _ => None,
        }
    }
}

/// A rotary dimmer binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DimmerConfig {
    /// Bound group names; empty falls back to the selector's list.
    pub groups: Vec<String>,
    /// Encoder cycles per adjustment step. Sign selects the rotation
    /// direction, zero disables the dimmer.
    pub encoder_steps: i8,
    /// Level change per adjustment step.
    pub level_steps: u8,
    /// Individual or group adjustment.
    pub mode: DimmerMode,
}

impl Default for DimmerConfig {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            encoder_steps: 4,
            level_steps: 1,
            mode: DimmerMode::Individual,
        }
    }
}

/// Alternative group list for one hardware selector position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Groups used by bindings whose own group list is empty.
    pub groups: Vec<String>,
}

/// The complete persisted configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigData {
    /// Present-address bitset; only present addresses are driven.
    pub lights: u64,
    /// Groups by name. `BTreeMap` keeps publish and save order stable.
    pub groups: BTreeMap<String, GroupConfig>,
    /// Wall-switch bindings.
    pub switches: [SwitchConfig; NUM_SWITCHES],
    /// Pushbutton bindings.
    pub buttons: [ButtonConfig; NUM_BUTTONS],
    /// Rotary dimmer bindings.
    pub dimmers: [DimmerConfig; NUM_DIMMERS],
    /// Selector fallback group lists.
    pub selector: [SelectorConfig; NUM_SELECTOR_POSITIONS],
    /// Presets by name.
    pub presets: BTreeMap<String, PresetLevels>,
    /// Ordered preset names for selection by numeric index.
    pub order: Vec<String>,
}

impl ConfigData {
    /// Resolve a group's membership bitset.
    pub fn group_members(&self, name: &str) -> Option<u64> {
        self.groups.get(name).map(|g| g.members)
    }

    /// Groups indexed by bus group id.
    pub fn groups_by_id(&self) -> [Option<(String, u64)>; MAX_GROUPS] {
        let mut by_id: [Option<(String, u64)>; MAX_GROUPS] = Default::default();
        for (name, group) in &self.groups {
            by_id[group.id as usize] = Some((name.clone(), group.members));
        }
        by_id
    }

    /// The single group an address belongs to for group-mode dimming.
    ///
    /// Groups may overlap; an address dims with the first group (in name
    /// order) that contains it and the others drop it.
    pub fn group_for_address(&self, address: u8) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, g)| g.members & addr_bit(address) != 0)
            .map(|(name, _)| name.as_str())
    }

    fn lowest_free_id(&self) -> Option<u8> {
        let used: u16 = self.groups.values().fold(0, |acc, g| acc | 1 << g.id);
        (0..=MAX_GROUP).find(|id| used & (1 << id) == 0)
    }
}

// ============================================================================
// Name validation
// ============================================================================

fn valid_name_chars(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b'a'..=b'z') => {}
        _ => return false,
    }
    bytes.all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_'))
}

/// Validate a group name: lowercase alnum plus `.-_`, starts with a letter,
/// at most 20 characters, not a reserved word.
pub fn valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_GROUP_NAME_LEN
        && valid_name_chars(name)
        && !RESERVED_GROUP_WORDS.contains(&name)
}

/// Validate a preset name: same rules as groups but up to 50 characters and
/// a different reserved list.
///
/// Requiring a leading letter also forbids purely numeric names, which
/// would otherwise be unreachable through by-name selection.
pub fn valid_preset_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_PRESET_NAME_LEN
        && valid_name_chars(name)
        && !RESERVED_PRESET_WORDS.contains(&name)
}

// ============================================================================
// ConfigStore
// ============================================================================

struct StoreData {
    current: ConfigData,
    last_saved: ConfigData,
    saved: bool,
    dirty: bool,
}

/// The configuration singleton.
///
/// See the module docs for the locking rules.
pub struct ConfigStore {
    data: Mutex<StoreData>,
    /// Held across every filesystem access; see [`crate::persist`].
    pub(crate) file: Mutex<()>,
    pub(crate) primary_path: PathBuf,
    pub(crate) backup_path: PathBuf,
    reporter: Mutex<Option<Arc<OutboundQueue>>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    /// Create an empty store with the default file locations.
    pub fn new() -> Self {
        Self::with_paths("/config.cbor".into(), "/config.cbor~".into())
    }

    /// Create an empty store with explicit file locations (tests).
    pub fn with_paths(primary: PathBuf, backup: PathBuf) -> Self {
        Self {
            data: Mutex::new(StoreData {
                current: ConfigData::default(),
                last_saved: ConfigData::default(),
                saved: false,
                dirty: false,
            }),
            file: Mutex::new(()),
            primary_path: primary,
            backup_path: backup,
            reporter: Mutex::new(None),
        }
    }

    /// Attach the outbound queue used for change reports.
    pub fn attach_outbound(&self, outbound: Arc<OutboundQueue>) {
        *self.reporter.lock().unwrap() = Some(outbound);
    }

    /// Hold the filesystem lock. Reboot handlers park here so a restart
    /// never interrupts a flash write.
    pub fn hold_file_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.file.lock().unwrap()
    }

    fn report(&self, tag: &str, message: String) {
        if let Some(outbound) = self.reporter.lock().unwrap().as_ref() {
            outbound.report(tag, &message);
        } else {
            log::info!(target: "config", "{}: {}", tag, message);
        }
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut StoreData) -> R) -> R {
        let mut data = self.data.lock().unwrap();
        f(&mut data)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut ConfigData) -> R) -> R {
        self.with_data(|data| {
            let result = f(&mut data.current);
            data.dirty = true;
            result
        })
    }

    // ========================================================================
    // Snapshots and persistence bookkeeping
    // ========================================================================

    /// Copy of the full current configuration.
    pub fn snapshot(&self) -> ConfigData {
        self.with_data(|data| data.current.clone())
    }

    /// Replace the whole configuration (load path).
    pub fn replace(&self, new: ConfigData) {
        self.with_data(|data| {
            data.current = new;
            data.dirty = true;
        });
    }

    /// True if the current configuration differs from the last saved one.
    pub fn needs_save(&self) -> bool {
        self.with_data(|data| data.dirty && (!data.saved || data.current != data.last_saved))
    }

    /// Record a completed save of `snapshot`, clearing the dirty flag only
    /// if nothing changed in the meantime.
    pub fn note_saved(&self, snapshot: &ConfigData) {
        self.with_data(|data| {
            data.last_saved = snapshot.clone();
            data.saved = true;
            if data.current == data.last_saved {
                data.dirty = false;
            }
        });
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    /// The present-address bitset.
    pub fn get_addresses(&self) -> u64 {
        self.with_data(|data| data.current.lights)
    }

    /// Replace the present-address bitset from hex pairs. Returns true if
    /// the set changed.
    pub fn set_addresses(&self, hex: &str) -> bool {
        let mask = parsing::parse_addresses(hex);
        let (changed, before) = self.mutate(|config| {
            let before = config.lights;
            config.lights = mask;
            (before != mask, before)
        });

        if changed {
            self.report(
                "lights",
                format!(
                    "Addresses: {} -> {}",
                    parsing::addresses_text(before),
                    parsing::addresses_text(mask)
                ),
            );
        }
        changed
    }

    /// The present-address bitset as hex pairs.
    pub fn addresses_text(&self) -> String {
        parsing::addresses_text(self.get_addresses())
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// All group names, in stable order.
    pub fn group_names(&self) -> Vec<String> {
        self.with_data(|data| data.current.groups.keys().cloned().collect())
    }

    /// Look up a group.
    pub fn get_group(&self, name: &str) -> Option<GroupConfig> {
        self.with_data(|data| data.current.groups.get(name).copied())
    }

    /// A group's membership bitset (not yet intersected with present).
    pub fn get_group_addresses(&self, name: &str) -> u64 {
        self.get_group(name).map(|g| g.members).unwrap_or(0)
    }

    /// Create or update a group's membership from hex pairs.
    ///
    /// Returns true if the membership actually changed; callers use that to
    /// request a bus-side group sync.
    pub fn set_group_addresses(&self, name: &str, hex: &str) -> Result<bool, ConfigError> {
        if !valid_group_name(name) {
            return Err(ConfigError::InvalidName);
        }

        let members = parsing::parse_addresses(hex);
        let result = self.mutate(|config| {
            if let Some(group) = config.groups.get_mut(name) {
                let before = group.members;
                group.members = members;
                return Ok((before != members, Some(before)));
            }

            let id = config.lowest_free_id().ok_or(ConfigError::TableFull)?;
            config
                .groups
                .insert(name.to_string(), GroupConfig { id, members });
            Ok((true, None))
        });

        match result {
            Ok((changed, before)) => {
                if changed {
                    let before_text = before
                        .map(parsing::addresses_text)
                        .unwrap_or_else(|| "(new)".to_string());
                    self.report(
                        "groups",
                        format!(
                            "Group {}: {} -> {}",
                            name,
                            before_text,
                            parsing::addresses_text(members)
                        ),
                    );
                }
                Ok(changed)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a group. Returns true if it existed.
    pub fn delete_group(&self, name: &str) -> bool {
        let removed = self.mutate(|config| config.groups.remove(name));
        if let Some(group) = removed {
            self.report(
                "groups",
                format!(
                    "Group {}: {} (deleted)",
                    name,
                    parsing::addresses_text(group.members)
                ),
            );
            true
        } else {
            false
        }
    }

    /// Membership resolver for the light-spec parser.
    pub fn group_lookup(&self, name: &str) -> Option<u64> {
        self.with_data(|data| data.current.groups.get(name).map(|g| g.members))
    }

    // ========================================================================
    // Presets
    // ========================================================================

    /// All preset names including the built-in and reserved labels.
    pub fn preset_names(&self) -> Vec<String> {
        self.with_data(|data| {
            let mut names: Vec<String> = vec![
                BUILTIN_PRESET_OFF.to_string(),
                RESERVED_PRESET_CUSTOM.to_string(),
                RESERVED_PRESET_UNKNOWN.to_string(),
            ];
            names.extend(data.current.presets.keys().cloned());
            names
        })
    }

    /// Look up a preset's levels; `off` is built in as all zeros.
    pub fn get_preset(&self, name: &str) -> Option<PresetLevels> {
        if name == BUILTIN_PRESET_OFF {
            return Some([Some(0); 64]);
        }
        self.with_data(|data| data.current.presets.get(name).copied())
    }

    /// Merge a level into a preset for the addresses in `spec`.
    ///
    /// `level` is `0..=254`, or `-1` to reset those addresses to no-change.
    /// The write is intersected with present addresses, and entries for
    /// absent addresses are cleared.
    pub fn set_preset_level(&self, name: &str, spec: &str, level: i64) -> Result<(), ConfigError> {
        if !(-1..=MAX_LEVEL as i64).contains(&level) {
            return Err(ConfigError::OutOfRange);
        }
        if !valid_preset_name(name) {
            return Err(ConfigError::InvalidName);
        }

        let spec = parsing::parse_light_spec(spec, |g| self.group_lookup(g));
        let (before, after, present) = self.mutate(|config| {
            let present = config.lights;
            if !config.presets.contains_key(name) && config.presets.len() >= MAX_PRESETS {
                return Err(ConfigError::TableFull);
            }
            let levels = config.presets.entry(name.to_string()).or_insert([None; 64]);

            let before = *levels;
            for a in 0..=MAX_ADDR {
                let bit = addr_bit(a);
                if present & bit == 0 {
                    levels[a as usize] = None;
                } else if spec.mask & bit != 0 {
                    levels[a as usize] = if level < 0 { None } else { Some(level as u8) };
                }
            }
            Ok((before, *levels, present))
        })?;

        self.report(
            "presets",
            format!(
                "Preset {}: {} = {}",
                name,
                parsing::lights_text(spec.mask, present),
                level
            ),
        );
        if before != after {
            self.report(
                "presets",
                format!(
                    "Preset {}: {} -> {}",
                    name,
                    parsing::levels_text(&before, Some(present)),
                    parsing::levels_text(&after, Some(present))
                ),
            );
        }
        Ok(())
    }

    /// Replace a preset's whole level vector from a 128-hex-digit string.
    pub fn set_preset_levels_hex(&self, name: &str, hex: &str) -> Result<bool, ConfigError> {
        if !valid_preset_name(name) {
            return Err(ConfigError::InvalidName);
        }

        let new_levels = parsing::parse_levels_hex(hex);
        let (changed, before, present) = self.mutate(|config| {
            if !config.presets.contains_key(name) && config.presets.len() >= MAX_PRESETS {
                return Err(ConfigError::TableFull);
            }
            let present = config.lights;
            let levels = config.presets.entry(name.to_string()).or_insert([None; 64]);
            let before = *levels;
            *levels = new_levels;
            Ok((before != new_levels, before, present))
        })?;

        if changed {
            self.report(
                "presets",
                format!(
                    "Preset {}: {} -> {}",
                    name,
                    parsing::levels_text(&before, Some(present)),
                    parsing::levels_text(&new_levels, Some(present))
                ),
            );
        }
        Ok(changed)
    }

    /// Delete a preset. Returns true if it existed.
    pub fn delete_preset(&self, name: &str) -> bool {
        let removed = self.mutate(|config| {
            let removed = config.presets.remove(name);
            if removed.is_some() {
                config.order.retain(|n| n != name);
            }
            removed
        });

        if let Some(levels) = removed {
            let present = self.get_addresses();
            self.report(
                "presets",
                format!(
                    "Preset {}: {} (deleted)",
                    name,
                    parsing::levels_text(&levels, Some(present))
                ),
            );
            true
        } else {
            false
        }
    }

    /// Replace the ordered preset list from comma-separated names.
    ///
    /// Invalid names are skipped; the rest keep their order.
    pub fn set_ordered_presets(&self, csv: &str) {
        let order: Vec<String> = csv
            .split(',')
            .filter(|name| valid_preset_name(name) || *name == BUILTIN_PRESET_OFF)
            .map(str::to_string)
            .collect();

        let changed = self.mutate(|config| {
            let changed = config.order != order;
            config.order = order.clone();
            changed
        });

        if changed {
            self.report("presets", format!("Preset order: {}", order.join(",")));
        }
    }

    /// Resolve a numeric preset selection through the ordered list,
    /// modulo its length.
    pub fn ordered_preset(&self, index: u64) -> Option<String> {
        self.with_data(|data| {
            let order = &data.current.order;
            if order.is_empty() {
                None
            } else {
                Some(order[(index % order.len() as u64) as usize].clone())
            }
        })
    }

    // ========================================================================
    // Switches
    // ========================================================================

    /// A switch binding by index.
    pub fn get_switch(&self, id: usize) -> Option<SwitchConfig> {
        self.with_data(|data| data.current.switches.get(id).cloned())
    }

    /// Set a switch's friendly name.
    pub fn set_switch_name(&self, id: usize, name: &str) -> Result<(), ConfigError> {
        if name.len() > MAX_BINDING_NAME_LEN {
            return Err(ConfigError::InvalidName);
        }
        self.set_switch_field(id, "name", name, |s| &mut s.name)
    }

    /// Bind a switch to a group by name.
    pub fn set_switch_group(&self, id: usize, group: &str) -> Result<(), ConfigError> {
        if !group.is_empty() && !valid_group_name(group) {
            return Err(ConfigError::InvalidName);
        }
        self.set_switch_field(id, "group", group, |s| &mut s.group)
    }

    /// Bind a switch to a preset by name.
    pub fn set_switch_preset(&self, id: usize, preset: &str) -> Result<(), ConfigError> {
        if !preset.is_empty() && !valid_preset_name(preset) && preset != BUILTIN_PRESET_OFF {
            return Err(ConfigError::InvalidName);
        }
        self.set_switch_field(id, "preset", preset, |s| &mut s.preset)
    }

    fn set_switch_field(
        &self,
        id: usize,
        field: &str,
        value: &str,
        access: fn(&mut SwitchConfig) -> &mut String,
    ) -> Result<(), ConfigError> {
        let before = self.mutate(|config| {
            let switch = config.switches.get_mut(id).ok_or(ConfigError::NoSuchBinding)?;
            let slot = access(switch);
            let before = slot.clone();
            *slot = value.to_string();
            Ok(before)
        })?;

        if before != value {
            self.report(
                "switch",
                format!("Switch {} {}: {} -> {}", id, field, before, value),
            );
        }
        Ok(())
    }

    // ========================================================================
    // Buttons
    // ========================================================================

    /// A button binding by index.
    pub fn get_button(&self, id: usize) -> Option<ButtonConfig> {
        self.with_data(|data| data.current.buttons.get(id).cloned())
    }

    /// Bind a button to groups (csv) and validate the names.
    pub fn set_button_groups(&self, id: usize, csv: &str) -> Result<(), ConfigError> {
        let groups = parse_group_list(csv)?;
        self.mutate(|config| {
            let button = config.buttons.get_mut(id).ok_or(ConfigError::NoSuchBinding)?;
            button.groups = groups;
            Ok(())
        })
    }

    /// Bind a button to a preset.
    pub fn set_button_preset(&self, id: usize, preset: &str) -> Result<(), ConfigError> {
        if !preset.is_empty() && !valid_preset_name(preset) && preset != BUILTIN_PRESET_OFF {
            return Err(ConfigError::InvalidName);
        }
        self.mutate(|config| {
            let button = config.buttons.get_mut(id).ok_or(ConfigError::NoSuchBinding)?;
            button.preset = preset.to_string();
            Ok(())
        })
    }

    /// A button's effective groups, falling back to the selector position's
    /// list when the binding's own list is empty.
    pub fn button_active_groups(&self, id: usize, selector: u8) -> Vec<String> {
        self.with_data(|data| {
            let Some(button) = data.current.buttons.get(id) else {
                return Vec::new();
            };
            if !button.groups.is_empty() {
                return button.groups.clone();
            }
            data.current
                .selector
                .get(selector as usize)
                .map(|s| s.groups.clone())
                .unwrap_or_default()
        })
    }

    // ========================================================================
    // Dimmers
    // ========================================================================

    /// A dimmer binding by index.
    pub fn get_dimmer(&self, id: usize) -> Option<DimmerConfig> {
        self.with_data(|data| data.current.dimmers.get(id).cloned())
    }

    /// Bind a dimmer to groups (csv).
    pub fn set_dimmer_groups(&self, id: usize, csv: &str) -> Result<(), ConfigError> {
        let groups = parse_group_list(csv)?;
        self.mutate(|config| {
            let dimmer = config.dimmers.get_mut(id).ok_or(ConfigError::NoSuchBinding)?;
            dimmer.groups = groups;
            Ok(())
        })
    }

    /// Set a dimmer's encoder divisor, `-127..=127`; zero disables.
    pub fn set_dimmer_encoder_steps(&self, id: usize, steps: i64) -> Result<(), ConfigError> {
        if !(-127..=127).contains(&steps) {
            return Err(ConfigError::OutOfRange);
        }
        self.mutate(|config| {
            let dimmer = config.dimmers.get_mut(id).ok_or(ConfigError::NoSuchBinding)?;
            dimmer.encoder_steps = steps as i8;
            Ok(())
        })
    }

    /// Set a dimmer's level change per step, `0..=254`.
    pub fn set_dimmer_level_steps(&self, id: usize, steps: i64) -> Result<(), ConfigError> {
        if !(0..=MAX_LEVEL as i64).contains(&steps) {
            return Err(ConfigError::OutOfRange);
        }
        self.mutate(|config| {
            let dimmer = config.dimmers.get_mut(id).ok_or(ConfigError::NoSuchBinding)?;
            dimmer.level_steps = steps as u8;
            Ok(())
        })
    }

    /// Set a dimmer's mode from its text form.
    pub fn set_dimmer_mode(&self, id: usize, text: &str) -> Result<(), ConfigError> {
        let mode = DimmerMode::from_text(text).ok_or(ConfigError::OutOfRange)?;
        self.mutate(|config| {
            let dimmer = config.dimmers.get_mut(id).ok_or(ConfigError::NoSuchBinding)?;
            dimmer.mode = mode;
            Ok(())
        })
    }

    /// A dimmer's effective groups, with selector fallback.
    pub fn dimmer_active_groups(&self, id: usize, selector: u8) -> Vec<String> {
        self.with_data(|data| {
            let Some(dimmer) = data.current.dimmers.get(id) else {
                return Vec::new();
            };
            if !dimmer.groups.is_empty() {
                return dimmer.groups.clone();
            }
            data.current
                .selector
                .get(selector as usize)
                .map(|s| s.groups.clone())
                .unwrap_or_default()
        })
    }

    // ========================================================================
    // Selector
    // ========================================================================

    /// Set the fallback group list for one selector position.
    pub fn set_selector_groups(&self, position: usize, csv: &str) -> Result<(), ConfigError> {
        let groups = parse_group_list(csv)?;
        self.mutate(|config| {
            let slot = config
                .selector
                .get_mut(position)
                .ok_or(ConfigError::NoSuchBinding)?;
            slot.groups = groups;
            Ok(())
        })
    }

    /// The single group an address belongs to for group-mode dimming.
    pub fn group_for_address(&self, address: u8) -> Option<String> {
        self.with_data(|data| data.current.group_for_address(address).map(str::to_string))
    }
}

fn parse_group_list(csv: &str) -> Result<Vec<String>, ConfigError> {
    if csv.is_empty() {
        return Ok(Vec::new());
    }
    let mut groups = Vec::new();
    for name in csv.split(',') {
        if !valid_group_name(name) {
            return Err(ConfigError::InvalidName);
        }
        groups.push(name.to_string());
    }
    Ok(groups)
}

// ============================================================================
// Group id assignment (load path)
// ============================================================================

/// Assign bus group ids for a freshly loaded group table.
///
/// Explicitly requested ids win when unique and in range; the remaining
/// groups take the lowest free id in name order. The result is a
/// permutation of the lowest ids that preserves valid prior assignments.
pub fn assign_group_ids(requested: &BTreeMap<String, (Option<u8>, u64)>) -> BTreeMap<String, GroupConfig> {
    let mut used: u16 = 0;
    let mut out: BTreeMap<String, GroupConfig> = BTreeMap::new();

    // First pass: honor unique, in-range explicit ids
    for (name, (id, members)) in requested {
        if let Some(id) = id {
            if *id <= MAX_GROUP && used & (1 << id) == 0 {
                used |= 1 << id;
                out.insert(name.clone(), GroupConfig { id: *id, members: *members });
            }
        }
    }

    // Second pass: everything else gets the lowest free id
    for (name, (_, members)) in requested {
        if out.contains_key(name) {
            continue;
        }
        let Some(free) = (0..=MAX_GROUP).find(|id| used & (1 << id) == 0) else {
            break;
        };
        used |= 1 << free;
        out.insert(name.clone(), GroupConfig { id: free, members: *members });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Name validation
    // =========================================================================

    #[test]
    fn group_name_rules() {
        assert!(valid_group_name("kitchen"));
        assert!(valid_group_name("a1.b-c_d"));
        assert!(!valid_group_name(""));
        assert!(!valid_group_name("Kitchen"));
        assert!(!valid_group_name("1kitchen"));
        assert!(!valid_group_name(".dot"));
        assert!(!valid_group_name(&"a".repeat(21)));
        assert!(valid_group_name(&"a".repeat(20)));
    }

    #[test]
    fn group_reserved_words() {
        for word in ["all", "idle", "delete", "levels", "sync"] {
            assert!(!valid_group_name(word), "{}", word);
        }
    }

    #[test]
    fn preset_name_rules() {
        assert!(valid_preset_name("evening"));
        assert!(valid_preset_name(&"a".repeat(50)));
        assert!(!valid_preset_name(&"a".repeat(51)));
        for word in ["off", "custom", "order", "unknown"] {
            assert!(!valid_preset_name(word), "{}", word);
        }
        // Numeric names would be shadowed by index selection
        assert!(!valid_preset_name("42"));
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    #[test]
    fn addresses_set_and_changed() {
        let store = ConfigStore::new();
        assert!(store.set_addresses("0001"));
        assert!(!store.set_addresses("0001"));
        assert_eq!(store.get_addresses(), 0b11);
        assert!(store.needs_save());
    }

    // =========================================================================
    // Groups
    // =========================================================================

    #[test]
    fn group_create_assigns_lowest_id() {
        let store = ConfigStore::new();
        store.set_group_addresses("a", "00").unwrap();
        store.set_group_addresses("b", "01").unwrap();
        assert_eq!(store.get_group("a").unwrap().id, 0);
        assert_eq!(store.get_group("b").unwrap().id, 1);
    }

    #[test]
    fn group_id_reused_after_delete() {
        let store = ConfigStore::new();
        store.set_group_addresses("a", "00").unwrap();
        store.set_group_addresses("b", "01").unwrap();
        store.delete_group("a");
        store.set_group_addresses("c", "02").unwrap();
        assert_eq!(store.get_group("c").unwrap().id, 0);
        assert_eq!(store.get_group("b").unwrap().id, 1);
    }

    #[test]
    fn group_membership_change_detection() {
        let store = ConfigStore::new();
        assert!(store.set_group_addresses("kitchen", "0506").unwrap());
        assert!(!store.set_group_addresses("kitchen", "0506").unwrap());
        assert!(store.set_group_addresses("kitchen", "05").unwrap());
    }

    #[test]
    fn group_table_full() {
        let store = ConfigStore::new();
        for i in 0..MAX_GROUPS {
            store.set_group_addresses(&format!("g{}", i), "00").unwrap();
        }
        assert_eq!(
            store.set_group_addresses("overflow", "00"),
            Err(ConfigError::TableFull)
        );
    }

    #[test]
    fn group_invalid_name_rejected() {
        let store = ConfigStore::new();
        assert_eq!(
            store.set_group_addresses("all", "00"),
            Err(ConfigError::InvalidName)
        );
    }

    #[test]
    fn group_for_address_first_wins() {
        let store = ConfigStore::new();
        store.set_group_addresses("alpha", "05").unwrap();
        store.set_group_addresses("beta", "0506").unwrap();
        // "alpha" sorts first; address 5 belongs to it for dimming
        assert_eq!(store.group_for_address(5).as_deref(), Some("alpha"));
        assert_eq!(store.group_for_address(6).as_deref(), Some("beta"));
        assert_eq!(store.group_for_address(7), None);
    }

    // =========================================================================
    // Group id assignment (load path)
    // =========================================================================

    #[test]
    fn assign_ids_explicit_win() {
        let mut requested = BTreeMap::new();
        requested.insert("a".to_string(), (Some(5), 1u64));
        requested.insert("b".to_string(), (None, 2u64));
        let out = assign_group_ids(&requested);
        assert_eq!(out["a"].id, 5);
        assert_eq!(out["b"].id, 0);
    }

    #[test]
    fn assign_ids_duplicate_explicit_falls_back() {
        let mut requested = BTreeMap::new();
        requested.insert("a".to_string(), (Some(3), 1u64));
        requested.insert("b".to_string(), (Some(3), 2u64));
        let out = assign_group_ids(&requested);
        // "a" sorts first and keeps 3; "b" falls back to lowest free
        assert_eq!(out["a"].id, 3);
        assert_eq!(out["b"].id, 0);
    }

    #[test]
    fn assign_ids_out_of_range_falls_back() {
        let mut requested = BTreeMap::new();
        requested.insert("a".to_string(), (Some(16), 1u64));
        let out = assign_group_ids(&requested);
        assert_eq!(out["a"].id, 0);
    }

    #[test]
    fn assign_ids_are_distinct() {
        let mut requested = BTreeMap::new();
        for i in 0..16u8 {
            requested.insert(format!("g{:02}", i), (Some(15 - i), 0u64));
        }
        let out = assign_group_ids(&requested);
        let mut seen = [false; 16];
        for g in out.values() {
            assert!(!seen[g.id as usize]);
            seen[g.id as usize] = true;
        }
    }

    // =========================================================================
    // Presets
    // =========================================================================

    #[test]
    fn preset_merge_respects_present() {
        let store = ConfigStore::new();
        store.set_addresses("0001");
        store.set_preset_level("evening", "all", 200).unwrap();

        let levels = store.get_preset("evening").unwrap();
        assert_eq!(levels[0], Some(200));
        assert_eq!(levels[1], Some(200));
        assert_eq!(levels[2], None);
    }

    #[test]
    fn preset_level_negative_clears() {
        let store = ConfigStore::new();
        store.set_addresses("0001");
        store.set_preset_level("evening", "all", 200).unwrap();
        store.set_preset_level("evening", "0", -1).unwrap();

        let levels = store.get_preset("evening").unwrap();
        assert_eq!(levels[0], None);
        assert_eq!(levels[1], Some(200));
    }

    #[test]
    fn preset_level_range_checked() {
        let store = ConfigStore::new();
        assert_eq!(
            store.set_preset_level("evening", "all", 255),
            Err(ConfigError::OutOfRange)
        );
        assert_eq!(
            store.set_preset_level("evening", "all", -2),
            Err(ConfigError::OutOfRange)
        );
    }

    #[test]
    fn preset_off_is_builtin() {
        let store = ConfigStore::new();
        let levels = store.get_preset("off").unwrap();
        assert!(levels.iter().all(|l| *l == Some(0)));
    }

    #[test]
    fn preset_bulk_levels() {
        let store = ConfigStore::new();
        store.set_addresses("000102");
        assert!(store.set_preset_levels_hex("night", "C8FF64").unwrap());
        let levels = store.get_preset("night").unwrap();
        assert_eq!(levels[0], Some(200));
        assert_eq!(levels[1], None);
        assert_eq!(levels[2], Some(100));
    }

    #[test]
    fn preset_delete_also_unorders() {
        let store = ConfigStore::new();
        store.set_preset_level("evening", "all", 1).ok();
        store.set_addresses("00");
        store.set_preset_level("evening", "all", 1).unwrap();
        store.set_ordered_presets("evening,off");
        assert!(store.delete_preset("evening"));
        assert_eq!(store.ordered_preset(0).as_deref(), Some("off"));
        assert!(!store.delete_preset("evening"));
    }

    #[test]
    fn preset_order_modulo() {
        let store = ConfigStore::new();
        store.set_addresses("00");
        store.set_preset_level("one", "all", 1).unwrap();
        store.set_preset_level("two", "all", 2).unwrap();
        store.set_ordered_presets("one,two");

        assert_eq!(store.ordered_preset(0).as_deref(), Some("one"));
        assert_eq!(store.ordered_preset(1).as_deref(), Some("two"));
        assert_eq!(store.ordered_preset(5).as_deref(), Some("two"));
    }

    #[test]
    fn preset_order_skips_invalid() {
        let store = ConfigStore::new();
        store.set_ordered_presets("one,Custom!,off");
        assert_eq!(store.ordered_preset(0).as_deref(), Some("one"));
        assert_eq!(store.ordered_preset(1).as_deref(), Some("off"));
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    #[test]
    fn switch_binding_and_armed() {
        let store = ConfigStore::new();
        store.set_switch_name(0, "hall").unwrap();
        assert!(!store.get_switch(0).unwrap().armed());

        store.set_switch_group(0, "kitchen").unwrap();
        store.set_switch_preset(0, "evening").unwrap();
        let switch = store.get_switch(0).unwrap();
        assert!(switch.armed());
        assert_eq!(switch.name, "hall");
    }

    #[test]
    fn switch_preset_off_allowed() {
        let store = ConfigStore::new();
        store.set_switch_preset(0, "off").unwrap();
        assert_eq!(store.get_switch(0).unwrap().preset, "off");
    }

    #[test]
    fn switch_out_of_range() {
        let store = ConfigStore::new();
        assert_eq!(
            store.set_switch_name(NUM_SWITCHES, "x"),
            Err(ConfigError::NoSuchBinding)
        );
    }

    #[test]
    fn dimmer_validation() {
        let store = ConfigStore::new();
        store.set_dimmer_encoder_steps(0, 4).unwrap();
        store.set_dimmer_level_steps(0, 10).unwrap();
        store.set_dimmer_mode(0, "group").unwrap();

        let dimmer = store.get_dimmer(0).unwrap();
        assert_eq!(dimmer.encoder_steps, 4);
        assert_eq!(dimmer.level_steps, 10);
        assert_eq!(dimmer.mode, DimmerMode::Group);

        assert_eq!(
            store.set_dimmer_encoder_steps(0, 128),
            Err(ConfigError::OutOfRange)
        );
        assert_eq!(
            store.set_dimmer_level_steps(0, 255),
            Err(ConfigError::OutOfRange)
        );
        assert_eq!(store.set_dimmer_mode(0, "both"), Err(ConfigError::OutOfRange));
    }

    #[test]
    fn selector_fallback_groups() {
        let store = ConfigStore::new();
        store.set_group_addresses("kitchen", "05").unwrap();
        store.set_group_addresses("hall", "06").unwrap();
        store.set_selector_groups(1, "hall").unwrap();

        // Empty binding falls back to the selector position
        assert_eq!(store.dimmer_active_groups(0, 1), vec!["hall".to_string()]);
        // A bound dimmer ignores the selector
        store.set_dimmer_groups(0, "kitchen").unwrap();
        assert_eq!(store.dimmer_active_groups(0, 1), vec!["kitchen".to_string()]);
    }

    #[test]
    fn button_groups_csv() {
        let store = ConfigStore::new();
        store.set_button_groups(0, "kitchen,hall").unwrap();
        assert_eq!(
            store.get_button(0).unwrap().groups,
            vec!["kitchen".to_string(), "hall".to_string()]
        );
        assert_eq!(
            store.set_button_groups(0, "kitchen,ALL"),
            Err(ConfigError::InvalidName)
        );
    }

    // =========================================================================
    // Save bookkeeping
    // =========================================================================

    #[test]
    fn save_bookkeeping() {
        let store = ConfigStore::new();
        assert!(!store.needs_save());

        store.set_addresses("00");
        assert!(store.needs_save());

        let snapshot = store.snapshot();
        store.note_saved(&snapshot);
        assert!(!store.needs_save());

        // Mutation during a save keeps the store dirty
        store.set_addresses("0001");
        let stale = snapshot;
        store.note_saved(&stale);
        assert!(store.needs_save());
    }
}
