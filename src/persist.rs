//! CBOR config file persistence with backup-and-verify.
//!
//! The configuration is mirrored to flash as a CBOR map prefixed with the
//! self-describe tag. The save protocol is write primary, re-parse primary
//! (syntactic check), then write the backup; a save only counts once both
//! files are good. The load protocol tries the primary, falls back to the
//! backup, and rewrites the primary after a recovery.
//!
//! Saves are asynchronous: mutators only mark the store dirty, and the
//! background save task calls [`save`], which copies the current data under
//! the data lock, writes without holding it, and loops if the configuration
//! changed during the write. Readers never block on flash.
//!
//! The wire format is forward-compatible: unknown map keys are skipped, but
//! a type mismatch inside a known key fails that load.

use std::collections::BTreeMap;
use std::fs;
use std::io;

use minicbor::data::Tag;
use minicbor::{Decoder, Encoder};

use crate::config::{
    assign_group_ids, valid_group_name, valid_preset_name, ConfigData, ConfigStore, DimmerMode,
    PresetLevels, NUM_BUTTONS, NUM_DIMMERS, NUM_SELECTOR_POSITIONS, NUM_SWITCHES,
};

/// IANA "self-described CBOR" tag.
const SELF_DESCRIBE_TAG: u64 = 55799;

/// How a boot-time configuration load resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The primary file parsed.
    Primary,
    /// The primary failed; the backup parsed and the primary was rewritten.
    Backup,
    /// Neither file parsed; defaults are in effect.
    Defaults,
}

/// Persistence failures. The save task retries on the next dirty tick.
#[derive(Debug)]
pub enum PersistError {
    /// Filesystem error.
    Io(io::Error),
    /// CBOR structure or type error.
    Decode(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file I/O: {}", e),
            Self::Decode(e) => write!(f, "config file parse: {}", e),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<io::Error> for PersistError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<minicbor::decode::Error> for PersistError {
    fn from(e: minicbor::decode::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

type EncodeResult = Result<(), minicbor::encode::Error<core::convert::Infallible>>;

// ============================================================================
// Encoding
// ============================================================================

/// Encode the configuration as tagged CBOR.
pub fn encode(config: &ConfigData) -> Vec<u8> {
    let mut buf = Vec::new();
    // Vec<u8> cannot fail to write
    let _ = encode_into(config, &mut buf);
    buf
}

fn encode_into(config: &ConfigData, buf: &mut Vec<u8>) -> EncodeResult {
    let mut e = Encoder::new(buf);
    e.tag(Tag::new(SELF_DESCRIBE_TAG))?;
    e.map(8)?;

    e.str("lights")?;
    encode_bitset(&mut e, config.lights)?;

    e.str("groups")?;
    e.array(config.groups.len() as u64)?;
    for (name, group) in &config.groups {
        e.map(3)?;
        e.str("name")?.str(name)?;
        e.str("id")?.u8(group.id)?;
        e.str("lights")?;
        encode_bitset(&mut e, group.members)?;
    }

    e.str("switches")?;
    e.array(NUM_SWITCHES as u64)?;
    for switch in &config.switches {
        e.map(3)?;
        e.str("name")?.str(&switch.name)?;
        e.str("group")?.str(&switch.group)?;
        e.str("preset")?.str(&switch.preset)?;
    }

    e.str("buttons")?;
    e.array(NUM_BUTTONS as u64)?;
    for button in &config.buttons {
        e.map(2)?;
        e.str("groups")?;
        encode_names(&mut e, &button.groups)?;
        e.str("preset")?.str(&button.preset)?;
    }

    e.str("dimmers")?;
    e.array(NUM_DIMMERS as u64)?;
    for dimmer in &config.dimmers {
        e.map(4)?;
        e.str("groups")?;
        encode_names(&mut e, &dimmer.groups)?;
        e.str("encoder_steps")?.i8(dimmer.encoder_steps)?;
        e.str("level_steps")?.u8(dimmer.level_steps)?;
        e.str("mode")?.str(dimmer.mode.as_str())?;
    }

    e.str("selector")?;
    e.array(NUM_SELECTOR_POSITIONS as u64)?;
    for position in &config.selector {
        e.map(1)?;
        e.str("groups")?;
        encode_names(&mut e, &position.groups)?;
    }

    e.str("presets")?;
    e.array(config.presets.len() as u64)?;
    for (name, levels) in &config.presets {
        e.map(2)?;
        e.str("name")?.str(name)?;
        e.str("levels")?;
        e.array(64)?;
        for level in levels {
            match level {
                Some(level) => e.i32(*level as i32)?,
                None => e.i32(-1)?,
            };
        }
    }

    e.str("order")?;
    encode_names(&mut e, &config.order)?;

    Ok(())
}

fn encode_bitset(e: &mut Encoder<&mut Vec<u8>>, mask: u64) -> EncodeResult {
    e.array(64)?;
    for a in 0..64 {
        e.bool(mask & (1 << a) != 0)?;
    }
    Ok(())
}

fn encode_names(e: &mut Encoder<&mut Vec<u8>>, names: &[String]) -> EncodeResult {
    e.array(names.len() as u64)?;
    for name in names {
        e.str(name)?;
    }
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a tagged CBOR configuration.
pub fn decode(bytes: &[u8]) -> Result<ConfigData, PersistError> {
    let mut d = Decoder::new(bytes);

    let tag = d.tag()?;
    if tag != Tag::new(SELF_DESCRIBE_TAG) {
        return Err(PersistError::Decode("missing self-describe tag".into()));
    }

    let mut config = ConfigData::default();
    let mut requested_groups: BTreeMap<String, (Option<u8>, u64)> = BTreeMap::new();

    let len = d
        .map()?
        .ok_or_else(|| PersistError::Decode("indefinite map".into()))?;

    for _ in 0..len {
        let key = d.str()?.to_string();
        match key.as_str() {
            "lights" => config.lights = decode_bitset(&mut d)?,
            "groups" => {
                let n = decode_len(&mut d)?;
                for _ in 0..n {
                    decode_group(&mut d, &mut requested_groups)?;
                }
            }
            "switches" => {
                let n = decode_len(&mut d)?;
                for i in 0..n {
                    decode_switch(&mut d, &mut config, i as usize)?;
                }
            }
            "buttons" => {
                let n = decode_len(&mut d)?;
                for i in 0..n {
                    decode_button(&mut d, &mut config, i as usize)?;
                }
            }
            "dimmers" => {
                let n = decode_len(&mut d)?;
                for i in 0..n {
                    decode_dimmer(&mut d, &mut config, i as usize)?;
                }
            }
            "selector" => {
                let n = decode_len(&mut d)?;
                for i in 0..n {
                    let groups = decode_names(&mut d)?;
                    if let Some(slot) = config.selector.get_mut(i as usize) {
                        slot.groups = groups;
                    }
                }
            }
            "presets" => {
                let n = decode_len(&mut d)?;
                for _ in 0..n {
                    decode_preset(&mut d, &mut config)?;
                }
            }
            "order" => {
                config.order = decode_names(&mut d)?
                    .into_iter()
                    .filter(|n| valid_preset_name(n) || n == "off")
                    .collect();
            }
            _ => {
                log::warn!(target: "config", "unknown config key: {}", key);
                d.skip()?;
            }
        }
    }

    config.groups = assign_group_ids(&requested_groups);
    Ok(config)
}

fn decode_len(d: &mut Decoder<'_>) -> Result<u64, PersistError> {
    d.array()?
        .ok_or_else(|| PersistError::Decode("indefinite array".into()))
}

fn decode_map_len(d: &mut Decoder<'_>) -> Result<u64, PersistError> {
    d.map()?
        .ok_or_else(|| PersistError::Decode("indefinite map".into()))
}

fn decode_bitset(d: &mut Decoder<'_>) -> Result<u64, PersistError> {
    let n = decode_len(d)?;
    let mut mask = 0u64;
    for i in 0..n {
        if d.bool()? && i < 64 {
            mask |= 1 << i;
        }
    }
    Ok(mask)
}

fn decode_names(d: &mut Decoder<'_>) -> Result<Vec<String>, PersistError> {
    let n = decode_len(d)?;
    let mut names = Vec::new();
    for _ in 0..n {
        names.push(d.str()?.to_string());
    }
    Ok(names)
}

fn decode_group(
    d: &mut Decoder<'_>,
    requested: &mut BTreeMap<String, (Option<u8>, u64)>,
) -> Result<(), PersistError> {
    let len = decode_map_len(d)?;
    let mut name = String::new();
    let mut id: Option<u8> = None;
    let mut members = 0u64;

    for _ in 0..len {
        let key = d.str()?.to_string();
        match key.as_str() {
            "name" => name = d.str()?.to_string(),
            "id" => {
                let value = d.i64()?;
                id = (0..=15).contains(&value).then_some(value as u8);
            }
            "lights" => members = decode_bitset(d)?,
            _ => d.skip()?,
        }
    }

    if valid_group_name(&name) {
        requested.entry(name).or_insert((id, members));
    } else {
        log::warn!(target: "config", "ignoring invalid group: {}", name);
    }
    Ok(())
}

fn decode_switch(
    d: &mut Decoder<'_>,
    config: &mut ConfigData,
    index: usize,
) -> Result<(), PersistError> {
    let len = decode_map_len(d)?;
    for _ in 0..len {
        let key = d.str()?.to_string();
        match key.as_str() {
            "name" | "group" | "preset" => {
                let value = d.str()?.to_string();
                let Some(switch) = config.switches.get_mut(index) else {
                    continue;
                };
                match key.as_str() {
                    "name" => switch.name = value,
                    "group" => switch.group = value,
                    _ => switch.preset = value,
                }
            }
            _ => d.skip()?,
        }
    }
    Ok(())
}

fn decode_button(
    d: &mut Decoder<'_>,
    config: &mut ConfigData,
    index: usize,
) -> Result<(), PersistError> {
    let len = decode_map_len(d)?;
    for _ in 0..len {
        let key = d.str()?.to_string();
        match key.as_str() {
            "groups" => {
                let groups = decode_names(d)?;
                if let Some(button) = config.buttons.get_mut(index) {
                    button.groups = groups;
                }
            }
            "preset" => {
                let preset = d.str()?.to_string();
                if let Some(button) = config.buttons.get_mut(index) {
                    button.preset = preset;
                }
            }
            _ => d.skip()?,
        }
    }
    Ok(())
}

fn decode_dimmer(
    d: &mut Decoder<'_>,
    config: &mut ConfigData,
    index: usize,
) -> Result<(), PersistError> {
    let len = decode_map_len(d)?;
    for _ in 0..len {
        let key = d.str()?.to_string();
        match key.as_str() {
            "groups" => {
                let groups = decode_names(d)?;
                if let Some(dimmer) = config.dimmers.get_mut(index) {
                    dimmer.groups = groups;
                }
            }
            "encoder_steps" => {
                let value = d.i64()?;
                if let Some(dimmer) = config.dimmers.get_mut(index) {
                    if (-127..=127).contains(&value) {
                        dimmer.encoder_steps = value as i8;
                    }
                }
            }
            "level_steps" => {
                let value = d.i64()?;
                if let Some(dimmer) = config.dimmers.get_mut(index) {
                    if (0..=254).contains(&value) {
                        dimmer.level_steps = value as u8;
                    }
                }
            }
            "mode" => {
                let text = d.str()?.to_string();
                if let Some(dimmer) = config.dimmers.get_mut(index) {
                    if let Some(mode) = DimmerMode::from_text(&text) {
                        dimmer.mode = mode;
                    }
                }
            }
            _ => d.skip()?,
        }
    }
    Ok(())
}

fn decode_preset(d: &mut Decoder<'_>, config: &mut ConfigData) -> Result<(), PersistError> {
    let len = decode_map_len(d)?;
    let mut name = String::new();
    let mut levels: PresetLevels = [None; 64];

    for _ in 0..len {
        let key = d.str()?.to_string();
        match key.as_str() {
            "name" => name = d.str()?.to_string(),
            "levels" => {
                let n = decode_len(d)?;
                for i in 0..n {
                    let value = d.i64()?;
                    if i < 64 && (0..=254).contains(&value) {
                        levels[i as usize] = Some(value as u8);
                    }
                }
            }
            _ => d.skip()?,
        }
    }

    if valid_preset_name(&name) {
        if config.presets.contains_key(&name) {
            log::warn!(target: "config", "ignoring duplicate preset: {}", name);
        } else {
            config.presets.insert(name, levels);
        }
    } else {
        log::warn!(target: "config", "ignoring invalid preset: {}", name);
    }
    Ok(())
}

// ============================================================================
// File protocol
// ============================================================================

/// Write the configuration if it changed since the last completed save.
///
/// Runs the full backup-and-verify protocol and loops until the saved
/// snapshot matches the live configuration, so a mutation racing the write
/// triggers a second pass instead of being lost. Returns true if anything
/// was written.
pub fn save(store: &ConfigStore) -> Result<bool, PersistError> {
    let mut wrote = false;

    while store.needs_save() {
        let _file = store.file.lock().unwrap();
        let snapshot = store.snapshot();
        let bytes = encode(&snapshot);

        log::info!(target: "config", "writing {}", store.primary_path.display());
        fs::write(&store.primary_path, &bytes)?;

        // Syntactic re-check of what actually landed on flash
        let written = fs::read(&store.primary_path)?;
        decode(&written)?;

        // Backup goes through a rename so it is never half-written
        let tmp = store.backup_path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &store.backup_path)?;

        store.note_saved(&snapshot);
        wrote = true;
    }

    Ok(wrote)
}

/// Load the configuration at boot or on an explicit reload.
pub fn load(store: &ConfigStore) -> LoadOutcome {
    let outcome = {
        let _file = store.file.lock().unwrap();

        match read_file(&store.primary_path) {
            Ok(config) => {
                let snapshot = {
                    store.replace(config);
                    store.snapshot()
                };
                store.note_saved(&snapshot);
                LoadOutcome::Primary
            }
            Err(primary_err) => {
                log::error!(
                    target: "config",
                    "{}: {}",
                    store.primary_path.display(),
                    primary_err
                );
                match read_file(&store.backup_path) {
                    Ok(config) => {
                        store.replace(config);
                        LoadOutcome::Backup
                    }
                    Err(backup_err) => {
                        log::error!(
                            target: "config",
                            "{}: {}",
                            store.backup_path.display(),
                            backup_err
                        );
                        LoadOutcome::Defaults
                    }
                }
            }
        }
    };

    if outcome == LoadOutcome::Backup {
        // Recovered from the backup: rewrite the primary
        if let Err(e) = save(store) {
            log::error!(target: "config", "rewrite after recovery failed: {}", e);
        }
    }

    outcome
}

fn read_file(path: &std::path::Path) -> Result<ConfigData, PersistError> {
    let bytes = fs::read(path)?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_store(tag: &str) -> ConfigStore {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir();
        let base = format!("luxbus-{}-{}-{}", std::process::id(), tag, seq);
        ConfigStore::with_paths(
            dir.join(format!("{}.cbor", base)),
            dir.join(format!("{}.cbor~", base)),
        )
    }

    fn populated(tag: &str) -> ConfigStore {
        let store = temp_store(tag);
        store.set_addresses("00010203");
        store.set_group_addresses("a", "0001").unwrap();
        store.set_group_addresses("b", "0203").unwrap();
        store.set_preset_level("x", "0,1", 200).unwrap();
        store.set_preset_level("x", "2,3", 100).unwrap();
        store.set_ordered_presets("x,off");
        store.set_switch_name(0, "hall").unwrap();
        store.set_switch_group(0, "a").unwrap();
        store.set_switch_preset(0, "x").unwrap();
        store.set_button_groups(1, "b").unwrap();
        store.set_button_preset(1, "x").unwrap();
        store.set_dimmer_groups(0, "a,b").unwrap();
        store.set_dimmer_encoder_steps(0, -4).unwrap();
        store.set_dimmer_level_steps(0, 10).unwrap();
        store.set_dimmer_mode(0, "group").unwrap();
        store.set_selector_groups(2, "a").unwrap();
        store
    }

    #[test]
    fn encode_decode_round_trip() {
        let store = populated("roundtrip");
        let original = store.snapshot();

        let decoded = decode(&encode(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn decode_requires_tag() {
        let store = populated("notag");
        let bytes = encode(&store.snapshot());
        // Strip the 3-byte self-describe tag prefix
        assert!(decode(&bytes[3..]).is_err());
    }

    #[test]
    fn decode_skips_unknown_keys() {
        // A map with one unknown key followed by a known one
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.tag(Tag::new(SELF_DESCRIBE_TAG)).unwrap();
        e.map(2).unwrap();
        e.str("future_feature").unwrap();
        e.array(2).unwrap();
        e.u8(1).unwrap();
        e.u8(2).unwrap();
        e.str("lights").unwrap();
        e.array(64).unwrap();
        for i in 0..64 {
            e.bool(i == 5).unwrap();
        }

        let config = decode(&buf).unwrap();
        assert_eq!(config.lights, 1 << 5);
    }

    #[test]
    fn decode_rejects_type_mismatch_in_known_key() {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.tag(Tag::new(SELF_DESCRIBE_TAG)).unwrap();
        e.map(1).unwrap();
        e.str("lights").unwrap();
        e.str("not an array").unwrap();

        assert!(decode(&buf).is_err());
    }

    #[test]
    fn decode_drops_invalid_names() {
        let store = temp_store("invalid");
        let mut config = store.snapshot();
        config
            .presets
            .insert("Bad Name!".to_string(), [None; 64]);
        config.groups.insert(
            "ALL".to_string(),
            crate::config::GroupConfig { id: 0, members: 1 },
        );

        let decoded = decode(&encode(&config)).unwrap();
        assert!(decoded.presets.is_empty());
        assert!(decoded.groups.is_empty());
    }

    #[test]
    fn group_ids_preserved_across_save_load() {
        let store = populated("ids");
        let before = store.snapshot();
        save(&store).unwrap();

        let reloaded = temp_store("ids2");
        let decoded = decode(&encode(&before)).unwrap();
        reloaded.replace(decoded);

        assert_eq!(
            reloaded.get_group("a").unwrap().id,
            store.get_group("a").unwrap().id
        );
        assert_eq!(
            reloaded.get_group("b").unwrap().id,
            store.get_group("b").unwrap().id
        );
    }

    #[test]
    fn save_writes_both_files_and_clears_dirty() {
        let store = populated("save");
        assert!(store.needs_save());
        assert!(save(&store).unwrap());
        assert!(!store.needs_save());
        assert!(store.primary_path.exists());
        assert!(store.backup_path.exists());

        // Unchanged: save is a no-op
        assert!(!save(&store).unwrap());
    }

    #[test]
    fn load_prefers_primary() {
        let store = populated("loadp");
        save(&store).unwrap();
        let expected = store.snapshot();

        let fresh = ConfigStore::with_paths(
            store.primary_path.clone(),
            store.backup_path.clone(),
        );
        assert_eq!(load(&fresh), LoadOutcome::Primary);
        assert_eq!(fresh.snapshot(), expected);
        assert!(!fresh.needs_save());
    }

    #[test]
    fn truncated_primary_recovers_from_backup() {
        let store = populated("recover");
        save(&store).unwrap();
        let expected = store.snapshot();

        // Truncate the primary file
        let bytes = fs::read(&store.primary_path).unwrap();
        fs::write(&store.primary_path, &bytes[..bytes.len() / 2]).unwrap();

        let fresh = ConfigStore::with_paths(
            store.primary_path.clone(),
            store.backup_path.clone(),
        );
        assert_eq!(load(&fresh), LoadOutcome::Backup);
        assert_eq!(fresh.snapshot(), expected);

        // The primary was rewritten from the recovered data
        let rewritten = fs::read(&store.primary_path).unwrap();
        assert_eq!(decode(&rewritten).unwrap(), expected);
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let fresh = temp_store("missing");
        assert_eq!(load(&fresh), LoadOutcome::Defaults);
        assert_eq!(fresh.snapshot(), ConfigData::default());
    }
}
