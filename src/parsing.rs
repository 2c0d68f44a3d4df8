//! Light-spec grammar, hex codecs and number parsing.
//!
//! Address sets are passed around as a `u64` bitset (bit `a` = address `a`,
//! addresses 0..=63). The external text forms are:
//!
//! - **Address sets**: concatenated uppercase hex pairs (`"000102"` =
//!   addresses 0, 1, 2), `"(null)"` when empty
//! - **Level vectors**: 128 hex digits, one pair per address, `FF` meaning
//!   "no change"
//! - **Light specs**: comma-separated items, each `all`, `idle`, a group
//!   name, a decimal address or a `N-M` range. `idle` is a modifier; items
//!   that fail to parse are skipped without aborting the rest.
//!
//! # Example
//!
//! ```rust
//! use luxbus::parsing::{parse_light_spec, parse_long};
//!
//! let spec = parse_light_spec("1,3-5,idle,bogus", |_| None);
//! assert_eq!(spec.mask, 0b111010);
//! assert!(spec.idle_only);
//!
//! assert_eq!(parse_long("+42"), Some(42));
//! assert_eq!(parse_long("42x"), None);
//! ```

use crate::codec::MAX_ADDR;

/// Bit for address `a` in an address-set bitset.
#[inline]
pub const fn addr_bit(a: u8) -> u64 {
    1u64 << (a & MAX_ADDR)
}

/// All 64 addresses.
pub const ALL_ADDRS: u64 = u64::MAX;

// ============================================================================
// Number parsing
// ============================================================================

/// Parse a decimal integer, accepting one leading `+` or `-`.
///
/// The whole string must be consumed; surrounding whitespace is an error,
/// matching the strict broker payload format.
pub fn parse_long(text: &str) -> Option<i64> {
    if text.is_empty() {
        return None;
    }
    let stripped = text.strip_prefix('+').unwrap_or(text);
    stripped.parse::<i64>().ok()
}

// ============================================================================
// Hex pair codecs
// ============================================================================

fn hex_nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'A'..=b'F' => c - b'A' + 10,
        b'a'..=b'f' => c - b'a' + 10,
        _ => 0,
    }
}

/// Parse concatenated hex pairs into an address bitset.
///
/// Pairs above [`MAX_ADDR`] and a trailing odd digit are ignored.
pub fn parse_addresses(text: &str) -> u64 {
    let mut mask = 0u64;
    let bytes = text.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let value = (hex_nibble(pair[0]) << 4) | hex_nibble(pair[1]);
        if value <= MAX_ADDR {
            mask |= addr_bit(value);
        }
    }
    mask
}

/// Format an address bitset as concatenated hex pairs, `"(null)"` if empty.
pub fn addresses_text(mask: u64) -> String {
    let mut out = String::with_capacity(2 * (MAX_ADDR as usize + 1));
    for a in 0..=MAX_ADDR {
        if mask & addr_bit(a) != 0 {
            out.push_str(&format!("{:02X}", a));
        }
    }
    if out.is_empty() {
        "(null)".to_string()
    } else {
        out
    }
}

/// Parse a 128-hex-digit level vector; `FF` maps to the no-change sentinel
/// (`None`). Short input leaves the remaining addresses unset.
pub fn parse_levels_hex(text: &str) -> [Option<u8>; 64] {
    let mut levels = [None; 64];
    let bytes = text.as_bytes();
    for (i, pair) in bytes.chunks_exact(2).take(64).enumerate() {
        let value = (hex_nibble(pair[0]) << 4) | hex_nibble(pair[1]);
        levels[i] = if value == 0xFF { None } else { Some(value) };
    }
    levels
}

/// Format a level vector as hex pairs, optionally filtered to `present`.
///
/// Unset entries render as `FF`. Returns `"(null)"` when the filter leaves
/// nothing.
pub fn levels_text(levels: &[Option<u8>; 64], present: Option<u64>) -> String {
    let mut out = String::with_capacity(128);
    for (a, level) in levels.iter().enumerate() {
        if let Some(mask) = present {
            if mask & addr_bit(a as u8) == 0 {
                continue;
            }
        }
        out.push_str(&format!("{:02X}", level.unwrap_or(0xFF)));
    }
    if out.is_empty() {
        "(null)".to_string()
    } else {
        out
    }
}

// ============================================================================
// Light specs
// ============================================================================

/// A parsed light spec: the addressed set and the `idle` modifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LightSpec {
    /// Addresses the spec names (before intersecting with present).
    pub mask: u64,
    /// True if the spec contained the `idle` modifier: act only when the
    /// system has been idle.
    pub idle_only: bool,
}

/// Parse a light spec.
///
/// `group_lookup` resolves a group name to its membership bitset; unknown
/// names, malformed numbers and inverted ranges are skipped while the other
/// items still apply.
pub fn parse_light_spec(text: &str, group_lookup: impl Fn(&str) -> Option<u64>) -> LightSpec {
    let mut spec = LightSpec::default();

    for item in text.split(',') {
        if item == "all" {
            spec.mask = ALL_ADDRS;
        } else if item == "idle" {
            spec.idle_only = true;
        } else if let Some(members) = group_lookup(item) {
            spec.mask |= members;
        } else if let Some((begin, end)) = parse_range(item) {
            for a in begin..=end {
                spec.mask |= addr_bit(a);
            }
        }
    }

    spec
}

fn parse_range(item: &str) -> Option<(u8, u8)> {
    let (begin, end) = match item.split_once('-') {
        Some((first, second)) => {
            let begin = parse_decimal_addr(first)?;
            let end = parse_decimal_addr(second)?;
            (begin, end)
        }
        None => {
            let single = parse_decimal_addr(item)?;
            (single, single)
        }
    };

    if begin > end {
        return None;
    }
    Some((begin, end))
}

fn parse_decimal_addr(text: &str) -> Option<u8> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = text.parse().ok()?;
    if value > MAX_ADDR as u64 {
        return None;
    }
    Some(value as u8)
}

/// Human-readable phrasing for a set of addressed lights.
///
/// Only present addresses count: `"Light 5"`, `"Lights 1,2"`, or `"All"`
/// when every present address is covered. Empty selections render as
/// `"(no lights)"`.
pub fn lights_text(mask: u64, present: u64) -> String {
    let selected = mask & present;
    if selected == present && present != 0 {
        return "All".to_string();
    }

    let mut list = String::new();
    let mut found = 0u32;
    for a in 0..=MAX_ADDR {
        if selected & addr_bit(a) != 0 {
            if !list.is_empty() {
                list.push(',');
            }
            list.push_str(&a.to_string());
            found += 1;
        }
    }

    match found {
        0 => "(no lights)".to_string(),
        1 => format!("Light {}", list),
        _ => format!("Lights {}", list),
    }
}
