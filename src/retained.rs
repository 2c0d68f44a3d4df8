//! Checksummed battery-backed RAM for the level vector and switch positions.
//!
//! Two fixed-size regions live in memory that survives a warm reboot but not
//! a cold boot (`.rtc_noinit` on ESP32). Each region ends in a CRC-32 of its
//! payload XORed with a region-specific magic constant, so stale or
//! corrupted contents are never loaded.
//!
//! On boot:
//! - a power-on reset discards both regions ([`BootStatus::PowerOnIgnored`])
//! - a checksum mismatch falls back to defaults
//!   ([`BootStatus::ChecksumMismatch`])
//! - otherwise the saved contents are restored ([`BootStatus::LoadedOk`])
//!
//! The [`BootStatus`] per region is kept for the status report.

use crate::traits::{RetainedMemory, RetainedRegion};

/// Level region: 64 level bytes (sixteen 32-bit words) + CRC word.
pub const LEVELS_REGION_LEN: usize = 64 + 4;

/// Switch region: packed positions byte, known-mask byte, 2 pad bytes + CRC.
pub const SWITCHES_REGION_LEN: usize = 4 + 4;

const LEVELS_MAGIC: u32 = 0x0D13_25AB;
const SWITCHES_MAGIC: u32 = 0x51C7_E6B2;

/// Outcome of restoring a retained region at boot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootStatus {
    /// No load has been attempted, or the region was unavailable.
    #[default]
    Unknown,
    /// Cold boot: the saved contents were deliberately discarded.
    PowerOnIgnored,
    /// The checksum did not match; defaults were used.
    ChecksumMismatch,
    /// The saved contents were restored.
    LoadedOk,
}

impl BootStatus {
    /// Stable text form for the status report.
    pub const fn as_str(self) -> &'static str {
        match self {
            BootStatus::Unknown => "unknown",
            BootStatus::PowerOnIgnored => "power-on-ignored",
            BootStatus::ChecksumMismatch => "checksum-mismatch",
            BootStatus::LoadedOk => "loaded-ok",
        }
    }
}

/// CRC-32 (reflected, polynomial 0xEDB88320), bitwise implementation.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in bytes {
        crc ^= b as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

fn checksum(payload: &[u8], magic: u32) -> u32 {
    crc32(payload) ^ magic
}

// ============================================================================
// Level vector
// ============================================================================

/// Write the 64-byte level vector with its checksum.
pub fn save_levels(mem: &mut dyn RetainedMemory, levels: &[u8; 64]) {
    let mut buf = [0u8; LEVELS_REGION_LEN];
    buf[..64].copy_from_slice(levels);
    let crc = checksum(levels, LEVELS_MAGIC);
    buf[64..].copy_from_slice(&crc.to_le_bytes());
    mem.store(RetainedRegion::Levels, &buf);
}

/// Restore the level vector, reporting how the restore went.
pub fn load_levels(mem: &mut dyn RetainedMemory) -> (Option<[u8; 64]>, BootStatus) {
    if mem.power_on_reset() {
        return (None, BootStatus::PowerOnIgnored);
    }

    let mut buf = [0u8; LEVELS_REGION_LEN];
    if !mem.load(RetainedRegion::Levels, &mut buf) {
        return (None, BootStatus::Unknown);
    }

    let stored = u32::from_le_bytes([buf[64], buf[65], buf[66], buf[67]]);
    if stored != checksum(&buf[..64], LEVELS_MAGIC) {
        return (None, BootStatus::ChecksumMismatch);
    }

    let mut levels = [0u8; 64];
    levels.copy_from_slice(&buf[..64]);
    (Some(levels), BootStatus::LoadedOk)
}

// ============================================================================
// Switch positions
// ============================================================================

/// Debounced switch positions: packed values and a known mask, one bit per
/// switch index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchPositions {
    /// Bit `i` set = switch `i` logically on.
    pub values: u8,
    /// Bit `i` set = switch `i` has a known stable value.
    pub known: u8,
}

/// Write the switch positions with their checksum.
pub fn save_switches(mem: &mut dyn RetainedMemory, positions: SwitchPositions) {
    let mut buf = [0u8; SWITCHES_REGION_LEN];
    buf[0] = positions.values;
    buf[1] = positions.known;
    let crc = checksum(&buf[..4], SWITCHES_MAGIC);
    buf[4..].copy_from_slice(&crc.to_le_bytes());
    mem.store(RetainedRegion::Switches, &buf);
}

/// Restore the switch positions, reporting how the restore went.
pub fn load_switches(mem: &mut dyn RetainedMemory) -> (Option<SwitchPositions>, BootStatus) {
    if mem.power_on_reset() {
        return (None, BootStatus::PowerOnIgnored);
    }

    let mut buf = [0u8; SWITCHES_REGION_LEN];
    if !mem.load(RetainedRegion::Switches, &mut buf) {
        return (None, BootStatus::Unknown);
    }

    let stored = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if stored != checksum(&buf[..4], SWITCHES_MAGIC) {
        return (None, BootStatus::ChecksumMismatch);
    }

    (
        Some(SwitchPositions {
            values: buf[0],
            known: buf[1],
        }),
        BootStatus::LoadedOk,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockRetained;

    #[test]
    fn crc32_known_vector() {
        // CRC-32 of "123456789" is the classic check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn levels_round_trip() {
        let mut mem = MockRetained::new();
        let mut levels = [0xFFu8; 64];
        levels[0] = 200;
        levels[5] = 17;

        save_levels(&mut mem, &levels);
        let (loaded, status) = load_levels(&mut mem);

        assert_eq!(status, BootStatus::LoadedOk);
        assert_eq!(loaded, Some(levels));
    }

    #[test]
    fn levels_bit_flip_detected() {
        let mut mem = MockRetained::new();
        let levels = [42u8; 64];
        save_levels(&mut mem, &levels);

        // Flip one bit anywhere in the saved region
        for byte in [0usize, 31, 63, 64, 67] {
            let mut corrupted = mem.clone();
            corrupted.flip_bit(RetainedRegion::Levels, byte, 3);
            let (loaded, status) = load_levels(&mut corrupted);
            assert_eq!(status, BootStatus::ChecksumMismatch, "byte {}", byte);
            assert_eq!(loaded, None);
        }
    }

    #[test]
    fn levels_power_on_ignored() {
        let mut mem = MockRetained::new();
        save_levels(&mut mem, &[1u8; 64]);
        mem.power_on = true;

        let (loaded, status) = load_levels(&mut mem);
        assert_eq!(status, BootStatus::PowerOnIgnored);
        assert_eq!(loaded, None);
    }

    #[test]
    fn levels_uninitialised_is_mismatch() {
        let mut mem = MockRetained::new();
        let (loaded, status) = load_levels(&mut mem);
        assert_eq!(status, BootStatus::ChecksumMismatch);
        assert_eq!(loaded, None);
    }

    #[test]
    fn switches_round_trip() {
        let mut mem = MockRetained::new();
        let positions = SwitchPositions {
            values: 0b01,
            known: 0b11,
        };
        save_switches(&mut mem, positions);

        let (loaded, status) = load_switches(&mut mem);
        assert_eq!(status, BootStatus::LoadedOk);
        assert_eq!(loaded, Some(positions));
    }

    #[test]
    fn switches_corruption_detected() {
        let mut mem = MockRetained::new();
        save_switches(&mut mem, SwitchPositions::default());
        mem.flip_bit(RetainedRegion::Switches, 0, 0);

        let (loaded, status) = load_switches(&mut mem);
        assert_eq!(status, BootStatus::ChecksumMismatch);
        assert_eq!(loaded, None);
    }

    #[test]
    fn regions_are_independent() {
        let mut mem = MockRetained::new();
        save_levels(&mut mem, &[9u8; 64]);
        save_switches(&mut mem, SwitchPositions { values: 1, known: 1 });
        mem.flip_bit(RetainedRegion::Switches, 1, 1);

        assert_eq!(load_levels(&mut mem).1, BootStatus::LoadedOk);
        assert_eq!(load_switches(&mut mem).1, BootStatus::ChecksumMismatch);
    }

    #[test]
    fn status_text() {
        assert_eq!(BootStatus::LoadedOk.as_str(), "loaded-ok");
        assert_eq!(BootStatus::PowerOnIgnored.as_str(), "power-on-ignored");
        assert_eq!(BootStatus::ChecksumMismatch.as_str(), "checksum-mismatch");
        assert_eq!(BootStatus::Unknown.as_str(), "unknown");
    }
}
