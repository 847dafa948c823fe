//! System-wide constants for the arena workspace.
//!
//! Single source of truth for all numeric limits, sentinels and default
//! names, imported by every crate of the workspace.

/// Segment number type. Signed so that [`SEG_NUM_NONE`] can act as the
/// "no link" sentinel in the shared list.
pub type SegNum = i64;

/// Sentinel meaning "no such segment" in shared and local links.
pub const SEG_NUM_NONE: SegNum = -1;

/// Highest segment number handed out before numbering wraps to zero.
pub const MAX_SEG_NUM: SegNum = 0x7FFF_FFFF;

/// Maximum length in bytes of an optional segment key.
///
/// The key is stored in the fixed-size segment metadata, so this is a hard
/// layout limit (48 byte field minus one byte of slack for a terminator).
pub const MAX_KEY_LEN: usize = 47;

/// Default prefix for every shared-memory object created by the arena.
pub const DEFAULT_NAME_PREFIX: &str = "shmarena_";

/// Suffix distinguishing the info segment of 32-bit and 64-bit builds.
#[cfg(target_pointer_width = "64")]
pub const INFO_SUFFIX: &str = "info_64";

/// Suffix distinguishing the info segment of 32-bit and 64-bit builds.
#[cfg(not(target_pointer_width = "64"))]
pub const INFO_SUFFIX: &str = "info_32";

/// Default upper bound on the number of live segments.
pub const DEFAULT_MAX_SEGMENTS: u64 = 10_000;

/// Default upper bound on the total payload bytes across live segments.
///
/// Kept at `i64::MAX` so the value survives a TOML round-trip.
pub const DEFAULT_MAX_SHARED_SIZE: u64 = i64::MAX as u64;

/// Default permission bits for newly created shared-memory objects.
pub const DEFAULT_PERMISSIONS: u32 = 0o600;

/// Directory (below the user config dir) holding the persisted settings.
pub const CONFIG_DIR_NAME: &str = "shmarena";

/// File name of the persisted settings.
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(SEG_NUM_NONE < 0);
        assert!(MAX_SEG_NUM > 0);
        assert!(DEFAULT_MAX_SEGMENTS <= MAX_SEG_NUM as u64);
        assert!(DEFAULT_MAX_SHARED_SIZE <= i64::MAX as u64);
        assert_eq!(DEFAULT_PERMISSIONS & !0o777, 0);
    }

    #[test]
    fn info_suffix_matches_pointer_width() {
        let bits = (std::mem::size_of::<usize>() * 8).to_string();
        assert!(INFO_SUFFIX.ends_with(&bits));
    }
}
