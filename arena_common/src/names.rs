//! Deterministic shared-memory object names.
//!
//! Any process can compute the name of a segment it only knows the number
//! of, so no lookup service is needed.

use crate::consts::{INFO_SUFFIX, SegNum};

/// Name of the POSIX shared-memory object backing segment `seg_num`.
///
/// Format: `/{prefix}{seg_num:08x}`.
pub fn segment_object_name(prefix: &str, seg_num: SegNum) -> String {
    format!("/{prefix}{seg_num:08x}")
}

/// Name of the info segment holding the shared directory of a domain.
pub fn info_object_name(prefix: &str) -> String {
    format!("/{prefix}{INFO_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names_are_zero_padded_hex() {
        assert_eq!(segment_object_name("shmarena_", 0), "/shmarena_00000000");
        assert_eq!(segment_object_name("shmarena_", 255), "/shmarena_000000ff");
        assert_eq!(segment_object_name("p_", 0x7FFF_FFFF), "/p_7fffffff");
    }

    #[test]
    fn info_name_never_collides_with_segment_names() {
        let info = info_object_name("shmarena_");
        assert!(info.starts_with("/shmarena_info_"));
        // Segment names are pure hex after the prefix; "info" is not.
        assert_ne!(info, segment_object_name("shmarena_", 0));
    }
}
