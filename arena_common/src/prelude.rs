//! Prelude module for common re-exports.
//!
//! ```rust
//! use arena_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, ConfigUpdate, FetchMode, ShareMode, UserConfig};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::{DEFAULT_NAME_PREFIX, MAX_KEY_LEN, MAX_SEG_NUM, SEG_NUM_NONE, SegNum};

// ─── Naming ─────────────────────────────────────────────────────────
pub use crate::names::{info_object_name, segment_object_name};

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::severity::Severity;
