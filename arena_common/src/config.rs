//! User configuration block and its TOML persistence.
//!
//! The first process to attach to a domain loads the block from the per-user
//! config file; the last process to detach writes it back if it changed.
//!
//! # Usage
//!
//! ```rust,no_run
//! use arena_common::config::{ConfigLoader, UserConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = UserConfig::load(Path::new("config.toml"))?;
//!     println!("max segments: {}", config.max_segments);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_MAX_SEGMENTS, DEFAULT_MAX_SHARED_SIZE,
    DEFAULT_PERMISSIONS, MAX_SEG_NUM,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Writing the configuration back failed.
    #[error("Failed to write configuration: {0}")]
    WriteError(String),
}

/// What a new share does to the values already in the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShareMode {
    /// Every share appends a new segment.
    #[default]
    Copy,
    /// A share replaces everything shared before it, in place when the
    /// newest value has the same shape.
    Overwrite,
}

impl ShareMode {
    /// Raw value stored in the shared directory.
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Copy => 0,
            Self::Overwrite => 1,
        }
    }

    /// Convert from the raw directory value. Returns `None` for invalid values.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Copy),
            1 => Some(Self::Overwrite),
            _ => None,
        }
    }
}

/// Which values a plain fetch returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Only the most recently shared value.
    #[default]
    Recent,
    /// Every live value, oldest first.
    All,
}

impl FetchMode {
    /// Raw value stored in the shared directory.
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Recent => 0,
            Self::All => 1,
        }
    }

    /// Convert from the raw directory value. Returns `None` for invalid values.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Recent),
            1 => Some(Self::All),
            _ => None,
        }
    }
}

/// The user-defined configuration block of a domain.
///
/// # TOML Example
///
/// ```toml
/// max_segments = 512
/// max_shared_size = 1073741824
/// gc_enabled = true
/// thread_safety = true
/// share_mode = "copy"
/// fetch_mode = "recent"
/// permissions = 384
/// spin_timeout_ms = 0
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserConfig {
    /// Maximum number of live segments in the domain.
    pub max_segments: u64,
    /// Maximum total payload bytes across live segments.
    pub max_shared_size: u64,
    /// Collect unreferenced, non-persistent segments automatically.
    pub gc_enabled: bool,
    /// Take the cross-process lock for structural edits.
    pub thread_safety: bool,
    /// Default share policy.
    pub share_mode: ShareMode,
    /// Default fetch policy.
    pub fetch_mode: FetchMode,
    /// Permission bits for new shared-memory objects (e.g. `0o600`).
    pub permissions: u32,
    /// Upper bound for protocol spins in milliseconds. `0` waits forever.
    pub spin_timeout_ms: u64,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            max_segments: DEFAULT_MAX_SEGMENTS,
            max_shared_size: DEFAULT_MAX_SHARED_SIZE,
            gc_enabled: true,
            thread_safety: true,
            share_mode: ShareMode::Copy,
            fetch_mode: FetchMode::Recent,
            permissions: DEFAULT_PERMISSIONS,
            spin_timeout_ms: 0,
        }
    }
}

impl UserConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `max_segments` is zero or larger than the segment number space
    /// - `max_shared_size` does not fit a TOML integer
    /// - `permissions` has bits outside `0o777`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_segments == 0 || self.max_segments > MAX_SEG_NUM as u64 {
            return Err(ConfigError::ValidationError(format!(
                "max_segments must be in 1..={MAX_SEG_NUM}, got {}",
                self.max_segments
            )));
        }
        if self.max_shared_size > i64::MAX as u64 {
            return Err(ConfigError::ValidationError(
                "max_shared_size must not exceed i64::MAX".to_string(),
            ));
        }
        if self.permissions & !0o777 != 0 {
            return Err(ConfigError::ValidationError(format!(
                "permissions must be within 0o777, got {:#o}",
                self.permissions
            )));
        }
        Ok(())
    }

    /// Load from `path`, falling back to defaults when the file is missing.
    ///
    /// Parse and validation errors are still reported: a broken file is not
    /// silently replaced.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(ConfigError::FileNotFound) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn store(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string(self).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::WriteError(e.to_string()))
    }

    /// Write the configuration only if it differs from what is on disk.
    ///
    /// Returns `true` if the file was written.
    pub fn store_if_changed(&self, path: &Path) -> Result<bool, ConfigError> {
        match Self::load(path) {
            Ok(on_disk) if on_disk == *self => Ok(false),
            Ok(_) | Err(ConfigError::FileNotFound) | Err(ConfigError::ParseError(_)) => {
                tracing::debug!("Writing configuration to {}", path.display());
                self.store(path)?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

/// A partial update of [`UserConfig`]; `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// New segment count limit.
    pub max_segments: Option<u64>,
    /// New byte budget.
    pub max_shared_size: Option<u64>,
    /// Toggle garbage collection.
    pub gc_enabled: Option<bool>,
    /// Toggle the cross-process lock.
    pub thread_safety: Option<bool>,
    /// New share policy.
    pub share_mode: Option<ShareMode>,
    /// New fetch policy.
    pub fetch_mode: Option<FetchMode>,
    /// New permission bits.
    pub permissions: Option<u32>,
    /// New spin timeout.
    pub spin_timeout_ms: Option<u64>,
}

impl ConfigUpdate {
    /// Apply the update on top of `base` and validate the result.
    pub fn apply(&self, base: &UserConfig) -> Result<UserConfig, ConfigError> {
        let next = UserConfig {
            max_segments: self.max_segments.unwrap_or(base.max_segments),
            max_shared_size: self.max_shared_size.unwrap_or(base.max_shared_size),
            gc_enabled: self.gc_enabled.unwrap_or(base.gc_enabled),
            thread_safety: self.thread_safety.unwrap_or(base.thread_safety),
            share_mode: self.share_mode.unwrap_or(base.share_mode),
            fetch_mode: self.fetch_mode.unwrap_or(base.fetch_mode),
            permissions: self.permissions.unwrap_or(base.permissions),
            spin_timeout_ms: self.spin_timeout_ms.unwrap_or(base.spin_timeout_ms),
        };
        next.validate()?;
        Ok(next)
    }

    /// Set a single field from its TOML key and a textual value.
    ///
    /// Used by the operator CLI (`config set <field> <value>`).
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<(), ConfigError> {
        fn invalid(field: &str, value: &str) -> ConfigError {
            ConfigError::ValidationError(format!("invalid value '{value}' for {field}"))
        }
        fn parse<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| invalid(field, value))
        }

        match field {
            "max_segments" => self.max_segments = Some(parse(field, value)?),
            "max_shared_size" => self.max_shared_size = Some(parse(field, value)?),
            "gc_enabled" => self.gc_enabled = Some(parse(field, value)?),
            "thread_safety" => self.thread_safety = Some(parse(field, value)?),
            "share_mode" => {
                self.share_mode = Some(match value {
                    "copy" => ShareMode::Copy,
                    "overwrite" => ShareMode::Overwrite,
                    _ => return Err(invalid(field, value)),
                })
            }
            "fetch_mode" => {
                self.fetch_mode = Some(match value {
                    "recent" => FetchMode::Recent,
                    "all" => FetchMode::All,
                    _ => return Err(invalid(field, value)),
                })
            }
            "permissions" => {
                let digits = value.trim_start_matches("0o");
                self.permissions = Some(u32::from_str_radix(digits, 8).map_err(|_| {
                    ConfigError::ValidationError(format!("invalid octal permissions '{value}'"))
                })?)
            }
            "spin_timeout_ms" => self.spin_timeout_ms = Some(parse(field, value)?),
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown configuration field '{field}'"
                )));
            }
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

/// Per-user location of the persisted configuration.
///
/// `$XDG_CONFIG_HOME/shmarena/config.toml`, falling back to
/// `$HOME/.config/shmarena/config.toml`. Returns `None` when neither
/// variable is set.
pub fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        assert!(UserConfig::default().validate().is_ok());
    }

    #[test]
    fn test_mode_raw_roundtrip() {
        for mode in [ShareMode::Copy, ShareMode::Overwrite] {
            assert_eq!(ShareMode::from_raw(mode.as_raw()), Some(mode));
        }
        for mode in [FetchMode::Recent, FetchMode::All] {
            assert_eq!(FetchMode::from_raw(mode.as_raw()), Some(mode));
        }
        assert!(ShareMode::from_raw(7).is_none());
        assert!(FetchMode::from_raw(7).is_none());
    }

    #[test]
    fn test_validation_rejects_zero_segments() {
        let config = UserConfig {
            max_segments: 0,
            ..UserConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_rejects_wide_permissions() {
        let config = UserConfig {
            permissions: 0o4755,
            ..UserConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = UserConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "max_segments = 12\nshare_mode = \"overwrite\"\n").unwrap();
        file.flush().unwrap();

        let config = UserConfig::load(file.path()).unwrap();
        assert_eq!(config.max_segments, 12);
        assert_eq!(config.share_mode, ShareMode::Overwrite);
        assert!(config.gc_enabled);
        assert_eq!(config.permissions, DEFAULT_PERMISSIONS);
    }

    #[test]
    fn test_update_applies_only_set_fields() {
        let update = ConfigUpdate {
            gc_enabled: Some(false),
            ..ConfigUpdate::default()
        };
        let next = update.apply(&UserConfig::default()).unwrap();
        assert!(!next.gc_enabled);
        assert_eq!(next.max_segments, DEFAULT_MAX_SEGMENTS);
    }

    #[test]
    fn test_set_field_parses_octal_permissions() {
        let mut update = ConfigUpdate::default();
        update.set_field("permissions", "0o640").unwrap();
        assert_eq!(update.permissions, Some(0o640));
        update.set_field("permissions", "600").unwrap();
        assert_eq!(update.permissions, Some(0o600));
        assert!(update.set_field("permissions", "9").is_err());
        assert!(update.set_field("nonsense", "1").is_err());
    }
}
