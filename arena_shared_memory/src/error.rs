//! Error types for arena operations

use arena::config::ConfigError;
use arena::consts::SegNum;
use arena::severity::Severity;
use thiserror::Error;

/// Appended to every fatal message.
pub const FATAL_HINT: &str = "; manual cleanup of leftover shared memory objects \
     (/dev/shm/<prefix>*) may be required before restarting";

/// Errors that can occur during arena operations
#[derive(Error, Debug)]
pub enum ArenaError {
    /// Segment key longer than the metadata field allows
    #[error("Segment key '{key}' is longer than {max} bytes")]
    KeyTooLong {
        /// Offending key
        key: String,
        /// Maximum key length in bytes
        max: usize,
    },

    /// No live segment carries the requested key
    #[error("No shared value with key '{key}'")]
    KeyNotFound {
        /// Requested key
        key: String,
    },

    /// Configured segment count limit reached
    #[error("Segment limit reached: {max} live segments allowed")]
    SegmentLimit {
        /// Configured maximum
        max: u64,
    },

    /// Configured byte budget exceeded
    #[error(
        "Shared size limit exceeded: {requested} bytes requested, {in_use} of {max} bytes in use"
    )]
    SizeLimit {
        /// Payload bytes of the rejected segment
        requested: u64,
        /// Bytes already shared
        in_use: u64,
        /// Configured maximum
        max: u64,
    },

    /// Every segment number is in use
    #[error("No free segment number available")]
    NumberSpaceExhausted,

    /// Client value cannot be represented
    #[error("Invalid value: {reason}")]
    InvalidValue {
        /// What is wrong with it
        reason: String,
    },

    /// A value is borrowed while the arena needs exclusive access to it
    #[error("Value of segment {seg_num} is borrowed across an arena call")]
    ValueBorrowed {
        /// Segment backing the value
        seg_num: SegNum,
    },

    /// Configuration could not be loaded, validated or stored
    #[error("Configuration error: {source}")]
    Config {
        /// Source configuration error
        #[from]
        source: ConfigError,
    },

    /// Segment already has a variable attached in this process
    #[error("Segment {seg_num} already has a variable attached")]
    AlreadyTracked {
        /// Segment number
        seg_num: SegNum,
    },

    /// Segment expected in the local cache is missing
    #[error("Segment {seg_num} is not tracked by this process")]
    NotTracked {
        /// Segment number
        seg_num: SegNum,
    },

    /// Destination buffer or shape does not match the value
    #[error("Layout mismatch: {detail}")]
    LayoutMismatch {
        /// Description of the mismatch
        detail: String,
    },

    /// A linked segment has no backing object
    #[error("Segment object {name} is missing")]
    SegmentMissing {
        /// Object name
        name: String,
    },

    /// Shared-memory content failed a self-consistency check
    #[error("Shared memory corrupted: {detail}{hint}", hint = FATAL_HINT)]
    Corruption {
        /// What failed the check
        detail: String,
    },

    /// Serialized node carries an unknown class tag
    #[error("Unknown class tag {tag} in serialized value{hint}", hint = FATAL_HINT)]
    UnknownClass {
        /// Raw tag found in the buffer
        tag: u16,
    },

    /// A process died while holding the domain lock
    #[error("Domain lock abandoned by process {pid}{hint}", hint = FATAL_HINT)]
    LockAbandoned {
        /// Process that held the lock
        pid: u32,
    },

    /// A protocol spin exceeded the configured timeout
    #[error("Timed out after {waited_ms} ms waiting for {what}{hint}", hint = FATAL_HINT)]
    SpinTimeout {
        /// Condition being waited for
        what: &'static str,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// A previous fatal error poisoned this handle or the whole domain
    #[error("Arena unusable after an earlier fatal error (domain wide: {domain_wide}){hint}", hint = FATAL_HINT)]
    Poisoned {
        /// Set when the poison comes from the shared directory
        domain_wide: bool,
    },

    /// OS call failed
    #[error("{op} failed for {name}: {source}")]
    System {
        /// Operation name
        op: &'static str,
        /// Object the operation targeted
        name: String,
        /// Source nix error
        #[source]
        source: nix::Error,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },
}

impl ArenaError {
    /// Severity class of this error.
    pub fn severity(&self) -> Severity {
        match self {
            Self::KeyTooLong { .. }
            | Self::KeyNotFound { .. }
            | Self::SegmentLimit { .. }
            | Self::SizeLimit { .. }
            | Self::NumberSpaceExhausted
            | Self::InvalidValue { .. }
            | Self::ValueBorrowed { .. }
            | Self::Config { .. } => Severity::USER,
            Self::AlreadyTracked { .. } | Self::NotTracked { .. } | Self::LayoutMismatch { .. } => {
                Severity::INTERNAL
            }
            Self::SegmentMissing { .. } | Self::System { .. } | Self::Io { .. } => Severity::SYSTEM,
            Self::Corruption { .. } | Self::UnknownClass { .. } => {
                Severity::CORRUPTION | Severity::FATAL
            }
            Self::LockAbandoned { .. } | Self::SpinTimeout { .. } => {
                Severity::SYSTEM | Severity::FATAL
            }
            Self::Poisoned { .. } => Severity::FATAL,
        }
    }

    /// Shorthand for [`ArenaError::Corruption`].
    pub fn corruption(detail: impl Into<String>) -> Self {
        Self::Corruption {
            detail: detail.into(),
        }
    }

    /// Shorthand for [`ArenaError::System`].
    pub fn system(op: &'static str, name: impl Into<String>, source: nix::Error) -> Self {
        Self::System {
            op,
            name: name.into(),
            source,
        }
    }
}

/// Result type for arena operations
pub type ArenaResult<T> = Result<T, ArenaError>;
