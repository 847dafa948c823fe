//! Error severity bitmask.
//!
//! Severities combine: an abandoned lock is `SYSTEM | FATAL`, a bad field
//! name table is `CORRUPTION | FATAL`.

use bitflags::bitflags;

bitflags! {
    /// Severity classes of arena errors.
    ///
    /// FATAL errors are sticky: every later operation on the same handle
    /// (and, for shared corruption, in the same domain) fails immediately.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Severity: u8 {
        /// Caller supplied invalid input or exceeded a configured limit.
        const USER       = 0x01;
        /// An invariant the implementation should guarantee was violated.
        const INTERNAL   = 0x02;
        /// An OS call failed.
        const SYSTEM     = 0x04;
        /// Shared-memory content failed a self-consistency check.
        const CORRUPTION = 0x08;
        /// Sticky: refuse all further operations.
        const FATAL      = 0x10;
    }
}

impl Severity {
    /// Returns true if this severity must poison the handle.
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        self.contains(Self::FATAL)
    }

    /// Returns true if every process in the domain must be poisoned, not
    /// just the one that observed the error.
    #[inline]
    pub const fn is_domain_wide(&self) -> bool {
        self.contains(Self::FATAL) && self.contains(Self::CORRUPTION)
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_combines_with_any_class() {
        let s = Severity::SYSTEM | Severity::FATAL;
        assert!(s.is_fatal());
        assert!(!s.is_domain_wide());
        assert!((Severity::CORRUPTION | Severity::FATAL).is_domain_wide());
        assert!(!Severity::USER.is_fatal());
    }
}
