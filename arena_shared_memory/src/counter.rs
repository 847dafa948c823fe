//! Packed lock-free counter used by every cross-process protocol.
//!
//! One `u64` word holds three fields:
//!
//! ```text
//!  63     62     61                                 0
//! ┌──────┬──────┬───────────────────────────────────┐
//! │ post │ flag │              count                │
//! └──────┴──────┴───────────────────────────────────┘
//! ```
//!
//! Every mutation is a compare-and-swap retry loop over the whole word, so
//! the three fields always change together.

use crate::error::{ArenaError, ArenaResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bits 0..=61.
pub const COUNT_MASK: u64 = (1 << 62) - 1;
/// Bit 62.
pub const FLAG_BIT: u64 = 1 << 62;
/// Bit 63.
pub const POST_BIT: u64 = 1 << 63;

/// Decoded value of an [`AtomicCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot(u64);

impl CounterSnapshot {
    /// Pack the three fields into one word.
    pub const fn new(count: u64, flag: bool, post: bool) -> Self {
        let mut raw = count & COUNT_MASK;
        if flag {
            raw |= FLAG_BIT;
        }
        if post {
            raw |= POST_BIT;
        }
        Self(raw)
    }

    /// Wrap a raw word.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw word.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Count field.
    pub const fn count(self) -> u64 {
        self.0 & COUNT_MASK
    }

    /// Flag bit.
    pub const fn flag(self) -> bool {
        self.0 & FLAG_BIT != 0
    }

    /// Post bit.
    pub const fn post(self) -> bool {
        self.0 & POST_BIT != 0
    }

    /// Same flags, different count.
    pub const fn with_count(self, count: u64) -> Self {
        Self::new(count, self.flag(), self.post())
    }

    /// Same count and post, different flag.
    pub const fn with_flag(self, flag: bool) -> Self {
        Self::new(self.count(), flag, self.post())
    }

    /// Same count and flag, different post.
    pub const fn with_post(self, post: bool) -> Self {
        Self::new(self.count(), self.flag(), post)
    }
}

/// Packed `(count, flag, post)` word living in shared memory.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create a counter with the given fields.
    pub const fn new(count: u64, flag: bool, post: bool) -> Self {
        Self(AtomicU64::new(CounterSnapshot::new(count, flag, post).raw()))
    }

    /// Current value.
    #[inline]
    pub fn load(&self) -> CounterSnapshot {
        CounterSnapshot(self.0.load(Ordering::Acquire))
    }

    /// Overwrite all fields. Only for initialization of fresh memory.
    pub fn store(&self, value: CounterSnapshot) {
        self.0.store(value.raw(), Ordering::Release);
    }

    /// CAS loop applying `f` until it sticks. Returns `(old, new)`.
    pub fn update<F>(&self, mut f: F) -> (CounterSnapshot, CounterSnapshot)
    where
        F: FnMut(CounterSnapshot) -> CounterSnapshot,
    {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(CounterSnapshot(current)).raw();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return (CounterSnapshot(current), CounterSnapshot(next)),
                Err(actual) => current = actual,
            }
        }
    }

    /// `count += 1`. Returns the resulting value.
    pub fn increment(&self) -> CounterSnapshot {
        self.update(|s| s.with_count((s.count() + 1).min(COUNT_MASK))).1
    }

    /// `count -= 1`, saturating at zero. With `set_flag_on_zero`, reaching
    /// zero also sets the flag.
    ///
    /// Returns `true` only for the caller whose decrement moved the flag from
    /// false to true; that caller owns the follow-up action.
    pub fn decrement(&self, set_flag_on_zero: bool) -> bool {
        let (old, new) = self.update(|s| {
            let count = s.count().saturating_sub(1);
            let next = s.with_count(count);
            if set_flag_on_zero && count == 0 {
                next.with_flag(true)
            } else {
                next
            }
        });
        !old.flag() && new.flag()
    }

    /// Set the flag if `count == 0` and it is still clear. Returns `true`
    /// only for the caller that set it.
    pub fn claim_if_unused(&self) -> bool {
        let (old, new) = self.update(|s| {
            if s.count() == 0 && !s.flag() {
                s.with_flag(true)
            } else {
                s
            }
        });
        !old.flag() && new.flag()
    }

    /// `count -= 1`, saturating at zero, flags untouched. Returns the new value.
    pub fn release(&self) -> CounterSnapshot {
        self.update(|s| s.with_count(s.count().saturating_sub(1))).1
    }

    /// Set the flag bit.
    pub fn set_flag(&self, value: bool) {
        self.update(|s| s.with_flag(value));
    }

    /// Set the post bit.
    pub fn set_post(&self, value: bool) {
        self.update(|s| s.with_post(value));
    }

    /// `count += 1`, but only while `post` is set; spins otherwise.
    pub fn increment_when_posted(&self, spin: &mut SpinWait) -> ArenaResult<CounterSnapshot> {
        loop {
            let current = self.load();
            if !current.post() {
                spin.spin()?;
                continue;
            }
            let next = current.with_count((current.count() + 1).min(COUNT_MASK));
            if self
                .0
                .compare_exchange_weak(
                    current.raw(),
                    next.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(next);
            }
        }
    }

    /// Clear `post`, wait until `count == 0`, then set `flag = value` and
    /// `post = true` in one step.
    ///
    /// Used to toggle a policy bit only while nobody is inside the section
    /// the bit guards.
    pub fn wait_then_set_flag(&self, value: bool, spin: &mut SpinWait) -> ArenaResult<()> {
        self.set_post(false);
        loop {
            let current = self.load();
            if current.count() != 0 {
                if let Err(e) = spin.spin() {
                    self.set_post(true);
                    return Err(e);
                }
                continue;
            }
            let next = CounterSnapshot::new(0, value, true);
            if self
                .0
                .compare_exchange_weak(
                    current.raw(),
                    next.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

/// Add `delta` unless the result would exceed `max`.
pub fn bounded_add(atomic: &AtomicU64, delta: u64, max: u64) -> bool {
    atomic
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            current.checked_add(delta).filter(|next| *next <= max)
        })
        .is_ok()
}

/// Subtract `delta`, saturating at zero.
pub fn saturating_sub(atomic: &AtomicU64, delta: u64) {
    let _ = atomic.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(delta))
    });
}

/// Bump a revision counter, skipping the reserved zero value.
pub fn next_revision(rev: &AtomicU64) -> u64 {
    let mut current = rev.load(Ordering::Acquire);
    loop {
        let next = match current.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        match rev.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}

/// Busy-wait helper for the protocol spins.
///
/// Spins on the CPU for a short while, then yields to the scheduler. With a
/// timeout, overrunning it is a fatal [`ArenaError::SpinTimeout`]: the only
/// way a spin does not finish is a peer process dying mid-protocol.
#[derive(Debug)]
pub struct SpinWait {
    what: &'static str,
    started: Instant,
    timeout: Option<Duration>,
    iterations: u32,
}

impl SpinWait {
    const SPIN_LIMIT: u32 = 64;

    /// Start waiting for `what`. `None` waits forever.
    pub fn new(what: &'static str, timeout: Option<Duration>) -> Self {
        Self {
            what,
            started: Instant::now(),
            timeout,
            iterations: 0,
        }
    }

    /// Convert a millisecond setting (0 = unbounded) into a timeout.
    pub fn timeout_from_ms(ms: u64) -> Option<Duration> {
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    /// One wait step.
    pub fn spin(&mut self) -> ArenaResult<()> {
        self.iterations = self.iterations.saturating_add(1);
        if self.iterations < Self::SPIN_LIMIT {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }

        if let Some(timeout) = self.timeout {
            let waited = self.started.elapsed();
            if waited >= timeout {
                return Err(ArenaError::SpinTimeout {
                    what: self.what,
                    waited_ms: waited.as_millis() as u64,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_layout() {
        assert_eq!(CounterSnapshot::new(5, false, false).raw(), 5);
        assert_eq!(CounterSnapshot::new(0, true, false).raw(), 1 << 62);
        assert_eq!(CounterSnapshot::new(0, false, true).raw(), 1 << 63);
        assert_eq!(
            CounterSnapshot::new(COUNT_MASK + 7, true, true).raw(),
            u64::MAX
        );

        let s = CounterSnapshot::from_raw((1 << 63) | 3);
        assert_eq!(s.count(), 3);
        assert!(!s.flag());
        assert!(s.post());
    }

    #[test]
    fn test_decrement_saturates_and_reports_flag_transition() {
        let c = AtomicCounter::new(2, false, false);
        assert!(!c.decrement(true));
        assert_eq!(c.load().count(), 1);

        assert!(c.decrement(true));
        assert_eq!(c.load().count(), 0);
        assert!(c.load().flag());

        // Flag already set: nobody else becomes responsible.
        assert!(!c.decrement(true));
        assert_eq!(c.load().count(), 0);
    }

    #[test]
    fn test_claim_if_unused_only_once_and_only_at_zero() {
        let c = AtomicCounter::new(1, false, false);
        assert!(!c.claim_if_unused());
        assert!(!c.decrement(false));
        assert!(c.claim_if_unused());
        assert!(c.load().flag());
        assert!(!c.claim_if_unused());
    }

    #[test]
    fn test_decrement_without_flag_request() {
        let c = AtomicCounter::new(1, false, true);
        assert!(!c.decrement(false));
        let s = c.load();
        assert_eq!(s.count(), 0);
        assert!(!s.flag());
        assert!(s.post());
    }

    #[test]
    fn test_increment_keeps_flags() {
        let c = AtomicCounter::new(0, true, true);
        let s = c.increment();
        assert_eq!(s, CounterSnapshot::new(1, true, true));
        c.set_post(false);
        c.set_flag(false);
        assert_eq!(c.load(), CounterSnapshot::new(1, false, false));
    }

    #[test]
    fn test_wait_then_set_flag_when_idle() {
        let c = AtomicCounter::new(0, false, true);
        let mut spin = SpinWait::new("idle", None);
        c.wait_then_set_flag(true, &mut spin).unwrap();
        assert_eq!(c.load(), CounterSnapshot::new(0, true, true));
    }

    #[test]
    fn test_wait_then_set_flag_times_out_while_busy() {
        let c = AtomicCounter::new(1, false, true);
        let mut spin = SpinWait::new("busy", Some(Duration::from_millis(5)));
        let err = c.wait_then_set_flag(true, &mut spin).unwrap_err();
        assert!(matches!(err, ArenaError::SpinTimeout { what: "busy", .. }));
        // Post restored so other processes are not blocked forever.
        assert!(c.load().post());
        assert!(!c.load().flag());
    }

    #[test]
    fn test_wait_then_set_flag_across_threads() {
        let c = std::sync::Arc::new(AtomicCounter::new(1, false, true));
        let worker = {
            let c = c.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                c.release();
            })
        };
        let mut spin = SpinWait::new("section", Some(Duration::from_secs(5)));
        c.wait_then_set_flag(true, &mut spin).unwrap();
        worker.join().unwrap();
        assert_eq!(c.load(), CounterSnapshot::new(0, true, true));
    }

    #[test]
    fn test_bounded_add() {
        let a = AtomicU64::new(90);
        assert!(bounded_add(&a, 10, 100));
        assert!(!bounded_add(&a, 1, 100));
        assert_eq!(a.load(Ordering::Relaxed), 100);
        assert!(!bounded_add(&a, u64::MAX, u64::MAX));
        saturating_sub(&a, 150);
        assert_eq!(a.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_next_revision_skips_zero() {
        let rev = AtomicU64::new(u64::MAX - 1);
        assert_eq!(next_revision(&rev), u64::MAX);
        assert_eq!(next_revision(&rev), 1);
        assert_eq!(next_revision(&rev), 2);
    }
}
