//! Reentrant cross-process lock guarding structural edits of the shared list.
//!
//! The lock state lives in the directory: an [`AtomicCounter`] whose count
//! is the number of processes inside (or entering) the critical section,
//! whose flag says whether thread safety is enabled, and whose post bit is
//! cleared while that flag is being toggled. Only with the flag set does an
//! acquire reach the OS (`flock` on the info object); otherwise it is a pair
//! of atomic operations.

use crate::counter::{AtomicCounter, SpinWait};
use crate::error::{ArenaError, ArenaResult};
use crate::platform;
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{error, warn};

/// Shared part of the lock, embedded in the directory header.
#[derive(Debug)]
#[repr(C)]
pub struct LockState {
    /// Processes inside the section; flag = thread safety, post = not toggling.
    pub counter: AtomicCounter,
    /// Pid of the current holder while the OS lock is held, else 0.
    pub owner_pid: AtomicU32,
    _reserved: u32,
}

impl LockState {
    /// Fresh state with no holder.
    pub const fn new(thread_safety: bool) -> Self {
        Self {
            counter: AtomicCounter::new(0, thread_safety, true),
            owner_pid: AtomicU32::new(0),
            _reserved: 0,
        }
    }

    /// Whether acquiring takes the OS lock.
    pub fn thread_safety(&self) -> bool {
        self.counter.load().flag()
    }
}

/// Process-local side of the lock.
#[derive(Debug)]
pub struct ProcessMutex {
    fd: RawFd,
    pid: u32,
    lock_level: Cell<u32>,
    os_locked: Cell<bool>,
}

impl ProcessMutex {
    /// Lock on the descriptor `fd` (the info object).
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            pid: platform::get_current_pid(),
            lock_level: Cell::new(0),
            os_locked: Cell::new(false),
        }
    }

    /// Current nesting depth.
    pub fn lock_level(&self) -> u32 {
        self.lock_level.get()
    }

    /// Acquire the lock. Nested acquires only bump the level.
    ///
    /// # Errors
    ///
    /// - [`ArenaError::LockAbandoned`] if the previous holder died inside
    ///   the section
    /// - [`ArenaError::SpinTimeout`] if a safety toggle never finishes
    pub fn lock<'a>(
        &'a self,
        state: &'a LockState,
        spin_timeout: Option<Duration>,
    ) -> ArenaResult<ProcessMutexGuard<'a>> {
        let level = self.lock_level.get();
        if level > 0 {
            self.lock_level.set(level + 1);
            return Ok(ProcessMutexGuard { mutex: self, state });
        }

        let mut spin = SpinWait::new("thread safety toggle", spin_timeout);
        let entered = state.counter.increment_when_posted(&mut spin)?;

        if entered.flag() {
            if let Err(e) = platform::lock_exclusive(self.fd) {
                state.counter.release();
                return Err(e);
            }
            let previous = state.owner_pid.swap(self.pid, Ordering::AcqRel);
            if previous != 0 {
                // The OS dropped a dead holder's lock; the section it left
                // behind cannot be trusted.
                state.owner_pid.store(previous, Ordering::Release);
                if let Err(e) = platform::unlock(self.fd) {
                    warn!("Failed to release abandoned lock: {}", e);
                }
                state.counter.release();
                return Err(ArenaError::LockAbandoned { pid: previous });
            }
            self.os_locked.set(true);
        }

        self.lock_level.set(1);
        Ok(ProcessMutexGuard { mutex: self, state })
    }

    fn unlock(&self, state: &LockState) -> ArenaResult<()> {
        let level = self.lock_level.get();
        if level == 0 {
            return Ok(());
        }
        self.lock_level.set(level - 1);
        if level > 1 {
            return Ok(());
        }

        let mut result = Ok(());
        if self.os_locked.replace(false) {
            state.owner_pid.store(0, Ordering::Release);
            result = platform::unlock(self.fd);
        }
        state.counter.release();
        result
    }
}

/// Releases one level of the lock on drop.
#[must_use = "the lock is released when the guard is dropped"]
pub struct ProcessMutexGuard<'a> {
    mutex: &'a ProcessMutex,
    state: &'a LockState,
}

impl Drop for ProcessMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock(self.state) {
            error!("Failed to release domain lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_file() -> std::fs::File {
        tempfile::tempfile().expect("temp file")
    }

    #[test]
    fn test_reentrant_levels() {
        let file = lock_file();
        let state = LockState::new(true);
        let mutex = ProcessMutex::new(platform::raw_fd(&file));

        let outer = mutex.lock(&state, None).unwrap();
        assert_eq!(state.counter.load().count(), 1);
        assert_eq!(state.owner_pid.load(Ordering::Relaxed), mutex.pid);
        {
            let _inner = mutex.lock(&state, None).unwrap();
            assert_eq!(mutex.lock_level(), 2);
            // Nested acquire does not touch shared state.
            assert_eq!(state.counter.load().count(), 1);
        }
        assert_eq!(mutex.lock_level(), 1);
        drop(outer);

        assert_eq!(mutex.lock_level(), 0);
        assert_eq!(state.counter.load().count(), 0);
        assert_eq!(state.owner_pid.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_without_thread_safety_no_owner_recorded() {
        let file = lock_file();
        let state = LockState::new(false);
        let mutex = ProcessMutex::new(platform::raw_fd(&file));

        let guard = mutex.lock(&state, None).unwrap();
        assert_eq!(state.counter.load().count(), 1);
        assert_eq!(state.owner_pid.load(Ordering::Relaxed), 0);
        drop(guard);
        assert_eq!(state.counter.load().count(), 0);
    }

    #[test]
    fn test_abandoned_owner_is_fatal() {
        let file = lock_file();
        let state = LockState::new(true);
        state.owner_pid.store(999_999, Ordering::Relaxed);
        let mutex = ProcessMutex::new(platform::raw_fd(&file));

        let err = mutex.lock(&state, None).err().expect("must fail");
        assert!(matches!(err, ArenaError::LockAbandoned { pid: 999_999 }));
        assert!(err.severity().is_fatal());
        assert_eq!(mutex.lock_level(), 0);
        assert_eq!(state.counter.load().count(), 0);
        // Every later acquirer sees the same abandonment.
        assert!(mutex.lock(&state, None).is_err());
    }

    #[test]
    fn test_waits_for_toggle_with_timeout() {
        let file = lock_file();
        let state = LockState::new(false);
        state.counter.set_post(false);
        let mutex = ProcessMutex::new(platform::raw_fd(&file));

        let err = mutex
            .lock(&state, Some(Duration::from_millis(5)))
            .err()
            .expect("toggle never finishes");
        assert!(matches!(err, ArenaError::SpinTimeout { .. }));
    }
}
