//! Shared directory of a domain and the shared-list protocol.
//!
//! Every process of a domain maps the same info object holding a
//! [`DirectoryHeader`]: head and tail of the shared list, the revision
//! counter, statistics, the lock state and the user configuration. A
//! [`Domain`] is one process's handle on it.
//!
//! Structural fields (`first/last_seg_num`, `num_valid_segments`, growth of
//! `total_shared_size`, segment links and `is_invalid`) only change while the
//! domain lock is held. Revision reads, `num_procs` and shrinking of
//! `total_shared_size` are lock-free.
//!
//! # Liveness
//!
//! Spins wait for another process to finish a protocol step (initialize the
//! directory, unlink a segment, toggle thread safety, tear the domain down).
//! A process that dies between starting and finishing such a step leaves the
//! others spinning; `spin_timeout_ms` turns that into a fatal error instead.

use crate::cache::LocalSegmentCache;
use crate::counter::{
    AtomicCounter, CounterSnapshot, SpinWait, bounded_add, next_revision, saturating_sub,
};
use crate::error::{ArenaError, ArenaResult};
use crate::mutex::{LockState, ProcessMutex, ProcessMutexGuard};
use crate::platform;
use crate::segment::SharedSegment;
use arena::config::{FetchMode, ShareMode, UserConfig};
use arena::consts::{SEG_NUM_NONE, SegNum};
use arena::names::info_object_name;
use memmap2::MmapMut;
use static_assertions::const_assert_eq;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// "SHMARENA" as a little-endian word.
pub const DIRECTORY_MAGIC: u64 = 0x414E_4552_414D_4853;

/// User configuration block in shared memory.
///
/// Thread safety is not stored here; it is the flag of the lock counter.
#[derive(Debug)]
#[repr(C)]
pub struct ConfigBlock {
    /// Maximum live segments.
    pub max_segments: AtomicU64,
    /// Maximum total payload bytes.
    pub max_shared_size: AtomicU64,
    /// Spin timeout, 0 = unbounded.
    pub spin_timeout_ms: AtomicU64,
    /// Automatic garbage collection.
    pub gc_enabled: AtomicU32,
    /// Raw [`ShareMode`].
    pub share_mode: AtomicU32,
    /// Raw [`FetchMode`].
    pub fetch_mode: AtomicU32,
    /// Permission bits of new objects.
    pub permissions: AtomicU32,
}

impl ConfigBlock {
    fn store(&self, config: &UserConfig) {
        self.max_segments
            .store(config.max_segments, Ordering::Release);
        self.max_shared_size
            .store(config.max_shared_size, Ordering::Release);
        self.spin_timeout_ms
            .store(config.spin_timeout_ms, Ordering::Release);
        self.gc_enabled
            .store(config.gc_enabled as u32, Ordering::Release);
        self.share_mode
            .store(config.share_mode.as_raw(), Ordering::Release);
        self.fetch_mode
            .store(config.fetch_mode.as_raw(), Ordering::Release);
        self.permissions
            .store(config.permissions, Ordering::Release);
    }

    fn load(&self, thread_safety: bool) -> ArenaResult<UserConfig> {
        let share_mode = ShareMode::from_raw(self.share_mode.load(Ordering::Acquire))
            .ok_or_else(|| ArenaError::corruption("unknown share mode in directory"))?;
        let fetch_mode = FetchMode::from_raw(self.fetch_mode.load(Ordering::Acquire))
            .ok_or_else(|| ArenaError::corruption("unknown fetch mode in directory"))?;
        Ok(UserConfig {
            max_segments: self.max_segments.load(Ordering::Acquire),
            max_shared_size: self.max_shared_size.load(Ordering::Acquire),
            gc_enabled: self.gc_enabled.load(Ordering::Acquire) != 0,
            thread_safety,
            share_mode,
            fetch_mode,
            permissions: self.permissions.load(Ordering::Acquire),
            spin_timeout_ms: self.spin_timeout_ms.load(Ordering::Acquire),
        })
    }
}

/// Contents of the info object.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct DirectoryHeader {
    /// [`DIRECTORY_MAGIC`] once initialized.
    pub magic: AtomicU64,
    /// Bumped on every structural change; never 0 once initialized.
    pub rev_num: AtomicU64,
    /// Head of the shared list.
    pub first_seg_num: AtomicI64,
    /// Tail of the shared list.
    pub last_seg_num: AtomicI64,
    /// Segments reachable from the head.
    pub num_valid_segments: AtomicU64,
    /// Payload bytes of reachable segments.
    pub total_shared_size: AtomicU64,
    /// Attached processes; flag set by the last one out.
    pub num_procs: AtomicCounter,
    /// Domain lock.
    pub lock: LockState,
    /// Non-zero once every field above is valid.
    pub is_initialized: AtomicU32,
    /// Non-zero after shared corruption was detected.
    pub has_fatal_error: AtomicU32,
    /// Last process to change the list.
    pub update_pid: AtomicU32,
    _reserved: u32,
    /// User configuration.
    pub user_defined: ConfigBlock,
}

const_assert_eq!(std::mem::size_of::<DirectoryHeader>(), 128);

/// Size of the info object.
pub const INFO_SIZE: usize = std::mem::size_of::<DirectoryHeader>();

/// One process's handle on a domain.
pub struct Domain {
    prefix: String,
    info_name: String,
    _file: File,
    mmap: MmapMut,
    mutex: ProcessMutex,
    config_path: Option<PathBuf>,
    pid: u32,
    left: bool,
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("info_name", &self.info_name)
            .field("pid", &self.pid)
            .finish()
    }
}

impl Domain {
    /// Join the domain named by `prefix`, creating it if this is the first
    /// process.
    ///
    /// The creator seeds the configuration from `config_path` (defaults if
    /// absent or `None`).
    pub fn attach(prefix: &str, config_path: Option<PathBuf>) -> ArenaResult<Self> {
        let initial = match &config_path {
            Some(path) => UserConfig::load_or_default(path)?,
            None => UserConfig::default(),
        };
        let info_name = info_object_name(prefix);
        let timeout = SpinWait::timeout_from_ms(initial.spin_timeout_ms);

        loop {
            if let Some(file) =
                platform::shm_create_exclusive(&info_name, INFO_SIZE, initial.permissions)?
            {
                let mmap = match platform::map_shared(&file, INFO_SIZE) {
                    Ok(mmap) => mmap,
                    Err(e) => {
                        if let Err(remove_err) = platform::shm_remove(&info_name) {
                            warn!("Failed to remove unmappable {}: {}", info_name, remove_err);
                        }
                        return Err(e);
                    }
                };
                let domain = Self::from_parts(prefix, &info_name, file, mmap, config_path);
                domain.initialize(&initial);
                info!("Created domain {}", info_name);
                return Ok(domain);
            }

            let Some(file) = platform::shm_open_existing(&info_name)? else {
                // Removed between our create and open attempts.
                continue;
            };
            let mut spin = SpinWait::new("domain info sizing", timeout);
            while platform::object_len(&file)? < INFO_SIZE {
                spin.spin()?;
            }
            let mmap = platform::map_shared(&file, INFO_SIZE)?;
            let mut domain = Self::from_parts(prefix, &info_name, file, mmap, config_path.clone());
            // Not counted yet; dropping must not leave.
            domain.left = true;

            let header = domain.header();
            let mut spin = SpinWait::new("domain initialization", timeout);
            while header.is_initialized.load(Ordering::Acquire) == 0 {
                spin.spin()?;
            }
            if header.magic.load(Ordering::Acquire) != DIRECTORY_MAGIC {
                return Err(ArenaError::corruption(format!(
                    "{info_name} does not hold an arena directory"
                )));
            }

            let joined = header.num_procs.increment();
            if joined.flag() {
                debug!("Domain {} is being torn down, waiting", info_name);
                let mut spin = SpinWait::new("domain teardown", timeout);
                while !header.num_procs.load().post() {
                    spin.spin()?;
                }
                continue;
            }

            domain.left = false;
            info!(
                "Attached to domain {} ({} processes)",
                info_name,
                joined.count()
            );
            return Ok(domain);
        }
    }

    fn from_parts(
        prefix: &str,
        info_name: &str,
        file: File,
        mmap: MmapMut,
        config_path: Option<PathBuf>,
    ) -> Self {
        let mutex = ProcessMutex::new(platform::raw_fd(&file));
        Self {
            prefix: prefix.to_string(),
            info_name: info_name.to_string(),
            _file: file,
            mmap,
            mutex,
            config_path,
            pid: platform::get_current_pid(),
            left: false,
        }
    }

    fn initialize(&self, config: &UserConfig) {
        let h = self.header();
        h.magic.store(DIRECTORY_MAGIC, Ordering::Release);
        h.rev_num.store(1, Ordering::Release);
        h.first_seg_num.store(SEG_NUM_NONE, Ordering::Release);
        h.last_seg_num.store(SEG_NUM_NONE, Ordering::Release);
        h.num_valid_segments.store(0, Ordering::Release);
        h.total_shared_size.store(0, Ordering::Release);
        h.num_procs.store(CounterSnapshot::new(1, false, false));
        h.lock
            .counter
            .store(CounterSnapshot::new(0, config.thread_safety, true));
        h.lock.owner_pid.store(0, Ordering::Release);
        h.has_fatal_error.store(0, Ordering::Release);
        h.update_pid.store(self.pid, Ordering::Release);
        h.user_defined.store(config);
        h.is_initialized.store(1, Ordering::Release);
    }

    /// Shared header.
    pub fn header(&self) -> &DirectoryHeader {
        // SAFETY: the mapping is page aligned and INFO_SIZE long; all fields
        // are atomics.
        unsafe { &*(self.mmap.as_ptr() as *const DirectoryHeader) }
    }

    /// Object name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Name of the info object.
    pub fn info_name(&self) -> &str {
        &self.info_name
    }

    /// Configured spin timeout.
    pub fn spin_timeout(&self) -> Option<Duration> {
        SpinWait::timeout_from_ms(
            self.header()
                .user_defined
                .spin_timeout_ms
                .load(Ordering::Acquire),
        )
    }

    /// Take the domain lock.
    pub fn lock(&self) -> ArenaResult<ProcessMutexGuard<'_>> {
        self.mutex.lock(&self.header().lock, self.spin_timeout())
    }

    /// Fails if shared corruption was recorded by any process.
    pub fn check_fatal(&self) -> ArenaResult<()> {
        if self.header().has_fatal_error.load(Ordering::Acquire) != 0 {
            return Err(ArenaError::Poisoned { domain_wide: true });
        }
        Ok(())
    }

    /// Poison the domain for every process.
    pub fn mark_fatal(&self) {
        self.header().has_fatal_error.store(1, Ordering::Release);
    }

    /// Current configuration.
    pub fn config(&self) -> ArenaResult<UserConfig> {
        let h = self.header();
        h.user_defined.load(h.lock.thread_safety())
    }

    /// Store a new configuration.
    ///
    /// A thread-safety change first waits until no process is inside the
    /// lock, then flips the flag; the rest is written under the lock.
    pub fn set_config(&self, config: &UserConfig) -> ArenaResult<()> {
        let h = self.header();
        if h.lock.thread_safety() != config.thread_safety {
            let mut spin = SpinWait::new("lock drain for thread safety toggle", self.spin_timeout());
            h.lock
                .counter
                .wait_then_set_flag(config.thread_safety, &mut spin)?;
            info!("Thread safety set to {}", config.thread_safety);
        }
        let _guard = self.lock()?;
        h.user_defined.store(config);
        Ok(())
    }

    /// Current revision.
    pub fn rev_num(&self) -> u64 {
        self.header().rev_num.load(Ordering::Acquire)
    }

    /// Bump the revision, skipping the reserved zero.
    pub fn bump_revision(&self) -> u64 {
        next_revision(&self.header().rev_num)
    }

    fn stamp(&self, segment: &SharedSegment) {
        segment
            .header()
            .update_pid
            .store(self.pid, Ordering::Release);
        self.header().update_pid.store(self.pid, Ordering::Release);
    }

    /// Append a cached, not yet linked segment to the shared list.
    ///
    /// # Errors
    ///
    /// [`ArenaError::SegmentLimit`] or [`ArenaError::SizeLimit`] when the
    /// configured limits would be exceeded; the directory is left unchanged.
    pub fn link_to_shared_list(&self, cache: &mut LocalSegmentCache, seg_num: SegNum) -> ArenaResult<()> {
        let _guard = self.lock()?;
        let h = self.header();
        let limits = &h.user_defined;

        let data_size = cache.require(seg_num)?.header().data_size;
        let max_segments = limits.max_segments.load(Ordering::Acquire);
        if h.num_valid_segments.load(Ordering::Acquire) >= max_segments {
            return Err(ArenaError::SegmentLimit { max: max_segments });
        }
        let max_size = limits.max_shared_size.load(Ordering::Acquire);
        if !bounded_add(&h.total_shared_size, data_size, max_size) {
            return Err(ArenaError::SizeLimit {
                requested: data_size,
                in_use: h.total_shared_size.load(Ordering::Acquire),
                max: max_size,
            });
        }

        let tail = h.last_seg_num.load(Ordering::Acquire);
        if tail != SEG_NUM_NONE {
            match cache.get_or_open(tail, self.spin_timeout()) {
                Ok(t) => t.header().next_seg_num.store(seg_num, Ordering::Release),
                Err(e) => {
                    saturating_sub(&h.total_shared_size, data_size);
                    return Err(e);
                }
            }
        } else {
            h.first_seg_num.store(seg_num, Ordering::Release);
        }

        let segment = cache.require(seg_num)?;
        let meta = segment.header();
        meta.prev_seg_num.store(tail, Ordering::Release);
        meta.next_seg_num.store(SEG_NUM_NONE, Ordering::Release);
        meta.is_invalid.store(0, Ordering::Release);
        self.stamp(segment);
        h.last_seg_num.store(seg_num, Ordering::Release);
        h.num_valid_segments.fetch_add(1, Ordering::AcqRel);

        let was_synced = cache.rev_num() == h.rev_num.load(Ordering::Acquire);
        let rev = self.bump_revision();
        if was_synced {
            cache.set_rev_num(rev);
        }
        cache.move_to_tail(seg_num);
        debug!("Linked segment {} after {} (rev {})", seg_num, tail, rev);
        Ok(())
    }

    /// Remove a cached segment from the shared list.
    ///
    /// Returns `false` if another process already unlinked it.
    pub fn unlink_from_shared_list(
        &self,
        cache: &mut LocalSegmentCache,
        seg_num: SegNum,
    ) -> ArenaResult<bool> {
        if cache.require(seg_num)?.header().is_invalid() {
            return Ok(false);
        }
        let _guard = self.lock()?;
        let (prev, next, size) = {
            let meta = cache.require(seg_num)?.header();
            if meta.is_invalid() {
                return Ok(false);
            }
            (meta.prev(), meta.next(), meta.data_size)
        };

        // Map both neighbours before changing anything.
        let timeout = self.spin_timeout();
        if prev != SEG_NUM_NONE {
            cache.get_or_open(prev, timeout)?;
        }
        if next != SEG_NUM_NONE {
            cache.get_or_open(next, timeout)?;
        }

        let h = self.header();
        match prev {
            SEG_NUM_NONE => h.first_seg_num.store(next, Ordering::Release),
            p => cache
                .require(p)?
                .header()
                .next_seg_num
                .store(next, Ordering::Release),
        }
        match next {
            SEG_NUM_NONE => h.last_seg_num.store(prev, Ordering::Release),
            n => cache
                .require(n)?
                .header()
                .prev_seg_num
                .store(prev, Ordering::Release),
        }

        let segment = cache.require(seg_num)?;
        let meta = segment.header();
        meta.is_invalid.store(1, Ordering::Release);
        meta.prev_seg_num.store(SEG_NUM_NONE, Ordering::Release);
        meta.next_seg_num.store(SEG_NUM_NONE, Ordering::Release);
        self.stamp(segment);
        saturating_sub(&h.num_valid_segments, 1);
        saturating_sub(&h.total_shared_size, size);
        let rev = self.bump_revision();
        debug!("Unlinked segment {} (rev {})", seg_num, rev);
        Ok(true)
    }

    /// Bring the cache in line with the shared list.
    ///
    /// No-op while the cached revision is current. Returns the segments that
    /// left the shared list since the last resync, already removed from the
    /// cache; the caller detaches them.
    pub fn full_resync(&self, cache: &mut LocalSegmentCache) -> ArenaResult<Vec<SharedSegment>> {
        let h = self.header();
        if cache.rev_num() == h.rev_num.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }

        let guard = self.lock()?;
        let rev = h.rev_num.load(Ordering::Acquire);
        let expected = h.num_valid_segments.load(Ordering::Acquire);
        let timeout = self.spin_timeout();

        let mut visited = HashSet::new();
        let mut cursor = h.first_seg_num.load(Ordering::Acquire);
        while cursor != SEG_NUM_NONE {
            if visited.len() as u64 >= expected || !visited.insert(cursor) {
                return Err(ArenaError::corruption(format!(
                    "shared list longer than its {expected} recorded segments"
                )));
            }
            let meta = cache.get_or_open(cursor, timeout)?.header();
            if meta.is_invalid() {
                return Err(ArenaError::corruption(format!(
                    "invalidated segment {cursor} is reachable"
                )));
            }
            let next = meta.next();
            cache.move_to_tail(cursor);
            cursor = next;
        }
        if visited.len() as u64 != expected {
            return Err(ArenaError::corruption(format!(
                "shared list holds {} segments, directory records {expected}",
                visited.len()
            )));
        }
        cache.set_rev_num(rev);
        drop(guard);

        let stale = cache.retain(&visited);
        if !stale.is_empty() {
            debug!("Resync to rev {} dropped {} stale segments", rev, stale.len());
        }
        Ok(stale)
    }

    /// Make sure the newest shared segment is cached and at the local tail.
    ///
    /// Does not touch the rest of the list or the cached revision.
    pub fn fast_resync_latest(&self, cache: &mut LocalSegmentCache) -> ArenaResult<Option<SegNum>> {
        let _guard = self.lock()?;
        let last = self.header().last_seg_num.load(Ordering::Acquire);
        if last == SEG_NUM_NONE {
            return Ok(None);
        }
        cache.get_or_open(last, self.spin_timeout())?;
        cache.move_to_tail(last);
        Ok(Some(last))
    }

    /// Unlink every segment, head first. Returns the unlinked numbers; the
    /// segments stay cached for the caller to detach.
    pub fn clear_all(&self, cache: &mut LocalSegmentCache) -> ArenaResult<Vec<SegNum>> {
        let _guard = self.lock()?;
        let timeout = self.spin_timeout();
        let mut cleared = Vec::new();
        loop {
            let first = self.header().first_seg_num.load(Ordering::Acquire);
            if first == SEG_NUM_NONE {
                break;
            }
            cache.get_or_open(first, timeout)?;
            if !self.unlink_from_shared_list(cache, first)? {
                return Err(ArenaError::corruption(format!(
                    "list head {first} is already invalidated"
                )));
            }
            cleared.push(first);
        }
        if !cleared.is_empty() {
            info!("Cleared {} segments from {}", cleared.len(), self.info_name);
        }
        Ok(cleared)
    }

    /// Stop counting this process. Returns `true` for the last process out,
    /// which must tear the domain down.
    pub fn leave(&mut self) -> bool {
        if self.left {
            return false;
        }
        self.left = true;
        self.header().num_procs.decrement(true)
    }

    /// Persist the configuration if it changed, remove the info object and
    /// release processes waiting to re-create the domain.
    pub fn teardown(&mut self) -> ArenaResult<()> {
        let result = self.persist_config().and_then(|()| {
            platform::shm_remove(&self.info_name)?;
            Ok(())
        });
        self.header().num_procs.set_post(true);
        info!("Tore down domain {}", self.info_name);
        result
    }

    fn persist_config(&self) -> ArenaResult<()> {
        let Some(path) = self.config_path.as_deref() else {
            return Ok(());
        };
        let config = self.config()?;
        if config.store_if_changed(path)? {
            info!("Saved configuration to {}", path.display());
        }
        Ok(())
    }

    /// Path the configuration is persisted to, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        if self.leave() {
            warn!("Domain {} dropped without clearing its segments", self.info_name);
            if let Err(e) = self.teardown() {
                error!("Failed to tear down domain {}: {}", self.info_name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentSpec;
    use std::sync::atomic::AtomicU32 as TestCounter;

    static NEXT: TestCounter = TestCounter::new(0);

    fn prefix() -> String {
        format!(
            "arena_dir_{}_{}_",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn share(domain: &Domain, cache: &mut LocalSegmentCache, size: usize) -> ArenaResult<SegNum> {
        let last = domain.header().last_seg_num.load(Ordering::Acquire);
        let segment = SharedSegment::create(&SegmentSpec {
            prefix: domain.prefix(),
            start: crate::segment::next_seg_num(last),
            payload_size: size,
            key: None,
            persistent: false,
            permissions: 0o600,
        })?;
        let seg_num = segment.seg_num();
        cache.insert(segment)?;
        if let Err(e) = domain.link_to_shared_list(cache, seg_num) {
            if let Some(s) = cache.remove(seg_num) {
                s.detach_locally()?;
            }
            return Err(e);
        }
        Ok(seg_num)
    }

    fn teardown(mut domain: Domain, mut cache: LocalSegmentCache) {
        if domain.leave() {
            domain.clear_all(&mut cache).unwrap();
            for s in cache.drain() {
                s.detach_locally().unwrap();
            }
            domain.teardown().unwrap();
        } else {
            for s in cache.drain() {
                s.detach_locally().unwrap();
            }
        }
    }

    #[test]
    fn test_fresh_domain_state() {
        let prefix = prefix();
        let domain = Domain::attach(&prefix, None).unwrap();
        let h = domain.header();
        assert_eq!(h.magic.load(Ordering::Relaxed), DIRECTORY_MAGIC);
        assert_eq!(h.rev_num.load(Ordering::Relaxed), 1);
        assert_eq!(h.first_seg_num.load(Ordering::Relaxed), SEG_NUM_NONE);
        assert_eq!(h.num_procs.load().count(), 1);
        assert_eq!(domain.config().unwrap(), UserConfig::default());
        teardown(domain, LocalSegmentCache::new(prefix));
    }

    #[test]
    fn test_second_attach_counts_processes() {
        let prefix = prefix();
        let a = Domain::attach(&prefix, None).unwrap();
        let b = Domain::attach(&prefix, None).unwrap();
        assert_eq!(a.header().num_procs.load().count(), 2);
        let info = a.info_name().to_string();

        teardown(b, LocalSegmentCache::new(prefix.clone()));
        assert!(platform::shm_exists(&info).unwrap());
        teardown(a, LocalSegmentCache::new(prefix));
        assert!(!platform::shm_exists(&info).unwrap());
    }

    #[test]
    fn test_link_unlink_keeps_list_consistent() {
        let prefix = prefix();
        let domain = Domain::attach(&prefix, None).unwrap();
        let mut cache = LocalSegmentCache::new(prefix.clone());

        let a = share(&domain, &mut cache, 64).unwrap();
        let b = share(&domain, &mut cache, 64).unwrap();
        let c = share(&domain, &mut cache, 64).unwrap();
        let h = domain.header();
        assert_eq!(h.num_valid_segments.load(Ordering::Relaxed), 3);
        assert_eq!(h.total_shared_size.load(Ordering::Relaxed), 192);

        assert!(domain.unlink_from_shared_list(&mut cache, b).unwrap());
        assert!(!domain.unlink_from_shared_list(&mut cache, b).unwrap());
        assert_eq!(cache.get(a).unwrap().header().next(), c);
        assert_eq!(cache.get(c).unwrap().header().prev(), a);
        assert_eq!(h.num_valid_segments.load(Ordering::Relaxed), 2);
        assert_eq!(h.total_shared_size.load(Ordering::Relaxed), 128);

        drop(cache.remove(b));
        teardown(domain, cache);
    }

    #[test]
    fn test_limits_leave_directory_unchanged() {
        let prefix = prefix();
        let domain = Domain::attach(&prefix, None).unwrap();
        domain
            .set_config(&UserConfig {
                max_segments: 1,
                ..UserConfig::default()
            })
            .unwrap();
        let mut cache = LocalSegmentCache::new(prefix.clone());

        share(&domain, &mut cache, 64).unwrap();
        let rev = domain.rev_num();
        let err = share(&domain, &mut cache, 64).unwrap_err();
        assert!(matches!(err, ArenaError::SegmentLimit { max: 1 }));
        assert_eq!(domain.rev_num(), rev);
        assert_eq!(domain.header().num_valid_segments.load(Ordering::Relaxed), 1);
        assert_eq!(domain.header().total_shared_size.load(Ordering::Relaxed), 64);
        teardown(domain, cache);
    }

    #[test]
    fn test_full_resync_drops_stale_segments() {
        let prefix = prefix();
        let p1 = Domain::attach(&prefix, None).unwrap();
        let p2 = Domain::attach(&prefix, None).unwrap();
        let mut c1 = LocalSegmentCache::new(prefix.clone());
        let mut c2 = LocalSegmentCache::new(prefix.clone());

        let a = share(&p1, &mut c1, 64).unwrap();
        let b = share(&p1, &mut c1, 64).unwrap();
        assert!(p2.full_resync(&mut c2).unwrap().is_empty());
        assert_eq!(c2.order(), vec![a, b]);
        assert_eq!(c2.rev_num(), p2.rev_num());

        assert!(p1.unlink_from_shared_list(&mut c1, a).unwrap());
        c1.remove(a).unwrap().detach_locally().unwrap();

        let stale = p2.full_resync(&mut c2).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].seg_num(), a);
        assert_eq!(c2.order(), vec![b]);
        for s in stale {
            s.detach_locally().unwrap();
        }

        teardown(p2, c2);
        teardown(p1, c1);
    }

    #[test]
    fn test_thread_safety_toggle() {
        let prefix = prefix();
        let domain = Domain::attach(&prefix, None).unwrap();
        assert!(domain.config().unwrap().thread_safety);
        domain
            .set_config(&UserConfig {
                thread_safety: false,
                ..UserConfig::default()
            })
            .unwrap();
        assert!(!domain.config().unwrap().thread_safety);
        let counter = domain.header().lock.counter.load();
        assert!(counter.post());
        assert_eq!(counter.count(), 0);
        teardown(domain, LocalSegmentCache::new(prefix));
    }
}
