//! Client-facing entry points.
//!
//! An [`Arena`] is one process's attachment to a domain. Every operation
//! first refuses to run after a fatal error, then destroys variables the
//! client no longer references (unlinking their segments when nobody else
//! uses them), then does its work.
//!
//! Segments that leave the shared list while this process still hands out
//! their value are retired: dropped from the cache but kept mapped until the
//! last client handle goes away.

use crate::cache::LocalSegmentCache;
use crate::client::ClientValue;
use crate::codec;
use crate::directory::Domain;
use crate::error::{ArenaError, ArenaResult};
use crate::segment::{SegmentSpec, SharedSegment, next_seg_num};
use crate::tracker::{ValueHandle, VariableTracker};
use crate::value::Value;
use arena::config::{ConfigUpdate, FetchMode, ShareMode, UserConfig, default_config_path};
use arena::consts::{DEFAULT_NAME_PREFIX, MAX_KEY_LEN, SegNum};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

/// How to attach.
#[derive(Debug, Clone)]
pub struct ArenaOptions {
    /// Prefix of every OS object of the domain.
    pub name_prefix: String,
    /// Configuration file; `None` uses built-in defaults and never writes.
    pub config_path: Option<PathBuf>,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            config_path: default_config_path(),
        }
    }
}

/// Options of a single share.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareOptions<'a> {
    /// Replace the value previously shared under this key.
    pub key: Option<&'a str>,
    /// Exempt the segment from automatic collection.
    pub persistent: bool,
    /// Override the configured share mode. Ignored for keyed shares.
    pub mode: Option<ShareMode>,
}

/// One segment as seen by [`Arena::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SegmentStatus {
    /// Segment number.
    pub seg_num: SegNum,
    /// OS object name.
    pub name: String,
    /// Payload bytes.
    pub data_size: u64,
    /// Processes with a materialized value.
    pub procs_using: u64,
    /// Processes with a mapping.
    pub procs_tracking: u64,
    /// Exempt from automatic collection.
    pub persistent: bool,
    /// User key.
    pub key: Option<String>,
    /// Whether this process holds a value of it.
    pub fetched_here: bool,
}

/// Snapshot of a domain.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    /// Object name prefix.
    pub prefix: String,
    /// Directory revision.
    pub rev_num: u64,
    /// Attached processes.
    pub num_procs: u64,
    /// Segments in the shared list.
    pub num_valid_segments: u64,
    /// Payload bytes in the shared list.
    pub total_shared_size: u64,
    /// Pid holding the domain lock, 0 if free.
    pub lock_owner_pid: u32,
    /// Domain poisoned by shared corruption.
    pub has_fatal_error: bool,
    /// Active configuration.
    pub config: UserConfig,
    /// Shared list, head first.
    pub segments: Vec<SegmentStatus>,
    /// Unlinked segments this process keeps mapped for live values.
    pub retired_here: usize,
}

/// A process's attachment to a shared-memory domain.
///
/// Dropping the arena detaches every value it handed out (live handles then
/// read as empty), releases its segments and, in the last process of the
/// domain, removes every segment and the domain itself.
pub struct Arena<V: ClientValue = Value> {
    domain: Domain,
    cache: LocalSegmentCache,
    tracker: VariableTracker<V>,
    retired: HashMap<SegNum, SharedSegment>,
    poisoned: bool,
}

impl<V: ClientValue> std::fmt::Debug for Arena<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("domain", &self.domain)
            .field("cached", &self.cache.len())
            .field("variables", &self.tracker.len())
            .field("retired", &self.retired.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl<V: ClientValue> Arena<V> {
    /// Join (or create) the domain named by `options.name_prefix`.
    pub fn attach(options: ArenaOptions) -> ArenaResult<Self> {
        let domain = Domain::attach(&options.name_prefix, options.config_path)?;
        Ok(Self {
            cache: LocalSegmentCache::new(options.name_prefix),
            domain,
            tracker: VariableTracker::new(),
            retired: HashMap::new(),
            poisoned: false,
        })
    }

    /// Object name prefix of the domain.
    pub fn prefix(&self) -> &str {
        self.domain.prefix()
    }

    /// Copy `value` into shared memory and return this process's handle
    /// on the shared copy.
    ///
    /// Unless the segment is persistent, dropping every handle lets the next
    /// operation collect it once no other process uses it.
    ///
    /// # Errors
    ///
    /// - [`ArenaError::KeyTooLong`] for keys over 47 bytes
    /// - [`ArenaError::SegmentLimit`] / [`ArenaError::SizeLimit`] when the
    ///   configured limits would be exceeded
    pub fn share(&mut self, value: &V, options: ShareOptions<'_>) -> ArenaResult<ValueHandle<V>> {
        self.run(|this| this.share_inner(value, options))
    }

    fn share_inner(&mut self, value: &V, options: ShareOptions<'_>) -> ArenaResult<ValueHandle<V>> {
        if let Some(key) = options.key {
            if key.len() > MAX_KEY_LEN {
                return Err(ArenaError::KeyTooLong {
                    key: key.to_string(),
                    max: MAX_KEY_LEN,
                });
            }
            self.resync()?;
            if let Some(existing) = self.cache.find_key(key) {
                if self.try_overwrite(existing, value)? {
                    debug!("Overwrote keyed segment {} ('{}') in place", existing, key);
                    return self.variable_for(existing);
                }
                self.domain.unlink_from_shared_list(&mut self.cache, existing)?;
                self.retire(existing)?;
            }
            return self.create_and_link(value, &options);
        }

        let mode = match options.mode {
            Some(mode) => mode,
            None => self.domain.config()?.share_mode,
        };
        if mode == ShareMode::Overwrite {
            if let Some(latest) = self.domain.fast_resync_latest(&mut self.cache)?
                && self.try_overwrite(latest, value)?
            {
                debug!("Overwrote segment {} in place", latest);
                return self.variable_for(latest);
            }
            self.resync()?;
            for seg_num in self.domain.clear_all(&mut self.cache)? {
                self.retire(seg_num)?;
            }
        }
        self.create_and_link(value, &options)
    }

    fn try_overwrite(&mut self, seg_num: SegNum, value: &V) -> ArenaResult<bool> {
        let _guard = self.domain.lock()?;
        let segment = self
            .cache
            .get_mut(seg_num)
            .ok_or(ArenaError::NotTracked { seg_num })?;
        if segment.header().is_invalid() || !codec::compare_shape(segment.payload(), value)? {
            return Ok(false);
        }
        if codec::overlaps(value, segment.payload()) {
            // Same shape over the same bytes: the segment already holds it.
            debug!("Segment {} already holds the shared value", seg_num);
            return Ok(true);
        }
        let _exclusive = match self.tracker.try_write(seg_num) {
            Ok(guard) => guard,
            Err(ArenaError::ValueBorrowed { .. }) => {
                debug!("Segment {} is borrowed here, sharing a new copy", seg_num);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        codec::overwrite(segment.payload_mut(), value)?;
        Ok(true)
    }

    fn create_and_link(&mut self, value: &V, options: &ShareOptions<'_>) -> ArenaResult<ValueHandle<V>> {
        let size = codec::compute_size(value)?;
        let permissions = self.domain.config()?.permissions;
        let last = self.domain.header().last_seg_num.load(Ordering::Acquire);
        let mut segment = SharedSegment::create(&SegmentSpec {
            prefix: self.domain.prefix(),
            start: next_seg_num(last),
            payload_size: size,
            key: options.key,
            persistent: options.persistent,
            permissions,
        })?;
        codec::copy_into(segment.payload_mut(), value)?;

        let seg_num = segment.seg_num();
        self.cache.insert(segment)?;
        if let Err(e) = self.domain.link_to_shared_list(&mut self.cache, seg_num) {
            if let Some(segment) = self.cache.remove(seg_num)
                && let Err(detach_err) = segment.detach_locally()
            {
                error!("Failed to drop unlinked segment {}: {}", seg_num, detach_err);
            }
            return Err(e);
        }
        debug!("Shared {} bytes as segment {}", size, seg_num);
        self.variable_for(seg_num)
    }

    /// Fetch according to the configured fetch mode: the newest value, or
    /// every value oldest first.
    pub fn fetch(&mut self) -> ArenaResult<Vec<ValueHandle<V>>> {
        self.run(|this| match this.domain.config()?.fetch_mode {
            FetchMode::Recent => Ok(this.latest_handle()?.into_iter().collect()),
            FetchMode::All => this.all_handles(),
        })
    }

    /// Newest shared value, if any.
    pub fn fetch_latest(&mut self) -> ArenaResult<Option<ValueHandle<V>>> {
        self.run(Self::latest_handle)
    }

    /// Every shared value, oldest first.
    pub fn fetch_all(&mut self) -> ArenaResult<Vec<ValueHandle<V>>> {
        self.run(Self::all_handles)
    }

    /// Value shared under `key`.
    pub fn fetch_key(&mut self, key: &str) -> ArenaResult<ValueHandle<V>> {
        self.run(|this| {
            this.resync()?;
            let seg_num = this.cache.find_key(key).ok_or_else(|| ArenaError::KeyNotFound {
                key: key.to_string(),
            })?;
            this.variable_for(seg_num)
        })
    }

    /// Independent local copy of the newest shared value.
    pub fn copy_latest(&mut self) -> ArenaResult<Option<V>> {
        self.run(|this| Ok(this.latest_handle()?.map(|h| h.duplicate())))
    }

    fn latest_handle(&mut self) -> ArenaResult<Option<ValueHandle<V>>> {
        match self.domain.fast_resync_latest(&mut self.cache)? {
            Some(seg_num) => self.variable_for(seg_num).map(Some),
            None => Ok(None),
        }
    }

    fn all_handles(&mut self) -> ArenaResult<Vec<ValueHandle<V>>> {
        self.resync()?;
        self.cache
            .order()
            .into_iter()
            .map(|seg_num| self.variable_for(seg_num))
            .collect()
    }

    fn variable_for(&mut self, seg_num: SegNum) -> ArenaResult<ValueHandle<V>> {
        if let Some(handle) = self.tracker.get(seg_num) {
            return Ok(handle);
        }
        let segment = self.cache.require(seg_num)?;
        self.tracker.create_from_segment(segment)
    }

    /// Remove every value from the domain. Returns how many were removed.
    ///
    /// Handles this process already holds stay readable until dropped.
    pub fn clear(&mut self) -> ArenaResult<usize> {
        self.run(|this| {
            this.resync()?;
            let cleared = this.domain.clear_all(&mut this.cache)?;
            for &seg_num in &cleared {
                this.retire(seg_num)?;
            }
            Ok(cleared.len())
        })
    }

    /// Remove the value shared under `key`.
    pub fn clear_key(&mut self, key: &str) -> ArenaResult<()> {
        self.run(|this| {
            this.resync()?;
            let seg_num = this.cache.find_key(key).ok_or_else(|| ArenaError::KeyNotFound {
                key: key.to_string(),
            })?;
            this.domain.unlink_from_shared_list(&mut this.cache, seg_num)?;
            this.retire(seg_num)
        })
    }

    /// Active configuration.
    pub fn config(&mut self) -> ArenaResult<UserConfig> {
        self.run(|this| this.domain.config())
    }

    /// Apply a partial configuration update for the whole domain.
    pub fn set_config(&mut self, update: &ConfigUpdate) -> ArenaResult<UserConfig> {
        self.run(|this| {
            let current = this.domain.config()?;
            let next = update.apply(&current)?;
            if next != current {
                this.domain.set_config(&next)?;
                info!("Updated configuration of {}", this.domain.info_name());
            }
            Ok(next)
        })
    }

    /// Collect now: destroy unreferenced variables, unlink segments nobody
    /// uses, and drop segments other processes removed. Returns how many
    /// segments this call unlinked.
    pub fn gc(&mut self) -> ArenaResult<usize> {
        self.checked(|this| {
            this.domain.check_fatal()?;
            let collected = this.collect()?;
            this.resync()?;
            Ok(collected)
        })
    }

    /// Snapshot of the domain after a resync.
    pub fn status(&mut self) -> ArenaResult<DomainStatus> {
        self.run(|this| {
            this.resync()?;
            let config = this.domain.config()?;
            let header = this.domain.header();
            let segments = this
                .cache
                .order()
                .into_iter()
                .filter_map(|seg_num| this.cache.get(seg_num))
                .map(|segment| {
                    let meta = segment.header();
                    SegmentStatus {
                        seg_num: segment.seg_num(),
                        name: segment.name().to_string(),
                        data_size: meta.data_size,
                        procs_using: meta.procs_using.load().count(),
                        procs_tracking: meta.procs_tracking.load().count(),
                        persistent: meta.is_persistent(),
                        key: meta.key().map(str::to_string),
                        fetched_here: this.tracker.contains(segment.seg_num()),
                    }
                })
                .collect();
            Ok(DomainStatus {
                prefix: this.domain.prefix().to_string(),
                rev_num: header.rev_num.load(Ordering::Acquire),
                num_procs: header.num_procs.load().count(),
                num_valid_segments: header.num_valid_segments.load(Ordering::Acquire),
                total_shared_size: header.total_shared_size.load(Ordering::Acquire),
                lock_owner_pid: header.lock.owner_pid.load(Ordering::Acquire),
                has_fatal_error: header.has_fatal_error.load(Ordering::Acquire) != 0,
                config,
                segments,
                retired_here: this.retired.len(),
            })
        })
    }

    fn run<T>(&mut self, op: impl FnOnce(&mut Self) -> ArenaResult<T>) -> ArenaResult<T> {
        self.checked(|this| {
            this.domain.check_fatal()?;
            this.collect()?;
            op(this)
        })
    }

    fn checked<T>(&mut self, op: impl FnOnce(&mut Self) -> ArenaResult<T>) -> ArenaResult<T> {
        if self.poisoned {
            return Err(ArenaError::Poisoned { domain_wide: false });
        }
        let result = op(self);
        if let Err(e) = &result {
            let severity = e.severity();
            if severity.is_fatal() {
                self.poisoned = true;
                if severity.is_domain_wide() {
                    self.domain.mark_fatal();
                }
                error!("Fatal error in {}: {}", self.domain.info_name(), e);
            }
        }
        result
    }

    fn resync(&mut self) -> ArenaResult<()> {
        for segment in self.domain.full_resync(&mut self.cache)? {
            let seg_num = segment.seg_num();
            if self.tracker.contains(seg_num) {
                self.retired.insert(seg_num, segment);
            } else {
                segment.detach_locally()?;
            }
        }
        Ok(())
    }

    fn retire(&mut self, seg_num: SegNum) -> ArenaResult<()> {
        let Some(segment) = self.cache.remove(seg_num) else {
            return Ok(());
        };
        if self.tracker.contains(seg_num) {
            self.retired.insert(seg_num, segment);
            Ok(())
        } else {
            segment.detach_locally()
        }
    }

    fn collect(&mut self) -> ArenaResult<usize> {
        let orphans = self.tracker.orphaned();
        if orphans.is_empty() {
            return Ok(0);
        }
        let gc_enabled = self.domain.config()?.gc_enabled;
        let mut collected = 0;
        for seg_num in orphans {
            if self.destroy_variable(seg_num, gc_enabled)? {
                collected += 1;
            }
        }
        if collected > 0 {
            debug!("Collected {} segments", collected);
        }
        Ok(collected)
    }

    /// Destroy the variable of `seg_num`; returns whether its segment was
    /// unlinked by this call.
    fn destroy_variable(&mut self, seg_num: SegNum, gc_enabled: bool) -> ArenaResult<bool> {
        if let Some(segment) = self.retired.remove(&seg_num) {
            if let Err(e) = self.tracker.destroy(seg_num, &segment) {
                self.retired.insert(seg_num, segment);
                return Err(e);
            }
            segment.detach_locally()?;
            return Ok(false);
        }

        let segment = self.cache.require(seg_num)?;
        let persistent = segment.header().is_persistent();
        let unused = self.tracker.destroy(seg_num, segment)?;
        let mut collected = false;
        if unused && gc_enabled && !persistent {
            collected = self.domain.unlink_from_shared_list(&mut self.cache, seg_num)?;
        }
        if self.cache.require(seg_num)?.header().is_invalid() {
            self.retire(seg_num)?;
        }
        Ok(collected)
    }
}

impl<V: ClientValue> Drop for Arena<V> {
    fn drop(&mut self) {
        let gc_enabled = !self.poisoned
            && self
                .domain
                .config()
                .map(|c| c.gc_enabled)
                .unwrap_or(false);

        let mut leaked = HashSet::new();
        for seg_num in self.tracker.seg_nums() {
            if let Err(e) = self.destroy_variable(seg_num, gc_enabled) {
                if self.tracker.contains(seg_num) {
                    warn!("Leaking segment {} still borrowed at detach: {}", seg_num, e);
                    leaked.insert(seg_num);
                } else {
                    error!("Failed to release segment {}: {}", seg_num, e);
                }
            }
        }

        let last = self.domain.leave();
        if last && !self.poisoned {
            if let Err(e) = self.domain.clear_all(&mut self.cache) {
                error!("Failed to clear {}: {}", self.domain.info_name(), e);
            }
        }

        let mut segments = self.cache.drain();
        segments.extend(self.retired.drain().map(|(_, s)| s));
        for segment in segments {
            if leaked.contains(&segment.seg_num()) {
                segment.leak();
            } else if let Err(e) = segment.detach_locally() {
                error!("Failed to detach segment: {}", e);
            }
        }

        if last && let Err(e) = self.domain.teardown() {
            error!("Failed to tear down {}: {}", self.domain.info_name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static NEXT: AtomicU32 = AtomicU32::new(0);

    fn options() -> ArenaOptions {
        ArenaOptions {
            name_prefix: format!(
                "arena_fac_{}_{}_",
                std::process::id(),
                NEXT.fetch_add(1, Ordering::Relaxed)
            ),
            config_path: None,
        }
    }

    #[test]
    fn test_share_then_fetch_latest() {
        let mut arena: Arena = Arena::attach(options()).unwrap();
        let value = Value::numeric(&[2, 2], &[1.0f64, 2.0, 3.0, 4.0]).unwrap();
        let shared = arena.share(&value, ShareOptions::default()).unwrap();
        let fetched = arena.fetch_latest().unwrap().unwrap();
        assert!(shared.ptr_eq(&fetched));
        assert_eq!(*fetched.read(), value);
    }

    #[test]
    fn test_dropped_handle_is_collected() {
        let mut arena: Arena = Arena::attach(options()).unwrap();
        drop(arena.share(&Value::scalar(1.0), ShareOptions::default()).unwrap());
        assert_eq!(arena.gc().unwrap(), 1);
        assert_eq!(arena.status().unwrap().num_valid_segments, 0);
    }

    #[test]
    fn test_clear_keeps_held_values_readable() {
        let mut arena: Arena = Arena::attach(options()).unwrap();
        let handle = arena.share(&Value::text("kept"), ShareOptions::default()).unwrap();
        assert_eq!(arena.clear().unwrap(), 1);
        assert_eq!(handle.read().to_text().as_deref(), Some("kept"));

        let status = arena.status().unwrap();
        assert_eq!(status.num_valid_segments, 0);
        assert_eq!(status.retired_here, 1);

        drop(handle);
        arena.gc().unwrap();
        assert_eq!(arena.status().unwrap().retired_here, 0);
    }

    #[test]
    fn test_key_too_long_is_user_error() {
        let mut arena: Arena = Arena::attach(options()).unwrap();
        let key = "k".repeat(MAX_KEY_LEN + 1);
        let err = arena
            .share(
                &Value::scalar(1.0),
                ShareOptions {
                    key: Some(&key),
                    ..ShareOptions::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ArenaError::KeyTooLong { .. }));
        assert!(!err.severity().is_fatal());
        assert!(arena.fetch_latest().unwrap().is_none());
    }

    #[test]
    fn test_drop_detaches_outstanding_handles() {
        let mut arena: Arena = Arena::attach(options()).unwrap();
        let handle = arena
            .share(&Value::numeric(&[1, 3], &[1u8, 2, 3]).unwrap(), ShareOptions::default())
            .unwrap();
        drop(arena);
        assert!(!handle.read().is_mapped());
        assert_eq!(handle.read().to_vec::<u8>(), Some(Vec::new()));
    }
}
