//! Shared memory segment structures and operations
//!
//! A segment is one OS shared-memory object: a [`SegmentMetadata`] header
//! followed by a codec payload.
//!
//! ```text
//! Unmapped ──create/open──► Mapped ──link──► Linked ──unlink──► Invalidated ──last detach──► Destroyed
//! ```

use crate::counter::{AtomicCounter, CounterSnapshot, SpinWait};
use crate::error::{ArenaError, ArenaResult};
use crate::platform;
use arena::consts::{MAX_KEY_LEN, MAX_SEG_NUM, SEG_NUM_NONE, SegNum};
use arena::names::segment_object_name;
use memmap2::MmapMut;
use static_assertions::const_assert_eq;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Header at the start of every segment.
#[repr(C, align(64))]
pub struct SegmentMetadata {
    /// Payload length in bytes, immutable after creation.
    pub data_size: u64,
    /// Own segment number, checked on open.
    pub seg_num: SegNum,
    /// Previous segment in the shared list.
    pub prev_seg_num: AtomicI64,
    /// Next segment in the shared list.
    pub next_seg_num: AtomicI64,
    /// Processes holding a live value materialized from this segment.
    pub procs_using: AtomicCounter,
    /// Processes holding a mapping. Flag: unlink in progress. Post: unlink done.
    pub procs_tracking: AtomicCounter,
    /// Non-zero while not reachable from the shared list.
    pub is_invalid: AtomicU32,
    /// Non-zero if exempt from garbage collection.
    pub is_persistent: AtomicU32,
    /// Last process to change the links.
    pub update_pid: AtomicU32,
    /// Length of `key`; 0 for unkeyed segments.
    pub key_len: u32,
    /// Optional user key, UTF-8.
    pub key: [u8; MAX_KEY_LEN + 1],
    _reserved: [u8; 16],
}

const_assert_eq!(std::mem::size_of::<SegmentMetadata>(), 128);

/// Bytes in front of the payload.
pub const SEGMENT_HEADER_SIZE: usize = std::mem::size_of::<SegmentMetadata>();

impl SegmentMetadata {
    /// Whether the segment is currently out of the shared list.
    pub fn is_invalid(&self) -> bool {
        self.is_invalid.load(Ordering::Acquire) != 0
    }

    /// Whether the segment is exempt from garbage collection.
    pub fn is_persistent(&self) -> bool {
        self.is_persistent.load(Ordering::Acquire) != 0
    }

    /// Previous link.
    pub fn prev(&self) -> SegNum {
        self.prev_seg_num.load(Ordering::Acquire)
    }

    /// Next link.
    pub fn next(&self) -> SegNum {
        self.next_seg_num.load(Ordering::Acquire)
    }

    /// Segment key, if any.
    pub fn key(&self) -> Option<&str> {
        let len = (self.key_len as usize).min(MAX_KEY_LEN);
        if len == 0 {
            return None;
        }
        std::str::from_utf8(&self.key[..len]).ok()
    }
}

/// Next segment number after `seg_num`, wrapping to 0 past the maximum.
pub fn next_seg_num(seg_num: SegNum) -> SegNum {
    if seg_num >= MAX_SEG_NUM || seg_num < 0 {
        0
    } else {
        seg_num + 1
    }
}

/// Parameters of a new segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpec<'a> {
    /// Object name prefix of the domain.
    pub prefix: &'a str,
    /// First number to try.
    pub start: SegNum,
    /// Payload bytes.
    pub payload_size: usize,
    /// Optional key.
    pub key: Option<&'a str>,
    /// Exempt from garbage collection.
    pub persistent: bool,
    /// Permission bits of the object.
    pub permissions: u32,
}

/// One mapped segment.
pub struct SharedSegment {
    seg_num: SegNum,
    name: String,
    mmap: ManuallyDrop<MmapMut>,
    released: bool,
    leaked: bool,
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("seg_num", &self.seg_num)
            .field("name", &self.name)
            .field("data_size", &self.header().data_size)
            .finish()
    }
}

impl SharedSegment {
    /// Create and map a new, not yet linked segment.
    ///
    /// Numbers are tried from `spec.start` upwards until an exclusive create
    /// succeeds. The segment starts invalid with this process tracking it.
    pub fn create(spec: &SegmentSpec<'_>) -> ArenaResult<Self> {
        if let Some(key) = spec.key
            && key.len() > MAX_KEY_LEN
        {
            return Err(ArenaError::KeyTooLong {
                key: key.to_string(),
                max: MAX_KEY_LEN,
            });
        }

        let total = SEGMENT_HEADER_SIZE + spec.payload_size;
        let mut seg_num = if spec.start < 0 { 0 } else { spec.start };
        let first_try = seg_num;
        let (name, file) = loop {
            let name = segment_object_name(spec.prefix, seg_num);
            if let Some(file) = platform::shm_create_exclusive(&name, total, spec.permissions)? {
                break (name, file);
            }
            warn!("Segment name {} taken, trying next number", name);
            seg_num = next_seg_num(seg_num);
            if seg_num == first_try {
                return Err(ArenaError::NumberSpaceExhausted);
            }
        };

        let mut mmap = match platform::map_shared(&file, total) {
            Ok(mmap) => mmap,
            Err(e) => {
                if let Err(remove_err) = platform::shm_remove(&name) {
                    warn!("Failed to remove unmappable segment {}: {}", name, remove_err);
                }
                return Err(e);
            }
        };

        let mut key = [0u8; MAX_KEY_LEN + 1];
        let key_len = spec.key.map_or(0, |k| {
            key[..k.len()].copy_from_slice(k.as_bytes());
            k.len()
        });
        let metadata = SegmentMetadata {
            data_size: spec.payload_size as u64,
            seg_num,
            prev_seg_num: AtomicI64::new(SEG_NUM_NONE),
            next_seg_num: AtomicI64::new(SEG_NUM_NONE),
            procs_using: AtomicCounter::new(0, false, false),
            procs_tracking: AtomicCounter::new(1, false, false),
            is_invalid: AtomicU32::new(1),
            is_persistent: AtomicU32::new(spec.persistent as u32),
            update_pid: AtomicU32::new(platform::get_current_pid()),
            key_len: key_len as u32,
            key,
            _reserved: [0; 16],
        };
        // SAFETY: the mapping is page aligned, at least header sized and not
        // yet visible to any other process.
        unsafe { std::ptr::write(mmap.as_mut_ptr() as *mut SegmentMetadata, metadata) };

        debug!("Created segment {} ({} payload bytes)", name, spec.payload_size);
        Ok(Self {
            seg_num,
            name,
            mmap: ManuallyDrop::new(mmap),
            released: false,
            leaked: false,
        })
    }

    /// Map an existing segment by number and start tracking it.
    ///
    /// If the segment's final unlink is in flight, waits for it to finish
    /// and retries, which then reports the segment as missing.
    pub fn open(prefix: &str, seg_num: SegNum, spin_timeout: Option<Duration>) -> ArenaResult<Self> {
        let name = segment_object_name(prefix, seg_num);
        loop {
            let file = platform::shm_open_existing(&name)?.ok_or_else(|| {
                ArenaError::SegmentMissing { name: name.clone() }
            })?;
            let len = platform::object_len(&file)?;
            if len < SEGMENT_HEADER_SIZE {
                return Err(ArenaError::corruption(format!(
                    "segment {name} is {len} bytes, smaller than its header"
                )));
            }
            let mmap = platform::map_shared(&file, len)?;
            let segment = Self {
                seg_num,
                name: name.clone(),
                mmap: ManuallyDrop::new(mmap),
                // Not tracking yet; dropping must not decrement.
                released: true,
                leaked: false,
            };

            let header = segment.header();
            if header.seg_num != seg_num
                || (header.data_size as usize).saturating_add(SEGMENT_HEADER_SIZE) > len
            {
                return Err(ArenaError::corruption(format!(
                    "segment {name} header does not match its object"
                )));
            }

            let tracking = header.procs_tracking.increment();
            if !tracking.flag() {
                let mut segment = segment;
                segment.released = false;
                return Ok(segment);
            }

            debug!("Segment {} is being unlinked, waiting", name);
            let mut spin = SpinWait::new("segment unlink", spin_timeout);
            while !header.procs_tracking.load().post() {
                spin.spin()?;
            }
            drop(segment);
        }
    }

    /// Segment number.
    pub fn seg_num(&self) -> SegNum {
        self.seg_num
    }

    /// OS object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared header.
    pub fn header(&self) -> &SegmentMetadata {
        // SAFETY: the mapping is page aligned and at least header sized
        // (checked in create/open); all mutable fields are atomics.
        unsafe { &*(self.mmap.as_ptr() as *const SegmentMetadata) }
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        let size = self.header().data_size as usize;
        &self.mmap[SEGMENT_HEADER_SIZE..SEGMENT_HEADER_SIZE + size]
    }

    /// Mutable payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let size = self.header().data_size as usize;
        &mut self.mmap[SEGMENT_HEADER_SIZE..SEGMENT_HEADER_SIZE + size]
    }

    /// Snapshot of the tracking counter.
    pub fn tracking(&self) -> CounterSnapshot {
        self.header().procs_tracking.load()
    }

    /// Stop tracking, unmap, and remove the OS object if this was the last
    /// tracker of an invalidated segment.
    pub fn detach_locally(mut self) -> ArenaResult<()> {
        self.release()
    }

    /// Forget this segment without touching shared counters, keeping the
    /// memory mapped for the rest of the process lifetime.
    ///
    /// Used when a value that aliases this segment cannot be detached.
    pub fn leak(mut self) {
        self.released = true;
        self.leaked = true;
    }

    fn release(&mut self) -> ArenaResult<()> {
        let seen_invalid = self.header().is_invalid();
        self.release_seen(seen_invalid)
    }

    /// Drop this process's tracking, with the invalid bit as read by the
    /// caller. The bit may be set by another process right after that read,
    /// so it is checked again once the count is down: whoever then finds no
    /// trackers left removes the object.
    fn release_seen(&mut self, seen_invalid: bool) -> ArenaResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let header = self.header();
        let counter = &header.procs_tracking;
        let responsible =
            counter.decrement(seen_invalid) || (header.is_invalid() && counter.claim_if_unused());
        if responsible {
            let removed = platform::shm_remove(&self.name);
            header.procs_tracking.set_post(true);
            if removed? {
                debug!("Removed segment object {}", self.name);
            }
        }
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("Failed to detach segment {}: {}", self.name, e);
        }
        if !self.leaked {
            // SAFETY: dropped exactly once, here.
            unsafe { ManuallyDrop::drop(&mut self.mmap) };
        }
    }
}
