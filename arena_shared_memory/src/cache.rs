//! Process-local view of the shared list.
//!
//! Segments this process has mapped, keyed by segment number, with a local
//! order kept in explicit `local_prev`/`local_next` numbers. The local links
//! are never the shared ones: after a full resync they agree with the shared
//! order, between resyncs they may lag.

use crate::error::{ArenaError, ArenaResult};
use crate::segment::SharedSegment;
use arena::consts::{SEG_NUM_NONE, SegNum};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A cached segment and its local position.
#[derive(Debug)]
pub struct SegmentNode {
    segment: SharedSegment,
    local_prev: SegNum,
    local_next: SegNum,
}

impl SegmentNode {
    /// The mapped segment.
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }
}

/// Hash table plus local list of mapped segments.
#[derive(Debug)]
pub struct LocalSegmentCache {
    prefix: String,
    nodes: HashMap<SegNum, SegmentNode>,
    keys: HashMap<String, SegNum>,
    head: SegNum,
    tail: SegNum,
    rev_num: u64,
}

impl LocalSegmentCache {
    /// Empty cache for the domain with object prefix `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            nodes: HashMap::new(),
            keys: HashMap::new(),
            head: SEG_NUM_NONE,
            tail: SEG_NUM_NONE,
            rev_num: 0,
        }
    }

    /// Object name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Directory revision of the last full resync; 0 if never synced.
    pub fn rev_num(&self) -> u64 {
        self.rev_num
    }

    /// Record the revision the cache now mirrors.
    pub fn set_rev_num(&mut self, rev_num: u64) {
        self.rev_num = rev_num;
    }

    /// Number of cached segments.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `seg_num` is cached.
    pub fn contains(&self, seg_num: SegNum) -> bool {
        self.nodes.contains_key(&seg_num)
    }

    /// Cached segment.
    pub fn get(&self, seg_num: SegNum) -> Option<&SharedSegment> {
        self.nodes.get(&seg_num).map(|n| &n.segment)
    }

    /// Cached segment, mutable.
    pub fn get_mut(&mut self, seg_num: SegNum) -> Option<&mut SharedSegment> {
        self.nodes.get_mut(&seg_num).map(|n| &mut n.segment)
    }

    /// Cached segment or an error naming it.
    pub fn require(&self, seg_num: SegNum) -> ArenaResult<&SharedSegment> {
        self.get(seg_num).ok_or(ArenaError::NotTracked { seg_num })
    }

    /// Cached segment, mapping it first if needed.
    pub fn get_or_open(
        &mut self,
        seg_num: SegNum,
        spin_timeout: Option<Duration>,
    ) -> ArenaResult<&SharedSegment> {
        if !self.contains(seg_num) {
            let segment = SharedSegment::open(&self.prefix, seg_num, spin_timeout)?;
            self.insert(segment)?;
        }
        self.require(seg_num)
    }

    /// Append a segment at the local tail.
    pub fn insert(&mut self, segment: SharedSegment) -> ArenaResult<()> {
        let seg_num = segment.seg_num();
        if self.nodes.contains_key(&seg_num) {
            return Err(ArenaError::AlreadyTracked { seg_num });
        }
        if let Some(key) = segment.header().key() {
            self.keys.insert(key.to_string(), seg_num);
        }
        self.nodes.insert(
            seg_num,
            SegmentNode {
                segment,
                local_prev: SEG_NUM_NONE,
                local_next: SEG_NUM_NONE,
            },
        );
        self.link_tail(seg_num);
        Ok(())
    }

    /// Move a cached segment to the local tail.
    pub fn move_to_tail(&mut self, seg_num: SegNum) {
        if self.tail == seg_num || !self.contains(seg_num) {
            return;
        }
        self.unlink_local(seg_num);
        self.link_tail(seg_num);
    }

    /// Drop a segment from the cache, handing it back to the caller.
    pub fn remove(&mut self, seg_num: SegNum) -> Option<SharedSegment> {
        if !self.contains(seg_num) {
            return None;
        }
        self.unlink_local(seg_num);
        let node = self.nodes.remove(&seg_num)?;
        if let Some(key) = node.segment.header().key()
            && self.keys.get(key) == Some(&seg_num)
        {
            self.keys.remove(key);
        }
        Some(node.segment)
    }

    /// Remove every segment not in `keep`, returning them in local order.
    pub fn retain(&mut self, keep: &HashSet<SegNum>) -> Vec<SharedSegment> {
        let stale: Vec<SegNum> = self
            .order()
            .into_iter()
            .filter(|n| !keep.contains(n))
            .collect();
        stale.into_iter().filter_map(|n| self.remove(n)).collect()
    }

    /// Remove everything, in local order.
    pub fn drain(&mut self) -> Vec<SharedSegment> {
        self.retain(&HashSet::new())
    }

    /// Segment carrying `key`.
    pub fn find_key(&self, key: &str) -> Option<SegNum> {
        self.keys.get(key).copied()
    }

    /// Local tail.
    pub fn latest(&self) -> Option<SegNum> {
        (self.tail != SEG_NUM_NONE).then_some(self.tail)
    }

    /// Segment numbers from head to tail.
    pub fn order(&self) -> Vec<SegNum> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head;
        while cursor != SEG_NUM_NONE {
            out.push(cursor);
            cursor = self
                .nodes
                .get(&cursor)
                .map_or(SEG_NUM_NONE, |n| n.local_next);
        }
        out
    }

    fn link_tail(&mut self, seg_num: SegNum) {
        let old_tail = self.tail;
        if let Some(node) = self.nodes.get_mut(&seg_num) {
            node.local_prev = old_tail;
            node.local_next = SEG_NUM_NONE;
        }
        match self.nodes.get_mut(&old_tail) {
            Some(prev) => prev.local_next = seg_num,
            None => self.head = seg_num,
        }
        self.tail = seg_num;
    }

    fn unlink_local(&mut self, seg_num: SegNum) {
        let Some(node) = self.nodes.get(&seg_num) else {
            return;
        };
        let (prev, next) = (node.local_prev, node.local_next);
        match self.nodes.get_mut(&prev) {
            Some(p) => p.local_next = next,
            None => self.head = next,
        }
        match self.nodes.get_mut(&next) {
            Some(n) => n.local_prev = prev,
            None => self.tail = prev,
        }
        if let Some(node) = self.nodes.get_mut(&seg_num) {
            node.local_prev = SEG_NUM_NONE;
            node.local_next = SEG_NUM_NONE;
        }
    }
}
