//! Values this process has materialized from shared segments.
//!
//! A fetched value aliases segment memory, so it is handed out as a
//! [`ValueHandle`]: shared ownership of a lock around the value. The tracker
//! keeps one handle per segment; every other live handle is a client
//! cross-reference. Once none are left the variable can be detached and its
//! use of the segment dropped.

use crate::client::ClientValue;
use crate::codec;
use crate::error::{ArenaError, ArenaResult};
use crate::segment::SharedSegment;
use arena::consts::SegNum;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Shared handle to a fetched value.
///
/// Read access only: the value may alias shared memory, and the arena must be
/// able to swap its storage for a local copy before that memory goes away.
#[derive(Debug)]
pub struct ValueHandle<V>(Arc<RwLock<V>>);

impl<V> Clone for ValueHandle<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V> ValueHandle<V> {
    fn new(value: V) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Borrow the value.
    pub fn read(&self) -> RwLockReadGuard<'_, V> {
        self.0.read()
    }

    /// True if both handles refer to the same variable.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<V: ClientValue> ValueHandle<V> {
    /// Independent local copy of the value.
    pub fn duplicate(&self) -> V {
        self.0.read().duplicate()
    }
}

/// A segment number and the variable materialized from it.
#[derive(Debug)]
pub struct VariableNode<V> {
    seg_num: SegNum,
    handle: ValueHandle<V>,
}

impl<V: ClientValue> VariableNode<V> {
    /// Segment backing the variable.
    pub fn seg_num(&self) -> SegNum {
        self.seg_num
    }

    /// Handles held outside the tracker.
    pub fn cross_references(&self) -> usize {
        self.handle.strong_count().saturating_sub(1)
    }

    /// Swap the value's storage for local storage, ending its aliasing of
    /// segment memory.
    ///
    /// # Errors
    ///
    /// [`ArenaError::ValueBorrowed`] while any handle has an outstanding
    /// read guard.
    pub fn detach(&self) -> ArenaResult<()> {
        let mut value = self.handle.0.try_write().ok_or(ArenaError::ValueBorrowed {
            seg_num: self.seg_num,
        })?;
        codec::detach(&mut *value);
        Ok(())
    }
}

/// Per-process table of variables, one per segment.
#[derive(Debug)]
pub struct VariableTracker<V> {
    variables: HashMap<SegNum, VariableNode<V>>,
}

impl<V> Default for VariableTracker<V> {
    fn default() -> Self {
        Self {
            variables: HashMap::new(),
        }
    }
}

impl<V: ClientValue> VariableTracker<V> {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize the payload of `segment` and start using it.
    ///
    /// The caller must keep `segment` mapped until the variable is destroyed
    /// or detached.
    pub fn create_from_segment(&mut self, segment: &SharedSegment) -> ArenaResult<ValueHandle<V>> {
        let seg_num = segment.seg_num();
        if self.variables.contains_key(&seg_num) {
            return Err(ArenaError::AlreadyTracked { seg_num });
        }
        // SAFETY: the arena unmaps a segment only after detaching its
        // variable, or leaks the mapping.
        let value = unsafe { codec::materialize::<V>(segment.payload())? };
        let using = segment.header().procs_using.increment();
        debug!("Materialized segment {} ({} users)", seg_num, using.count());

        let handle = ValueHandle::new(value);
        self.variables.insert(
            seg_num,
            VariableNode {
                seg_num,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    /// New handle to the variable of `seg_num`.
    pub fn get(&self, seg_num: SegNum) -> Option<ValueHandle<V>> {
        self.variables.get(&seg_num).map(|n| n.handle.clone())
    }

    /// Exclusive access to the variable of `seg_num`, or `None` if this
    /// process tracks none.
    ///
    /// # Errors
    ///
    /// [`ArenaError::ValueBorrowed`] while a read guard is outstanding.
    pub fn try_write(&self, seg_num: SegNum) -> ArenaResult<Option<RwLockWriteGuard<'_, V>>> {
        match self.variables.get(&seg_num) {
            None => Ok(None),
            Some(node) => node
                .handle
                .0
                .try_write()
                .map(Some)
                .ok_or(ArenaError::ValueBorrowed { seg_num }),
        }
    }

    /// Whether `seg_num` has a variable.
    pub fn contains(&self, seg_num: SegNum) -> bool {
        self.variables.contains_key(&seg_num)
    }

    /// Client handles alive for `seg_num`.
    pub fn cross_references(&self, seg_num: SegNum) -> Option<usize> {
        self.variables.get(&seg_num).map(VariableNode::cross_references)
    }

    /// Segments whose variable has no client handle left, ascending.
    pub fn orphaned(&self) -> Vec<SegNum> {
        let mut out: Vec<SegNum> = self
            .variables
            .values()
            .filter(|n| n.cross_references() == 0)
            .map(|n| n.seg_num)
            .collect();
        out.sort_unstable();
        out
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// True if no variable is tracked.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Detach and drop the variable of `seg_num`, then drop this process's
    /// use of `segment`.
    ///
    /// Returns `true` if no process uses the segment any more. A borrowed
    /// value stays tracked and the error is returned.
    pub fn destroy(&mut self, seg_num: SegNum, segment: &SharedSegment) -> ArenaResult<bool> {
        let node = self
            .variables
            .remove(&seg_num)
            .ok_or(ArenaError::NotTracked { seg_num })?;
        if let Err(e) = node.detach() {
            self.variables.insert(seg_num, node);
            return Err(e);
        }
        let refs = node.cross_references();
        drop(node);

        let using = segment.header().procs_using.release();
        debug!(
            "Destroyed variable of segment {} ({} client handles detached, {} users left)",
            seg_num,
            refs,
            using.count()
        );
        Ok(using.count() == 0)
    }

    /// Segment numbers of every variable, ascending.
    pub fn seg_nums(&self) -> Vec<SegNum> {
        let mut out: Vec<SegNum> = self.variables.keys().copied().collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentSpec;
    use crate::value::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(0);

    fn segment_with(value: &Value) -> SharedSegment {
        let prefix = format!(
            "arena_trk_{}_{}_",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let mut segment = SharedSegment::create(&SegmentSpec {
            prefix: &prefix,
            start: 0,
            payload_size: codec::compute_size(value).unwrap(),
            key: None,
            persistent: false,
            permissions: 0o600,
        })
        .unwrap();
        codec::copy_into(segment.payload_mut(), value).unwrap();
        segment
    }

    #[test]
    fn test_create_counts_use() {
        let value = Value::numeric(&[1, 3], &[1.0f64, 2.0, 3.0]).unwrap();
        let segment = segment_with(&value);
        let mut tracker = VariableTracker::<Value>::new();

        let handle = tracker.create_from_segment(&segment).unwrap();
        assert_eq!(*handle.read(), value);
        assert!(handle.read().is_mapped());
        assert_eq!(segment.header().procs_using.load().count(), 1);
        assert_eq!(tracker.cross_references(segment.seg_num()), Some(1));

        let err = tracker.create_from_segment(&segment).unwrap_err();
        assert!(matches!(err, ArenaError::AlreadyTracked { .. }));

        drop(handle);
        assert_eq!(tracker.orphaned(), vec![segment.seg_num()]);
        assert!(tracker.destroy(segment.seg_num(), &segment).unwrap());
        assert_eq!(segment.header().procs_using.load().count(), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_destroy_detaches_live_handles() {
        let value = Value::text("shared");
        let segment = segment_with(&value);
        let mut tracker = VariableTracker::<Value>::new();
        let handle = tracker.create_from_segment(&segment).unwrap();
        let copy = handle.duplicate();

        tracker.destroy(segment.seg_num(), &segment).unwrap();
        assert!(!handle.read().is_mapped());
        assert_eq!(handle.read().to_text().as_deref(), Some(""));
        assert_eq!(copy.to_text().as_deref(), Some("shared"));
    }

    #[test]
    fn test_borrowed_value_stays_tracked() {
        let value = Value::scalar(4.0);
        let segment = segment_with(&value);
        let mut tracker = VariableTracker::<Value>::new();
        let handle = tracker.create_from_segment(&segment).unwrap();

        let guard = handle.read();
        let err = tracker.destroy(segment.seg_num(), &segment).unwrap_err();
        assert!(matches!(err, ArenaError::ValueBorrowed { .. }));
        assert!(tracker.contains(segment.seg_num()));
        assert_eq!(segment.header().procs_using.load().count(), 1);
        drop(guard);

        assert!(tracker.destroy(segment.seg_num(), &segment).unwrap());
    }

    #[test]
    fn test_handles_share_one_variable() {
        let segment = segment_with(&Value::scalar(1.0));
        let mut tracker = VariableTracker::<Value>::new();
        let a = tracker.create_from_segment(&segment).unwrap();
        let b = tracker.get(segment.seg_num()).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(tracker.cross_references(segment.seg_num()), Some(2));
        assert!(tracker.orphaned().is_empty());
        drop(a);
        drop(b);
        tracker.destroy(segment.seg_num(), &segment).unwrap();
    }
}
