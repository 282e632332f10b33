//! Handle entity: an immovable identity pointing at a movable
//! [`crate::body::Body`]. The pointee can move under the holder without
//! invalidating the `Handle` itself; only the tagged body pointer it stores
//! changes.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::color::BodyPtr;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Generation {
    Young = 0,
    Old = 1,
}

/// The heap-resident, never-relocated state behind a [`Handle`].
pub struct HandleInner {
    /// Tagged pointer to the current Body. Updated in place by the load
    /// barrier's self-healing step.
    pub(crate) body: AtomicUsize,
    pub(crate) generation: AtomicU8,
    /// Host-visible reference count; a Handle is destructible only once
    /// this reaches zero *and* `collector_reachable` is false.
    host_refcount: AtomicUsize,
    collector_reachable: AtomicBool,
    /// Set once destruction's `on_handle_destroyed` callback has fired, so
    /// it is invoked at most once even if both lifetime conditions settle
    /// concurrently.
    destroyed: AtomicBool,
}

impl HandleInner {
    fn new(body: BodyPtr, generation: Generation) -> Self {
        HandleInner {
            body: AtomicUsize::new(body.0),
            generation: AtomicU8::new(generation as u8),
            host_refcount: AtomicUsize::new(1),
            collector_reachable: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
        }
    }
}

/// A shared, `Copy`-able reference to a [`HandleInner`]. Handles are never
/// relocated; only the Body they point at moves.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Handle {
    raw: *mut HandleInner,
}

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({:p})", self.raw)
    }
}

impl Handle {
    /// # Safety
    /// `raw` must have been produced by [`Handle::as_raw`] on a Handle that
    /// is still alive.
    pub unsafe fn from_raw(raw: *mut HandleInner) -> Handle {
        Handle { raw }
    }

    #[inline]
    pub fn as_raw(self) -> *mut HandleInner {
        self.raw
    }

    #[inline]
    pub(crate) fn inner(self) -> &'static HandleInner {
        unsafe { &*self.raw }
    }

    #[inline]
    pub fn load_body_raw(self) -> BodyPtr {
        BodyPtr(self.inner().body.load(Ordering::Acquire))
    }

    /// Self-healing write-back used by the load barrier after fixing a
    /// stale pointer.
    #[inline]
    pub(crate) fn heal_body(self, fixed: BodyPtr) {
        self.inner().body.store(fixed.0, Ordering::Release);
    }

    #[inline]
    pub fn generation(self) -> Generation {
        match self.inner().generation.load(Ordering::Acquire) {
            1 => Generation::Old,
            _ => Generation::Young,
        }
    }

    #[inline]
    pub(crate) fn set_generation(self, generation: Generation) {
        self.inner().generation.store(generation as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_marked_reachable(self) -> bool {
        self.inner().collector_reachable.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_collector_reachable(self, reachable: bool) {
        self.inner().collector_reachable.store(reachable, Ordering::Release);
    }

    /// Registers an additional host-side owner of this handle. Public: the
    /// embedding runtime calls this directly whenever it duplicates a
    /// reference.
    #[inline]
    pub fn incref(self) {
        self.inner().host_refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one host-side ownership of this handle. Returns `true` if
    /// the host refcount reached zero (the handle may now become
    /// destructible, pending the collector's independent reachability
    /// verdict).
    #[inline]
    pub fn decref(self) -> bool {
        self.inner().host_refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[inline]
    fn host_refcount(self) -> usize {
        self.inner().host_refcount.load(Ordering::Acquire)
    }

    /// `true` once both lifetime conditions have settled: no host
    /// references remain and the collector has independently determined
    /// the handle unreachable.
    #[inline]
    pub(crate) fn is_destructible(self) -> bool {
        self.host_refcount() == 0 && !self.is_marked_reachable()
    }

    #[inline]
    pub(crate) fn try_mark_destroyed(self) -> bool {
        self.inner()
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Small-object pool for [`HandleInner`] allocations. Handles are never
/// relocated, so this is a plain free-list over leaked, pointer-stable
/// storage rather than a bump page.
pub struct HandlePool {
    free: Mutex<Vec<*mut HandleInner>>,
    /// Every live handle, scanned by the collector at sweep time to decide
    /// which handles have become destructible.
    table: Mutex<Vec<*mut HandleInner>>,
    live_count: AtomicUsize,
}

unsafe impl Send for HandlePool {}
unsafe impl Sync for HandlePool {}

impl HandlePool {
    pub fn new() -> Self {
        HandlePool {
            free: Mutex::new(Vec::new()),
            table: Mutex::new(Vec::new()),
            live_count: AtomicUsize::new(0),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live_count.load(Ordering::Relaxed)
    }

    pub fn new_handle(&self, body: BodyPtr, generation: Generation) -> Handle {
        let mut free = self.free.lock();
        let raw = if let Some(recycled) = free.pop() {
            unsafe {
                recycled.write(HandleInner::new(body, generation));
            }
            recycled
        } else {
            drop(free);
            Box::into_raw(Box::new(HandleInner::new(body, generation)))
        };
        self.table.lock().push(raw);
        self.live_count.fetch_add(1, Ordering::Relaxed);
        Handle { raw }
    }

    /// Snapshot of every handle currently in the table, taken under a short
    /// lock. Used by the collector's sweep step; entries recycled mid-sweep
    /// are simply skipped on the next cycle.
    pub fn snapshot(&self) -> Vec<Handle> {
        self.table.lock().iter().map(|&raw| Handle { raw }).collect()
    }

    /// Returns the slot to the free list for reuse and drops it from the
    /// table. Called once a Handle's `is_destructible` condition is
    /// confirmed; the caller is responsible for having already invoked
    /// `on_handle_destroyed`.
    pub(crate) fn recycle(&self, handle: Handle) {
        self.table.lock().retain(|&raw| raw != handle.raw);
        self.free.lock().push(handle.raw);
        self.live_count.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for HandlePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handle_has_refcount_one_and_is_reachable() {
        let pool = HandlePool::new();
        let h = pool.new_handle(BodyPtr::new(0x1000, crate::color::Color::M0), Generation::Young);
        assert!(h.is_marked_reachable());
        assert!(!h.is_destructible());
        assert!(h.decref());
        assert!(h.is_destructible());
    }

    #[test]
    fn heal_body_updates_in_place() {
        let pool = HandlePool::new();
        let h = pool.new_handle(BodyPtr::new(0x1000, crate::color::Color::M0), Generation::Young);
        h.heal_body(BodyPtr::new(0x2000, crate::color::Color::M0));
        assert_eq!(h.load_body_raw().address(), 0x2000);
    }
}
