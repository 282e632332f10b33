//! Host-facing facade. `Heap` wires together every entity module into the
//! operations an embedder actually calls: allocate, load, store, root
//! management, and cycle control. A single concrete type, since this crate
//! implements exactly one collector design rather than a family of them.

use std::sync::Arc;

use crate::body::Body;
use crate::collector::{Collector, CollectorShared, CycleKind, HeapConfig};
use crate::color::BodyPtr;
use crate::error::{GcError, GcResult};
use crate::handle::{Generation, Handle};
use crate::mutator::MutatorCache;
use crate::slot::Slot;

pub struct Heap {
    shared: Arc<CollectorShared>,
    collector: parking_lot::Mutex<Option<Collector>>,
    heap_id: usize,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Heap {
        let shared = Arc::new(CollectorShared::new(config));
        let heap_id = Arc::as_ptr(&shared) as usize;
        for _ in 0..config.min_heap_pages {
            shared.new_page(Generation::Young);
        }
        Heap {
            shared,
            collector: parking_lot::Mutex::new(None),
            heap_id,
        }
    }

    /// Starts the background collector thread. Idempotent: calling it
    /// while already running is a no-op.
    pub fn start_gc(&self) {
        let mut collector = self.collector.lock();
        if collector.is_none() {
            *collector = Some(Collector::spawn(self.shared.clone()));
        }
    }

    /// Stops and joins the background collector thread, if running, and
    /// permanently gates `allocate`/`load`/`store` so they return
    /// `GcError::ShutdownInProgress` from this point on.
    pub fn stop_gc(&self) {
        self.collector.lock().take();
        self.shared.mark_shutdown();
    }

    fn check_live(&self) -> GcResult<()> {
        if self.shared.is_shutdown() {
            Err(GcError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }

    /// Allocates a fresh Body with `slot_count` slots in `generation` and
    /// returns a Handle to it. Bump-allocates on the calling thread's
    /// cached active page, falling back to a freshly reserved page on
    /// exhaustion. If the heap is momentarily out of pages, runs one
    /// synchronous assist cycle and retries once before giving up with
    /// `GcError::AllocationFailure`.
    pub fn allocate(&self, slot_count: usize, generation: Generation) -> GcResult<Handle> {
        self.check_live()?;
        let size = Body::layout_size(slot_count);

        if let Some(offset) = self.try_bump(generation, size) {
            return Ok(self.finish_allocate(offset, slot_count, generation));
        }

        log::warn!("allocation stalled for {size} bytes, running synchronous assist cycle");
        self.shared.run_cycle(CycleKind::Major);

        match self.try_bump(generation, size) {
            Some(offset) => Ok(self.finish_allocate(offset, slot_count, generation)),
            None => Err(GcError::AllocationFailure),
        }
    }

    fn try_bump(&self, generation: Generation, size: usize) -> Option<usize> {
        let shared = &self.shared;
        MutatorCache::alloc(self.heap_id, generation, size, |prev, generation| {
            if let Some(prev) = prev {
                unsafe { (*prev).retire() };
            }
            shared.try_new_page(generation)
        })
        .map(|(_, offset)| offset)
    }

    fn finish_allocate(&self, offset: usize, slot_count: usize, generation: Generation) -> Handle {
        unsafe { Body::init(offset as *mut u8, slot_count) };
        let body = BodyPtr::new(offset, self.shared.colors.good_color());
        self.shared.handles.new_handle(body, generation)
    }

    /// Load barrier entry point: resolves the handle's current Body,
    /// self-healing it, then reads slot `index`.
    pub fn load(&self, handle: Handle, index: usize) -> GcResult<Slot> {
        self.check_live()?;
        let resolved = self.shared.barrier().load(handle);
        let body = resolved.as_ptr().cast::<Body>();
        let len = unsafe { (*body).header.slot_count() };
        if index >= len {
            return Err(GcError::InvalidSlot { index, len });
        }
        let raw = unsafe { *Body::slot(body, index) };
        Ok(raw.decode())
    }

    /// Store barrier entry point.
    pub fn store(&self, handle: Handle, index: usize, value: Slot) -> GcResult<()> {
        self.check_live()?;
        let resolved = self.shared.barrier().load(handle);
        let body = resolved.as_ptr().cast::<Body>();
        let len = unsafe { (*body).header.slot_count() };
        if index >= len {
            return Err(GcError::InvalidSlot { index, len });
        }
        unsafe {
            let slot = Body::slot(body, index);
            self.shared.barrier().store(handle, slot, value);
        }
        Ok(())
    }

    pub fn add_root(&self, handle: Handle) {
        self.shared.root_set.add(handle);
    }

    pub fn remove_root(&self, handle: Handle) {
        self.shared.root_set.remove(handle);
    }

    /// Synchronous young-generation collection. Runs on the calling
    /// thread; does not require `start_gc` to have been called.
    pub fn minor_gc(&self) {
        self.shared.run_cycle(CycleKind::Minor);
    }

    /// Synchronous full-heap collection.
    pub fn major_gc(&self) {
        self.shared.run_cycle(CycleKind::Major);
    }

    pub fn is_marked(&self, handle: Handle) -> bool {
        handle.is_marked_reachable()
    }

    pub fn get_body_address(&self, handle: Handle) -> usize {
        handle.load_body_raw().address()
    }

    pub fn live_handle_count(&self) -> usize {
        self.shared.handles.live_count()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.stop_gc();
        MutatorCache::reset(self.heap_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_store_and_load_roundtrip() {
        let heap = Heap::new(HeapConfig::default());
        let a = heap.allocate(1, Generation::Young).unwrap();
        let b = heap.allocate(0, Generation::Young).unwrap();
        heap.add_root(a);
        heap.store(a, 0, Slot::Ref(b)).unwrap();
        match heap.load(a, 0).unwrap() {
            Slot::Ref(h) => assert_eq!(h, b),
            _ => panic!("expected ref slot"),
        }
    }

    #[test]
    fn out_of_bounds_slot_is_rejected() {
        let heap = Heap::new(HeapConfig::default());
        let a = heap.allocate(1, Generation::Young).unwrap();
        assert!(matches!(heap.load(a, 5), Err(GcError::InvalidSlot { .. })));
    }

    #[test]
    fn minor_gc_collects_unreferenced_handle() {
        let heap = Heap::new(HeapConfig::default());
        let a = heap.allocate(0, Generation::Young).unwrap();
        assert!(a.decref());
        heap.minor_gc();
        assert_eq!(heap.live_handle_count(), 0);
    }

    #[test]
    fn major_gc_promotes_survivor_once_the_configured_threshold_is_crossed() {
        let mut config = HeapConfig::default();
        config.tenure_threshold = 1;
        let heap = Heap::new(config);
        let a = heap.allocate(0, Generation::Young).unwrap();
        heap.add_root(a);
        heap.major_gc();
        assert_eq!(a.generation(), Generation::Old);
    }

    #[test]
    fn allocate_after_shutdown_is_rejected() {
        let heap = Heap::new(HeapConfig::default());
        heap.stop_gc();
        assert!(matches!(heap.allocate(1, Generation::Young), Err(GcError::ShutdownInProgress)));
    }

    #[test]
    fn load_and_store_after_shutdown_are_rejected() {
        let heap = Heap::new(HeapConfig::default());
        let a = heap.allocate(1, Generation::Young).unwrap();
        heap.stop_gc();
        assert!(matches!(heap.load(a, 0), Err(GcError::ShutdownInProgress)));
        assert!(matches!(heap.store(a, 0, Slot::Foreign(1)), Err(GcError::ShutdownInProgress)));
    }
}
