//! Per-thread active page cache: each mutator thread remembers the last
//! page it successfully bumped into, per generation, so the common
//! allocation path never touches a shared lock. A thread claims a whole
//! [`crate::page::Page`] directly rather than a sub-allocated buffer within
//! one, since pages already support wait-free concurrent bump allocation
//! via CAS.

use std::cell::Cell;

use crate::handle::Generation;
use crate::page::Page;

thread_local! {
    static ACTIVE: std::cell::RefCell<Vec<(usize, ActivePages)>> =
        const { std::cell::RefCell::new(Vec::new()) };
}

struct ActivePages {
    young: Cell<*mut Page>,
    old: Cell<*mut Page>,
}

impl ActivePages {
    fn slot(&self, generation: Generation) -> &Cell<*mut Page> {
        match generation {
            Generation::Young => &self.young,
            Generation::Old => &self.old,
        }
    }
}

/// Thread-local front end for bump allocation. Stateless itself; all state
/// lives in the thread-local cache keyed by `heap_id` (a heap's address),
/// mirroring the keying scheme `safepoint::BarrierScheduler` uses for ack
/// slots.
pub struct MutatorCache;

impl MutatorCache {
    /// Allocates `size` bytes from the calling thread's cached active page
    /// for `generation`, refilling via `refill` (expected to retire the
    /// exhausted page, if any, and hand back a fresh one) whenever the
    /// cached page cannot satisfy the request. Returns `None` if `refill`
    /// itself fails to produce a page (heap exhausted), without looping
    /// forever.
    pub fn alloc(
        heap_id: usize,
        generation: Generation,
        size: usize,
        mut refill: impl FnMut(Option<*mut Page>, Generation) -> Option<*mut Page>,
    ) -> Option<(*mut Page, usize)> {
        ACTIVE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if !cache.iter().any(|(id, _)| *id == heap_id) {
                cache.push((
                    heap_id,
                    ActivePages {
                        young: Cell::new(std::ptr::null_mut()),
                        old: Cell::new(std::ptr::null_mut()),
                    },
                ));
            }
            let entry = &cache.iter().find(|(id, _)| *id == heap_id).unwrap().1;
            let slot = entry.slot(generation);

            loop {
                let current = slot.get();
                if !current.is_null() {
                    if let Some(offset) = unsafe { (*current).try_bump_alloc(size) } {
                        return Some((current, offset));
                    }
                }
                let fresh = refill(if current.is_null() { None } else { Some(current) }, generation)?;
                slot.set(fresh);
            }
        })
    }

    /// Drops this thread's cached active pages for `heap_id` without
    /// retiring them; used when a mutator deliberately starts a fresh
    /// allocation context (e.g. tests creating a new `Heap` per case).
    pub fn reset(heap_id: usize) {
        ACTIVE.with(|cache| {
            cache.borrow_mut().retain(|(id, _)| *id != heap_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;

    #[test]
    fn reuses_cached_page_until_exhausted_then_refills() {
        let heap_id = 0xABCD;
        MutatorCache::reset(heap_id);
        let first = Page::create(Generation::Young).expect("mmap");
        let second = Page::create(Generation::Young).expect("mmap");
        let mut refill_calls = 0;

        let (page_a, _) = MutatorCache::alloc(heap_id, Generation::Young, Body::layout_size(4), |_prev, _gen| {
            refill_calls += 1;
            Some(first)
        })
        .unwrap();
        assert_eq!(page_a, first);
        assert_eq!(refill_calls, 1);

        unsafe {
            while (*first).try_bump_alloc(Body::layout_size(4)).is_some() {}
        }

        let (page_b, _) = MutatorCache::alloc(heap_id, Generation::Young, Body::layout_size(4), |_prev, _gen| {
            refill_calls += 1;
            Some(second)
        })
        .unwrap();
        assert_eq!(page_b, second);
        assert_eq!(refill_calls, 2);

        MutatorCache::reset(heap_id);
        unsafe {
            Page::destroy(first);
            Page::destroy(second);
        }
    }

    #[test]
    fn refill_failure_does_not_loop_forever() {
        let heap_id = 0xBEEF;
        MutatorCache::reset(heap_id);
        let result = MutatorCache::alloc(heap_id, Generation::Young, Body::layout_size(4), |_prev, _gen| None);
        assert!(result.is_none());
        MutatorCache::reset(heap_id);
    }
}
