//! Page entity: a fixed-size, bump-allocated region owning the
//! [`crate::body::Body`] values inside it until they are evacuated. The page
//! header lives at the start of its own backing mapping, so a `Page`'s
//! `Drop` unmaps the very memory the `Page` value lives in; lifecycle state
//! (`Active`/`Retired`/`Relocating`/`Reclaimed`) and a per-page forwarding
//! map track relocation alongside the generation it belongs to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::bitmap::MarkBitmap;
use crate::globals::{align_usize, ALLOCATION_GRANULARITY, PAGE_BASE_MASK, PAGE_SIZE};
use crate::handle::Generation;
use crate::mmap::Mmap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PageState {
    Active = 0,
    Retired = 1,
    Relocating = 2,
    Reclaimed = 3,
}

impl PageState {
    fn from_u8(v: u8) -> PageState {
        match v {
            0 => PageState::Active,
            1 => PageState::Retired,
            2 => PageState::Relocating,
            _ => PageState::Reclaimed,
        }
    }
}

pub struct Page {
    mmap: Mmap,
    pub generation: Generation,
    state: AtomicU8,
    bump: AtomicUsize,
    limit: usize,
    pub mark_bitmap: MarkBitmap,
    /// Source offset (relative to payload start) -> tagged new body address.
    /// Insertion happens only under `transition_lock`, during evacuation;
    /// lookups take the read side of the lock, which is uncontended once
    /// the map is published (read-mostly, not literally wait-free).
    forwarding_map: RwLock<HashMap<usize, usize>>,
    pub live_bytes: AtomicUsize,
    transition_lock: Mutex<()>,
    /// Counts down from [`crate::globals::RECLAIM_DELAY_CYCLES`] once the
    /// page enters `Relocating`; reaches zero only after the forwarding map
    /// has survived enough full cycles to guarantee no further self-heal
    /// can observe the stale address.
    reclaim_countdown: AtomicU32,
    payload_start: usize,
    payload_size: usize,
}

impl Page {
    /// Allocates a fresh page via a dedicated mapping and writes the `Page`
    /// header into the start of that very mapping. The mapping reserves
    /// twice `PAGE_SIZE` so a `PAGE_SIZE`-aligned base can always be
    /// carved out of it: `mmap()` only guarantees OS-page alignment, but
    /// `Page::from_payload`'s address recovery requires true `PAGE_SIZE`
    /// alignment.
    pub fn create(generation: Generation) -> Option<*mut Page> {
        let mmap = Mmap::try_new(2 * PAGE_SIZE)?;
        unsafe {
            let base = mmap.aligned();
            let header_size = align_usize(std::mem::size_of::<Page>(), ALLOCATION_GRANULARITY);
            let payload_start = base as usize + header_size;
            let payload_size = PAGE_SIZE - header_size;

            let page = base.cast::<Page>();
            page.write(Page {
                mmap,
                generation,
                state: AtomicU8::new(PageState::Active as u8),
                bump: AtomicUsize::new(payload_start),
                limit: payload_start + payload_size,
                mark_bitmap: MarkBitmap::new(payload_size),
                forwarding_map: RwLock::new(HashMap::new()),
                live_bytes: AtomicUsize::new(0),
                transition_lock: Mutex::new(()),
                reclaim_countdown: AtomicU32::new(0),
                payload_start,
                payload_size,
            });
            Some(page)
        }
    }

    /// # Safety
    /// `page` must be a pointer returned by [`Page::create`] that has not
    /// already been destroyed, and must not be referenced after this call.
    pub unsafe fn destroy(page: *mut Page) {
        std::ptr::drop_in_place(page);
    }

    #[inline]
    pub fn from_payload(payload: *mut u8) -> *mut Page {
        ((payload as usize) & PAGE_BASE_MASK) as *mut Page
    }

    #[inline]
    pub fn payload_start(&self) -> usize {
        self.payload_start
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Wait-free per-thread bump allocation: a single compare-and-swap on
    /// `bump`, no page lock involved.
    #[inline]
    pub fn try_bump_alloc(&self, size: usize) -> Option<usize> {
        let size = align_usize(size, ALLOCATION_GRANULARITY);
        let mut old = self.bump.load(Ordering::Relaxed);
        loop {
            let new = old.checked_add(size)?;
            if new > self.limit {
                return None;
            }
            match self
                .bump
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.live_bytes.fetch_add(size, Ordering::Relaxed);
                    return Some(old);
                }
                Err(observed) => old = observed,
            }
        }
    }

    /// Active -> Retired. Serialized by `transition_lock`; allocation never
    /// takes this lock.
    pub fn retire(&self) {
        let _guard = self.transition_lock.lock();
        if self.state() == PageState::Active {
            self.state.store(PageState::Retired as u8, Ordering::Release);
            log::debug!(
                "page {:p} retired, live_bytes={}",
                self as *const Self,
                self.live_bytes.load(Ordering::Relaxed)
            );
        }
    }

    pub fn begin_relocating(&self, reclaim_delay_cycles: u32) {
        let _guard = self.transition_lock.lock();
        debug_assert_eq!(self.state(), PageState::Retired);
        self.state.store(PageState::Relocating as u8, Ordering::Release);
        self.reclaim_countdown.store(reclaim_delay_cycles, Ordering::Release);
    }

    /// Called once per completed full mark-relocate cycle while the page is
    /// `Relocating`. Returns `true` once the countdown has elapsed and the
    /// page is ready to actually be unmapped.
    pub fn tick_reclaim_countdown(&self) -> bool {
        if self.state() != PageState::Relocating {
            return false;
        }
        let prev = self
            .reclaim_countdown
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
        matches!(prev, Ok(0) | Ok(1))
    }

    pub fn mark_reclaimed(&self) {
        let _guard = self.transition_lock.lock();
        self.state.store(PageState::Reclaimed as u8, Ordering::Release);
    }

    #[inline]
    pub fn offset_of(&self, payload_addr: usize) -> usize {
        payload_addr - self.payload_start
    }

    pub fn occupancy(&self) -> f64 {
        self.live_bytes.load(Ordering::Relaxed) as f64 / self.payload_size as f64
    }

    pub fn install_forwarding(&self, source_offset: usize, tagged_new_body: usize) {
        self.forwarding_map.write().insert(source_offset, tagged_new_body);
    }

    pub fn lookup_forwarding(&self, source_offset: usize) -> Option<usize> {
        self.forwarding_map.read().get(&source_offset).copied()
    }

    pub fn forwarding_len(&self) -> usize {
        self.forwarding_map.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_alloc_advances_and_rejects_overflow() {
        let page = Page::create(Generation::Young).expect("mmap");
        unsafe {
            let a = (*page).try_bump_alloc(64).unwrap();
            let b = (*page).try_bump_alloc(64).unwrap();
            assert_eq!(b, a + 64);
            assert!((*page).try_bump_alloc(usize::MAX).is_none());
            Page::destroy(page);
        }
    }

    #[test]
    fn retire_then_relocate_lifecycle() {
        let page = Page::create(Generation::Old).expect("mmap");
        unsafe {
            assert_eq!((*page).state(), PageState::Active);
            (*page).retire();
            assert_eq!((*page).state(), PageState::Retired);
            (*page).begin_relocating(crate::globals::RECLAIM_DELAY_CYCLES);
            assert_eq!((*page).state(), PageState::Relocating);
            for _ in 0..crate::globals::RECLAIM_DELAY_CYCLES {
                (*page).tick_reclaim_countdown();
            }
            (*page).mark_reclaimed();
            assert_eq!((*page).state(), PageState::Reclaimed);
            Page::destroy(page);
        }
    }

    #[test]
    fn from_payload_recovers_owning_page() {
        let page = Page::create(Generation::Young).expect("mmap");
        unsafe {
            let offset = (*page).try_bump_alloc(128).unwrap();
            let recovered = Page::from_payload(offset as *mut u8);
            assert_eq!(recovered, page);
            Page::destroy(page);
        }
    }
}
