//! Relocator / evacuator: copies live bodies out of retired pages into
//! fresh ones, installs forwarding entries, and tenures young survivors
//! once they cross the age threshold. Only candidate pages below the
//! relocation threshold are copied each cycle, not the whole generation.

use crate::body::Body;
use crate::color::{BodyPtr, Color};
use crate::handle::{Generation, Handle};
use crate::page::{Page, PageState};

/// A page queued for evacuation, paired with the handles known to still
/// reference bodies inside it. The collector discovers these during mark
/// and hands them to the relocator rather than the relocator re-scanning.
pub struct RelocationSet {
    pub pages: Vec<*mut Page>,
}

impl RelocationSet {
    /// Selects retired pages whose occupancy is below `relocation_threshold`,
    /// oldest (lowest address, as a proxy for allocation order) first.
    pub fn select(candidates: &[*mut Page], relocation_threshold: f64) -> RelocationSet {
        let mut pages: Vec<*mut Page> = candidates
            .iter()
            .copied()
            .filter(|p| unsafe {
                let p = &**p;
                p.state() == PageState::Retired && p.occupancy() < relocation_threshold
            })
            .collect();
        pages.sort_by_key(|p| *p as usize);
        RelocationSet { pages }
    }
}

pub struct Relocator {
    pub tenure_threshold: u8,
    pub reclaim_delay_cycles: u32,
}

impl Relocator {
    /// Evacuates every marked body out of `set`'s pages. `alloc_target`
    /// supplies (or creates) the destination page for a given generation;
    /// it is called once per surviving body and may return a different
    /// page each time a destination fills up.
    pub fn relocate(
        &self,
        set: &RelocationSet,
        live_handles: &[Handle],
        mut alloc_target: impl FnMut(Generation) -> *mut Page,
    ) {
        for &page_ptr in &set.pages {
            unsafe { (*page_ptr).begin_relocating(self.reclaim_delay_cycles) };
        }

        for &handle in live_handles {
            let raw = handle.load_body_raw();
            let source_page = Page::from_payload(raw.as_ptr());
            if !set.pages.contains(&source_page) {
                continue;
            }
            unsafe { self.evacuate_one(handle, raw, source_page, &mut alloc_target) };
        }
    }

    /// # Safety
    /// `raw` must currently resolve into `source_page`'s payload and the
    /// caller must hold no other live reference to the body being moved.
    unsafe fn evacuate_one(
        &self,
        handle: Handle,
        raw: BodyPtr,
        source_page: *mut Page,
        alloc_target: &mut impl FnMut(Generation) -> *mut Page,
    ) {
        let source_page_ref = &*source_page;
        let source_offset = source_page_ref.offset_of(raw.address());
        if let Some(existing) = source_page_ref.lookup_forwarding(source_offset) {
            handle.heal_body(BodyPtr(existing));
            return;
        }

        let body = raw.as_ptr().cast::<Body>();
        let slot_count = (*body).header.slot_count();
        let size = Body::layout_size(slot_count);
        let age = (*body).header.age();
        let promote = age + 1 >= self.tenure_threshold && handle.generation() == Generation::Young;
        let dest_generation = if promote { Generation::Old } else { handle.generation() };

        let (_dest_page, dest_offset) = loop {
            let candidate = alloc_target(dest_generation);
            if let Some(offset) = (*candidate).try_bump_alloc(size) {
                break (candidate, offset);
            }
        };

        std::ptr::copy_nonoverlapping(raw.as_ptr(), dest_offset as *mut u8, size);
        let new_body = dest_offset as *mut Body;
        (*new_body).header.bump_age();
        if promote {
            (*new_body).header.mark_promoted();
        }

        let tagged = BodyPtr::new(dest_offset, Color::Relocate).0;
        source_page_ref.install_forwarding(source_offset, tagged);
        handle.heal_body(BodyPtr(tagged));
        if promote {
            handle.set_generation(Generation::Old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorState;
    use crate::globals::{DEFAULT_TENURE_THRESHOLD, RECLAIM_DELAY_CYCLES};
    use crate::handle::HandlePool;
    use std::sync::atomic::Ordering;

    #[test]
    fn evacuates_body_and_installs_forwarding() {
        let colors = ColorState::new();
        let handles = HandlePool::new();
        let src = Page::create(Generation::Young).expect("mmap");
        let dst = Page::create(Generation::Young).expect("mmap");

        unsafe {
            let off = (*src).try_bump_alloc(Body::layout_size(0)).unwrap();
            Body::init(off as *mut u8, 0);
            (*src).mark_bitmap.test_and_set((*src).offset_of(off));
            (*src).live_bytes.store(8, Ordering::Relaxed);
            (*src).retire();

            let handle = handles.new_handle(BodyPtr::new(off, colors.good_color()), Generation::Young);
            let set = RelocationSet { pages: vec![src] };
            let relocator = Relocator {
                tenure_threshold: DEFAULT_TENURE_THRESHOLD,
                reclaim_delay_cycles: RECLAIM_DELAY_CYCLES,
            };
            relocator.relocate(&set, &[handle], |_gen| dst);

            assert_eq!((*src).state(), PageState::Relocating);
            let new_addr = handle.load_body_raw();
            assert_ne!(new_addr.address(), off);
            assert_eq!((*(new_addr.as_ptr().cast::<Body>())).header.age(), 1);

            for _ in 0..RECLAIM_DELAY_CYCLES {
                (*src).tick_reclaim_countdown();
            }
            (*src).mark_reclaimed();
            Page::destroy(src);
            Page::destroy(dst);
        }
    }

    #[test]
    fn healed_handle_carries_the_installed_forwarding_tag() {
        let colors = ColorState::new();
        let handles = HandlePool::new();
        let src = Page::create(Generation::Young).expect("mmap");
        let dst = Page::create(Generation::Young).expect("mmap");

        unsafe {
            let off = (*src).try_bump_alloc(Body::layout_size(0)).unwrap();
            Body::init(off as *mut u8, 0);
            (*src).mark_bitmap.test_and_set((*src).offset_of(off));
            (*src).live_bytes.store(8, Ordering::Relaxed);
            (*src).retire();

            let handle = handles.new_handle(BodyPtr::new(off, colors.good_color()), Generation::Young);
            let set = RelocationSet { pages: vec![src] };
            let relocator = Relocator {
                tenure_threshold: DEFAULT_TENURE_THRESHOLD,
                reclaim_delay_cycles: RECLAIM_DELAY_CYCLES,
            };
            relocator.relocate(&set, &[handle], |_gen| dst);

            // A healed handle must carry the exact tagged address the
            // forwarding map holds, not the bare destination offset, or it
            // would read as stale again on its very next access.
            let forwarded = src.as_ref().unwrap().lookup_forwarding(off).unwrap();
            assert_eq!(handle.load_body_raw().0, forwarded);
            assert_eq!(handle.load_body_raw().color(), Color::Relocate);

            for _ in 0..RECLAIM_DELAY_CYCLES {
                (*src).tick_reclaim_countdown();
            }
            (*src).mark_reclaimed();
            Page::destroy(src);
            Page::destroy(dst);
        }
    }
}
