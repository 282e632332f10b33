//! Concurrent marker: drains the mark stack to a fixpoint starting from a
//! snapshot of the root set (plus, for a minor cycle, the remembered set).
//! Marks bodies in place via the page's bitmap and lets the relocator move
//! objects afterwards.

use crate::body::Body;
use crate::color::{BodyPtr, Color, ColorState};
use crate::handle::{Generation, Handle};
use crate::mark_stack::{MarkStack, RootSet};
use crate::page::Page;
use crate::remembered_set::RememberedSet;
use crate::slot::Slot;

pub struct Marker<'a> {
    pub colors: &'a ColorState,
    pub mark_stack: &'a MarkStack,
    pub root_set: &'a RootSet,
    pub remembered_set: &'a RememberedSet,
}

impl<'a> Marker<'a> {
    /// Runs mark-to-fixpoint. `minor` restricts tracing to the young
    /// generation: old-generation handles are treated as opaque roots (via
    /// the remembered set) rather than traced into. Returns the number of
    /// newly marked handles.
    pub fn run(&self, minor: bool) -> usize {
        for root in self.root_set.snapshot() {
            self.mark_stack.push(root);
        }
        if minor {
            for entry in self.remembered_set.drain() {
                let page = unsafe { &*entry.page };
                let slot_addr = page.payload_start() + entry.slot_offset;
                let raw = unsafe { *(slot_addr as *const crate::slot::RawSlot) };
                if raw.is_handle() {
                    if let Slot::Ref(h) = raw.decode() {
                        self.mark_stack.push(h);
                    }
                }
            }
        }

        let mut marked = 0;
        while let Some(handle) = self.mark_stack.pop() {
            if minor && handle.generation() == Generation::Old {
                continue;
            }
            if self.visit(handle) {
                marked += 1;
            }
        }
        marked
    }

    /// Resolves, marks, and (if newly marked) enqueues `handle`'s outgoing
    /// references. Returns `true` if this call performed the marking (i.e.
    /// no other tracer had already claimed this body).
    fn visit(&self, handle: Handle) -> bool {
        let resolved = self.resolve(handle.load_body_raw());
        let page = unsafe { &*Page::from_payload(resolved.as_ptr()) };
        let offset = page.offset_of(resolved.address());
        if !page.mark_bitmap.test_and_set(offset) {
            return false;
        }
        handle.set_collector_reachable(true);
        let body = resolved.as_ptr().cast::<Body>();
        let slot_count = unsafe { (*body).header.slot_count() };
        for i in 0..slot_count {
            let raw = unsafe { *Body::slot(body, i) };
            if raw.is_handle() {
                if let Slot::Ref(child) = raw.decode() {
                    self.mark_stack.push(child);
                }
            }
        }
        true
    }

    /// Mirrors the load barrier's forwarding resolution but never pushes
    /// back onto the mark stack (the caller is already the tracer) and
    /// does not attempt to heal the handle: healing is the mutator
    /// barrier's job, the marker only needs a current address to mark.
    fn resolve(&self, raw: BodyPtr) -> BodyPtr {
        if self.colors.is_good(raw) || raw.color() != Color::Relocate {
            return raw.with_color(self.colors.good_color());
        }
        let page = unsafe { &*Page::from_payload(raw.as_ptr()) };
        let offset = page.offset_of(raw.address());
        match page.lookup_forwarding(offset) {
            Some(tagged) => BodyPtr(tagged).with_color(self.colors.good_color()),
            None => raw.with_color(self.colors.good_color()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandlePool;
    use crate::page::Page;
    use crate::slot::RawSlot;

    #[test]
    fn marks_root_and_its_referent() {
        let colors = ColorState::new();
        let mark_stack = MarkStack::new();
        let root_set = RootSet::new();
        let remembered_set = RememberedSet::new();
        let pool = HandlePool::new();

        let page = Page::create(Generation::Young).expect("mmap");
        unsafe {
            let parent_off = (*page).try_bump_alloc(Body::layout_size(1)).unwrap();
            let parent_body = Body::init(parent_off as *mut u8, 1);
            let child_off = (*page).try_bump_alloc(Body::layout_size(0)).unwrap();
            let _child_body = Body::init(child_off as *mut u8, 0);

            let child = pool.new_handle(BodyPtr::new(child_off, colors.good_color()), Generation::Young);
            let parent = pool.new_handle(BodyPtr::new(parent_off, colors.good_color()), Generation::Young);
            *Body::slot(parent_body, 0) = RawSlot::handle(child);

            root_set.add(parent);
            let marker = Marker {
                colors: &colors,
                mark_stack: &mark_stack,
                root_set: &root_set,
                remembered_set: &remembered_set,
            };
            let marked = marker.run(false);
            assert_eq!(marked, 2);
            assert!((*page).mark_bitmap.test((*page).offset_of(parent_off)));
            assert!((*page).mark_bitmap.test((*page).offset_of(child_off)));
            assert!(child.is_marked_reachable());

            Page::destroy(page);
        }
    }
}
