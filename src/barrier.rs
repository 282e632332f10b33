//! Load and store barriers: the only code mutators run on every heap
//! access. The load barrier's fast path is a single color comparison; its
//! slow path follows a page's forwarding map and, during a mark cycle,
//! pushes the handle onto the mark stack. The store barrier additionally
//! records a remembered-set entry whenever an old-generation body is made
//! to reference a young one.

use crate::color::{BodyPtr, Color, ColorState, Phase};
use crate::handle::{Generation, Handle};
use crate::mark_stack::MarkStack;
use crate::page::Page;
use crate::remembered_set::RememberedSet;
use crate::slot::{RawSlot, Slot};

/// Bundles the process-wide state a barrier needs to consult. `Heap` owns
/// one of these and hands out a borrow to every mutator operation.
pub struct BarrierContext<'a> {
    pub colors: &'a ColorState,
    pub mark_stack: &'a MarkStack,
    pub remembered_set: &'a RememberedSet,
}

impl<'a> BarrierContext<'a> {
    /// Load barrier: resolves a possibly-stale [`Handle`] to the Body's
    /// current address, healing the handle in place so subsequent loads
    /// take the fast path. This is the only place a forwarded pointer is
    /// ever followed.
    #[inline]
    pub fn load(&self, handle: Handle) -> BodyPtr {
        let raw = handle.load_body_raw();
        if self.colors.is_good(raw) {
            return raw;
        }
        self.slow_load(handle, raw)
    }

    #[cold]
    fn slow_load(&self, handle: Handle, raw: BodyPtr) -> BodyPtr {
        let resolved = match raw.color() {
            Color::Relocate => self.resolve_forwarding(raw),
            _ => {
                // Not-yet-marked during a mark cycle: the mutator itself
                // just proved the object reachable by loading it.
                if self.colors.phase() == Phase::Mark {
                    self.mark_stack.push(handle);
                }
                raw.with_color(self.colors.good_color())
            }
        };
        handle.heal_body(resolved);
        resolved
    }

    /// Follows a page's forwarding map to the relocated copy. If the body
    /// has not actually been evacuated yet (the page is still `Retired`,
    /// not `Relocating`), the address is simply recolored: it has not
    /// moved, it was just observed during a relocation phase.
    fn resolve_forwarding(&self, raw: BodyPtr) -> BodyPtr {
        let page = unsafe { &*Page::from_payload(raw.as_ptr()) };
        let offset = page.offset_of(raw.address());
        match page.lookup_forwarding(offset) {
            Some(tagged) => BodyPtr(tagged).with_color(self.colors.good_color()),
            None => raw.with_color(self.colors.good_color()),
        }
    }

    /// Store barrier: writes `value` into the slot at `index` within
    /// `owner`'s body, first healing any reference already occupying that
    /// slot (so its refcount/remembered-set bookkeeping never observes a
    /// stale address) and then recording a remembered-set entry when an
    /// old-generation body is made to point at a young one.
    ///
    /// # Safety
    /// `slot` must point at a live slot belonging to `owner`'s current Body.
    #[inline]
    pub unsafe fn store(&self, owner: Handle, slot: *mut RawSlot, value: Slot) {
        let previous = (*slot).decode();
        if let Slot::Ref(old) = previous {
            old.decref();
        }
        if let Slot::Ref(new_handle) = value {
            new_handle.incref();
            if owner.generation() == Generation::Old && new_handle.generation() == Generation::Young {
                let page = Page::from_payload(slot.cast::<u8>());
                let offset = (*page).offset_of(slot as usize);
                self.remembered_set.record(page, offset);
            }
        }
        slot.write(value.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::BodyPtr;
    use crate::handle::HandlePool;

    fn fresh_context() -> (ColorState, MarkStack, RememberedSet) {
        (ColorState::new(), MarkStack::new(), RememberedSet::new())
    }

    #[test]
    fn fast_path_returns_good_pointer_unchanged() {
        let (colors, mark_stack, remembered) = fresh_context();
        let ctx = BarrierContext {
            colors: &colors,
            mark_stack: &mark_stack,
            remembered_set: &remembered,
        };
        let pool = HandlePool::new();
        let h = pool.new_handle(BodyPtr::new(0x2000, colors.good_color()), Generation::Young);
        let resolved = ctx.load(h);
        assert_eq!(resolved.address(), 0x2000);
        assert!(mark_stack.is_empty());
    }

    #[test]
    fn stale_color_during_mark_pushes_to_mark_stack_and_heals() {
        let (colors, mark_stack, remembered) = fresh_context();
        colors.begin_mark();
        let stale_color = colors.good_color().other_mark_color();
        let ctx = BarrierContext {
            colors: &colors,
            mark_stack: &mark_stack,
            remembered_set: &remembered,
        };
        let pool = HandlePool::new();
        let h = pool.new_handle(BodyPtr::new(0x3000, stale_color), Generation::Young);
        let resolved = ctx.load(h);
        assert_eq!(resolved.color(), colors.good_color());
        assert_eq!(mark_stack.len(), 1);
        assert!(colors.is_good(h.load_body_raw()));
    }
}
