//! Object layout: the movable, relocatable storage behind a
//! [`crate::handle::Handle`].
//!
//! The canonical mark bit lives in the owning [`crate::page::Page`]'s mark
//! bitmap (one atomic bit per body offset, tested with compare-and-set so
//! "who marked it" is a local decision — see `marker.rs`), not duplicated
//! here; the header only carries what cannot be derived from page metadata:
//! size class, age, and the forwarding slot.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use modular_bitfield::prelude::*;

use crate::slot::RawSlot;

#[bitfield(bits = 32)]
#[derive(Clone, Copy)]
pub struct BodyFlags {
    /// Number of slots, i.e. payload size in words.
    pub size_class: B16,
    /// Evacuations survived; bumped only when the body actually moves.
    pub age: B8,
    /// Non-zero once this Handle's generation hint says "old". Mirrored
    /// here purely as a fast diagnostic; the Handle is authoritative.
    pub promoted: bool,
    #[skip]
    __: B7,
}

/// Header prepended to every Body. `forwarding` is `0` while the body is
/// live in a non-retired page; after evacuation it holds the tagged
/// [`crate::color::BodyPtr`] of the new copy.
pub struct BodyHeader {
    flags: AtomicU32,
    forwarding: AtomicUsize,
}

impl BodyHeader {
    pub fn new(slot_count: usize) -> Self {
        let flags = BodyFlags::new()
            .with_size_class(slot_count as u16)
            .with_age(0)
            .with_promoted(false);
        BodyHeader {
            flags: AtomicU32::new(u32::from_le_bytes(flags.into_bytes())),
            forwarding: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn flags(&self) -> BodyFlags {
        BodyFlags::from_bytes(self.flags.load(Ordering::Relaxed).to_le_bytes())
    }

    #[inline]
    fn set_flags(&self, flags: BodyFlags) {
        self.flags
            .store(u32::from_le_bytes(flags.into_bytes()), Ordering::Relaxed);
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.flags().size_class() as usize
    }

    #[inline]
    pub fn age(&self) -> u8 {
        self.flags().age()
    }

    /// Bumps the age counter; called by the evacuator exactly once per
    /// evacuation the body survives (never on in-place survival).
    #[inline]
    pub fn bump_age(&self) -> u8 {
        let mut f = self.flags();
        let next = f.age().saturating_add(1);
        f.set_age(next);
        self.set_flags(f);
        next
    }

    #[inline]
    pub fn mark_promoted(&self) {
        let mut f = self.flags();
        f.set_promoted(true);
        self.set_flags(f);
    }

    #[inline]
    pub fn is_forwarded(&self) -> bool {
        self.forwarding.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn forwarding_address(&self) -> Option<usize> {
        match self.forwarding.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Installs the forwarding entry. Called by the evacuator only, under
    /// the owning page's transition lock.
    #[inline]
    pub fn set_forwarding(&self, tagged_new_body: usize) {
        self.forwarding.store(tagged_new_body, Ordering::Release);
    }
}

/// A Body's payload: a fixed-size header plus an ordered array of slots.
/// Bodies are never constructed as Rust values directly — they live inside
/// page payload memory and are accessed through raw pointers.
#[repr(C)]
pub struct Body {
    pub header: BodyHeader,
}

impl Body {
    /// Bytes needed for a body with `slot_count` slots, header included,
    /// rounded up to [`crate::globals::ALLOCATION_GRANULARITY`].
    pub fn layout_size(slot_count: usize) -> usize {
        crate::globals::align_usize(
            std::mem::size_of::<BodyHeader>() + slot_count * std::mem::size_of::<RawSlot>(),
            crate::globals::ALLOCATION_GRANULARITY,
        )
    }

    /// Writes a fresh header + zeroed slots at `at`, returning the body
    /// pointer (untagged address). `at` must have room for
    /// [`Body::layout_size`] bytes and be suitably aligned.
    ///
    /// # Safety
    /// `at` must point to writable memory of at least `layout_size(slot_count)`
    /// bytes that is not concurrently observed by any other thread.
    pub unsafe fn init(at: *mut u8, slot_count: usize) -> *mut Body {
        let body = at.cast::<Body>();
        body.write(Body {
            header: BodyHeader::new(slot_count),
        });
        let slots = Self::slots_ptr(body);
        for i in 0..slot_count {
            slots.add(i).write(RawSlot::EMPTY);
        }
        body
    }

    #[inline]
    unsafe fn slots_ptr(body: *mut Body) -> *mut RawSlot {
        body.add(1).cast::<RawSlot>()
    }

    /// # Safety
    /// `body` must point at a live, initialized Body and `index` must be in
    /// bounds of its slot count.
    #[inline]
    pub unsafe fn slot(body: *mut Body, index: usize) -> *mut RawSlot {
        Self::slots_ptr(body).add(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_body_has_zero_age_and_no_forwarding() {
        let mut buf = vec![0u8; Body::layout_size(4)];
        unsafe {
            let body = Body::init(buf.as_mut_ptr(), 4);
            assert_eq!((*body).header.slot_count(), 4);
            assert_eq!((*body).header.age(), 0);
            assert!(!(*body).header.is_forwarded());
            (*body).header.bump_age();
            assert_eq!((*body).header.age(), 1);
        }
    }
}
