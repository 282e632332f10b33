//! Fixed-width slot encoding: each slot is a single pointer-sized word
//! holding either a [`Handle`] reference or an opaque foreign value.

use crate::handle::Handle;

/// A raw, pointer-sized slot word as physically stored in a [`crate::body::Body`].
///
/// Low bit 0: foreign value, remaining bits are the host token (shifted left
/// by one). Low bit 1: managed reference, remaining bits are the tagged
/// [`Handle`] pointer (handle allocations are always 8-byte aligned, so the
/// low bit is free to steal).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct RawSlot(pub usize);

const HANDLE_TAG: usize = 1;

impl RawSlot {
    pub const EMPTY: RawSlot = RawSlot(0);

    #[inline]
    pub fn foreign(token: u64) -> Self {
        RawSlot((token as usize) << 1)
    }

    #[inline]
    pub fn handle(handle: Handle) -> Self {
        RawSlot((handle.as_raw() as usize) | HANDLE_TAG)
    }

    #[inline]
    pub fn is_handle(self) -> bool {
        self.0 & HANDLE_TAG != 0
    }

    #[inline]
    pub fn decode(self) -> Slot {
        if self.is_handle() {
            Slot::Ref(unsafe { Handle::from_raw((self.0 & !HANDLE_TAG) as *mut crate::handle::HandleInner) })
        } else {
            Slot::Foreign((self.0 >> 1) as u64)
        }
    }
}

/// Ergonomic, decoded view of a [`RawSlot`] used at the API surface.
#[derive(Clone, Copy, Debug)]
pub enum Slot {
    Foreign(u64),
    Ref(Handle),
}

impl Slot {
    #[inline]
    pub fn encode(self) -> RawSlot {
        match self {
            Slot::Foreign(token) => RawSlot::foreign(token),
            Slot::Ref(handle) => RawSlot::handle(handle),
        }
    }
}

impl From<Handle> for Slot {
    fn from(h: Handle) -> Self {
        Slot::Ref(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_slot_roundtrips() {
        let raw = RawSlot::foreign(0x1234);
        assert!(!raw.is_handle());
        match raw.decode() {
            Slot::Foreign(v) => assert_eq!(v, 0x1234),
            _ => panic!("expected foreign slot"),
        }
    }
}
