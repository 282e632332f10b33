//! Colored pointer protocol.
//!
//! A body pointer is `color:4 | address:60`. Exactly one [`Color`] is
//! "good" at any instant; the barrier's entire fast path is a single
//! mask-and-compare against `current_good_color`.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::globals::{ADDRESS_MASK, COLOR_SHIFT};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Color {
    M0 = 0,
    M1 = 1,
    Relocate = 2,
}

impl Color {
    #[inline(always)]
    pub const fn from_tag(tag: u8) -> Color {
        match tag & 0b11 {
            0 => Color::M0,
            1 => Color::M1,
            _ => Color::Relocate,
        }
    }

    #[inline(always)]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    pub const fn other_mark_color(self) -> Color {
        match self {
            Color::M0 => Color::M1,
            Color::M1 => Color::M0,
            Color::Relocate => Color::M0,
        }
    }
}

/// The collector phase, observed by every barrier invocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Mark = 1,
    Relocate = 2,
}

/// A tagged body pointer: top [`crate::globals::COLOR_BITS`] bits carry the
/// [`Color`], the rest is a virtual address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct BodyPtr(pub usize);

impl BodyPtr {
    pub const NULL: BodyPtr = BodyPtr(0);

    #[inline(always)]
    pub fn new(address: usize, color: Color) -> Self {
        debug_assert_eq!(address & !ADDRESS_MASK, 0, "address exceeds 60 usable bits");
        BodyPtr(address | ((color.tag() as usize) << COLOR_SHIFT))
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn address(self) -> usize {
        self.0 & ADDRESS_MASK
    }

    #[inline(always)]
    pub fn color(self) -> Color {
        Color::from_tag((self.0 >> COLOR_SHIFT) as u8)
    }

    #[inline(always)]
    pub fn with_color(self, color: Color) -> Self {
        BodyPtr::new(self.address(), color)
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.address() as *mut u8
    }
}

impl std::fmt::Pointer for BodyPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}({:?})", self.address(), self.color())
    }
}

/// Process-wide phase/color state, written only by the collector at phase
/// transitions and read on every barrier fast path.
pub struct ColorState {
    phase: AtomicU8,
    good_color: AtomicU8,
}

impl ColorState {
    pub fn new() -> Self {
        ColorState {
            phase: AtomicU8::new(Phase::Idle as u8),
            good_color: AtomicU8::new(Color::M0 as u8),
        }
    }

    #[inline(always)]
    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Relaxed) {
            0 => Phase::Idle,
            1 => Phase::Mark,
            _ => Phase::Relocate,
        }
    }

    #[inline(always)]
    pub fn good_color(&self) -> Color {
        Color::from_tag(self.good_color.load(Ordering::Relaxed))
    }

    /// `p`'s color matches the good color: the fast path, no barrier work
    /// required.
    #[inline(always)]
    pub fn is_good(&self, p: BodyPtr) -> bool {
        p.color().tag() == self.good_color.load(Ordering::Relaxed)
    }

    /// Mark Start: advance to the next mark color; every existing pointer
    /// becomes "bad (needs mark)".
    pub fn begin_mark(&self) {
        let next = self.good_color().other_mark_color();
        self.good_color.store(next.tag(), Ordering::Release);
        self.phase.store(Phase::Mark as u8, Ordering::Release);
        log::debug!("phase -> Mark, good color -> {next:?}");
    }

    /// Relocate Start: good color becomes R; every pointer becomes "bad
    /// (needs remap)".
    pub fn begin_relocate(&self) {
        self.good_color.store(Color::Relocate.tag(), Ordering::Release);
        self.phase.store(Phase::Relocate as u8, Ordering::Release);
        log::debug!("phase -> Relocate, good color -> Relocate");
    }

    /// Relocate End: good color returns to the last mark color; pointers
    /// tagged R still self-heal lazily.
    pub fn end_relocate(&self, last_mark_color: Color) {
        self.good_color.store(last_mark_color.tag(), Ordering::Release);
        self.phase.store(Phase::Idle as u8, Ordering::Release);
        log::debug!("phase -> Idle, good color -> {last_mark_color:?}");
    }
}

impl Default for ColorState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_address_and_color() {
        let p = BodyPtr::new(0x1000, Color::M1);
        assert_eq!(p.address(), 0x1000);
        assert_eq!(p.color(), Color::M1);
    }

    #[test]
    fn good_color_rotates_on_mark_start() {
        let state = ColorState::new();
        assert_eq!(state.good_color(), Color::M0);
        state.begin_mark();
        assert_eq!(state.good_color(), Color::M1);
        assert_eq!(state.phase(), Phase::Mark);
    }

    #[test]
    fn relocate_cycle_returns_to_mark_color() {
        let state = ColorState::new();
        state.begin_mark();
        let mark_color = state.good_color();
        state.begin_relocate();
        assert_eq!(state.good_color(), Color::Relocate);
        state.end_relocate(mark_color);
        assert_eq!(state.good_color(), mark_color);
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn p4_consecutive_barrier_observations_differ_by_at_most_one_transition() {
        let state = ColorState::new();
        let mut seen = vec![state.good_color()];
        state.begin_mark();
        seen.push(state.good_color());
        state.begin_relocate();
        seen.push(state.good_color());
        for window in seen.windows(2) {
            assert_ne!(window[0], window[1]);
        }
    }
}
