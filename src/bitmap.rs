//! Per-page mark bitmap: one atomic bit per [`crate::globals::ALLOCATION_GRANULARITY`]
//! granule of page payload, tested and set with compare-and-set so marking
//! a body is a race-free, purely local decision. A plain heap-allocated
//! word array sized to cover one page's payload.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::globals::ALLOCATION_GRANULARITY;

const BITS_PER_WORD: usize = usize::BITS as usize;

pub struct MarkBitmap {
    words: Vec<AtomicUsize>,
}

impl MarkBitmap {
    /// `payload_size` is the number of bytes the bitmap must cover.
    pub fn new(payload_size: usize) -> Self {
        let granules = payload_size.div_ceil(ALLOCATION_GRANULARITY);
        let word_count = granules.div_ceil(BITS_PER_WORD).max(1);
        let mut words = Vec::with_capacity(word_count);
        words.resize_with(word_count, || AtomicUsize::new(0));
        MarkBitmap { words }
    }

    #[inline]
    fn locate(offset: usize) -> (usize, usize) {
        let granule = offset / ALLOCATION_GRANULARITY;
        (granule / BITS_PER_WORD, granule % BITS_PER_WORD)
    }

    /// Sets the bit for `offset`, returning `true` if *this call* set it
    /// (i.e. the caller is the one that marked the body).
    #[inline]
    pub fn test_and_set(&self, offset: usize) -> bool {
        let (word_idx, bit) = Self::locate(offset);
        let mask = 1usize << bit;
        let word = &self.words[word_idx];
        let mut old = word.load(Ordering::Relaxed);
        loop {
            if old & mask != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                old,
                old | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => old = observed,
            }
        }
    }

    #[inline]
    pub fn test(&self, offset: usize) -> bool {
        let (word_idx, bit) = Self::locate(offset);
        self.words[word_idx].load(Ordering::Acquire) & (1usize << bit) != 0
    }

    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Iterates set bits, yielding each marked granule's byte offset.
    pub fn for_each_marked(&self, mut f: impl FnMut(usize)) {
        for (word_idx, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let granule = word_idx * BITS_PER_WORD + bit;
                f(granule * ALLOCATION_GRANULARITY);
                bits &= bits - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_setter_wins() {
        let bm = MarkBitmap::new(4096);
        assert!(bm.test_and_set(64));
        assert!(!bm.test_and_set(64));
        assert!(bm.test(64));
        assert!(!bm.test(72));
    }

    #[test]
    fn clear_resets_all_bits() {
        let bm = MarkBitmap::new(4096);
        bm.test_and_set(0);
        bm.test_and_set(512);
        bm.clear();
        assert!(!bm.test(0));
        assert!(!bm.test(512));
    }

    #[test]
    fn for_each_marked_visits_all_set_granules() {
        let bm = MarkBitmap::new(4096);
        bm.test_and_set(0);
        bm.test_and_set(256);
        bm.test_and_set(4088);
        let mut seen = Vec::new();
        bm.for_each_marked(|off| seen.push(off));
        assert_eq!(seen, vec![0, 256, 4088]);
    }
}
