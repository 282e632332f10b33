//! Remembered Set entity: per-old-page record of slot offsets that
//! currently hold young-generation references, maintained by the write
//! barrier and scanned/cleared by minor GC.

use std::collections::HashSet;

use parking_lot::Mutex;

/// `(old_page, slot_offset)` pairs recorded by the write barrier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RememberedEntry {
    pub page: *mut crate::page::Page,
    pub slot_offset: usize,
}

unsafe impl Send for RememberedEntry {}

pub struct RememberedSet {
    entries: Mutex<HashSet<RememberedEntry>>,
}

impl RememberedSet {
    pub fn new() -> Self {
        RememberedSet {
            entries: Mutex::new(HashSet::new()),
        }
    }

    pub fn record(&self, page: *mut crate::page::Page, slot_offset: usize) {
        self.entries.lock().insert(RememberedEntry { page, slot_offset });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains all entries for minor-GC scanning; the set is cleared after
    /// each minor collection.
    pub fn drain(&self) -> Vec<RememberedEntry> {
        self.entries.lock().drain().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_and_returns_entries() {
        let rs = RememberedSet::new();
        rs.record(std::ptr::null_mut(), 8);
        rs.record(std::ptr::null_mut(), 16);
        assert_eq!(rs.len(), 2);
        let drained = rs.drain();
        assert_eq!(drained.len(), 2);
        assert!(rs.is_empty());
    }
}
