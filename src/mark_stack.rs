//! Mark Stack & Root Set. The mark stack is a multi-producer LIFO drained
//! to fixpoint per cycle; mutators push onto it from the load barrier's
//! slow path. The root set is a table of externally registered handles
//! treated as live every cycle. Both are lock-based rather than lock-free:
//! concurrency correctness matters here, not wait-freedom.

use parking_lot::{Mutex, RwLock};

use crate::handle::Handle;

pub struct MarkStack {
    stack: Mutex<Vec<Handle>>,
}

impl MarkStack {
    pub fn new() -> Self {
        MarkStack {
            stack: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn push(&self, handle: Handle) {
        self.stack.lock().push(handle);
    }

    #[inline]
    pub fn pop(&self) -> Option<Handle> {
        self.stack.lock().pop()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.lock().len()
    }

    pub fn clear(&self) {
        self.stack.lock().clear();
    }
}

impl Default for MarkStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Externally registered handles, treated as live at the start of every
/// collection cycle.
pub struct RootSet {
    roots: RwLock<Vec<Handle>>,
}

impl RootSet {
    pub fn new() -> Self {
        RootSet {
            roots: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, handle: Handle) {
        self.roots.write().push(handle);
    }

    pub fn remove(&self, handle: Handle) {
        self.roots.write().retain(|h| *h != handle);
    }

    /// Snapshot taken at mark start.
    pub fn snapshot(&self) -> Vec<Handle> {
        self.roots.read().clone()
    }

    pub fn len(&self) -> usize {
        self.roots.read().len()
    }
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::{BodyPtr, Color};
    use crate::handle::{Generation, HandlePool};

    #[test]
    fn mark_stack_is_lifo() {
        let pool = HandlePool::new();
        let a = pool.new_handle(BodyPtr::new(0x10, Color::M0), Generation::Young);
        let b = pool.new_handle(BodyPtr::new(0x20, Color::M0), Generation::Young);
        let stack = MarkStack::new();
        stack.push(a);
        stack.push(b);
        assert_eq!(stack.pop(), Some(b));
        assert_eq!(stack.pop(), Some(a));
        assert!(stack.is_empty());
    }

    #[test]
    fn root_set_snapshot_reflects_membership() {
        let pool = HandlePool::new();
        let a = pool.new_handle(BodyPtr::new(0x10, Color::M0), Generation::Young);
        let roots = RootSet::new();
        roots.add(a);
        assert_eq!(roots.snapshot().len(), 1);
        roots.remove(a);
        assert_eq!(roots.snapshot().len(), 0);
    }
}
