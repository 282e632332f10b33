//! Barrier Scheduler: coordinates phase transitions with mutators through
//! a lightweight handshake rather than a stop-the-world pause. No mutator
//! is ever frozen; the collector only needs to know that every mutator has
//! *observed* a transition (executed at least one barrier since it
//! happened) before declaring a phase complete.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

thread_local! {
    /// Cache of this thread's ack slot per heap, so repeated barrier calls
    /// don't pay a registry lookup. Keyed by the heap's address, so no
    /// explicit `register_mutator` call is needed in the host-facing API.
    static ACK_SLOT: std::cell::RefCell<Vec<(usize, Arc<AtomicU64>)>> =
        const { std::cell::RefCell::new(Vec::new()) };
}

/// Tracks, per registered mutator thread, the last transition epoch it has
/// acknowledged by executing a barrier.
pub struct BarrierScheduler {
    epoch: AtomicU64,
    acks: Mutex<Vec<Weak<AtomicU64>>>,
}

impl BarrierScheduler {
    pub fn new() -> Self {
        BarrierScheduler {
            epoch: AtomicU64::new(0),
            acks: Mutex::new(Vec::new()),
        }
    }

    fn ack_slot(&self, heap_id: usize) -> Arc<AtomicU64> {
        ACK_SLOT.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some((_, slot)) = cache.iter().find(|(id, _)| *id == heap_id) {
                return slot.clone();
            }
            let slot = Arc::new(AtomicU64::new(self.epoch.load(Ordering::Relaxed)));
            self.acks.lock().push(Arc::downgrade(&slot));
            cache.push((heap_id, slot.clone()));
            slot
        })
    }

    /// Called from the barrier fast path on every load/store/allocate.
    /// Cheap: a thread-local lookup plus a relaxed store.
    #[inline]
    pub fn ack(&self, heap_id: usize) {
        let slot = self.ack_slot(heap_id);
        slot.store(self.epoch.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Bumps the transition epoch; barriers executed after this call will
    /// ack the new epoch.
    pub fn begin_transition(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Blocks (bounded) until every live mutator has acked `target_epoch`.
    /// Dead thread-local slots (threads that exited) are pruned lazily, as
    /// they are observed, driven by `Weak` upgrade failure rather than an
    /// explicit deregistration call.
    pub fn wait_for_handshake(&self, target_epoch: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let mut pending = false;
            self.acks.lock().retain(|weak| match weak.upgrade() {
                Some(slot) => {
                    if slot.load(Ordering::Relaxed) < target_epoch {
                        pending = true;
                    }
                    true
                }
                None => false,
            });
            if !pending {
                return;
            }
            if Instant::now() >= deadline {
                log::warn!("barrier handshake timed out waiting for epoch {target_epoch}");
                return;
            }
            std::thread::yield_now();
        }
    }

    pub fn registered_count(&self) -> usize {
        self.acks.lock().iter().filter(|w| w.upgrade().is_some()).count()
    }
}

impl Default for BarrierScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[test]
    fn handshake_completes_once_single_thread_acks() {
        let sched = StdArc::new(BarrierScheduler::new());
        sched.ack(1);
        let target = sched.begin_transition();
        sched.ack(1);
        sched.wait_for_handshake(target, Duration::from_millis(200));
        assert!(sched.registered_count() >= 1);
    }

    #[test]
    fn handshake_waits_for_concurrent_mutator() {
        let sched = StdArc::new(BarrierScheduler::new());
        sched.ack(7);
        let target = sched.begin_transition();
        let sched2 = sched.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sched2.ack(7);
        });
        sched.wait_for_handshake(target, Duration::from_secs(2));
        handle.join().unwrap();
    }
}
