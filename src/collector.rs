//! Generational controller: a single background thread that drives one
//! mark/relocate cycle at a time, coordinating with mutators purely
//! through [`crate::safepoint::BarrierScheduler`] handshakes rather than a
//! stop-the-world pause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::barrier::BarrierContext;
use crate::color::ColorState;
use crate::globals::{
    DEFAULT_RELOCATION_THRESHOLD, DEFAULT_TENURE_THRESHOLD, PAGE_SIZE, RECLAIM_DELAY_CYCLES,
};
use crate::handle::{Generation, HandlePool};
use crate::mark_stack::{MarkStack, RootSet};
use crate::marker::Marker;
use crate::page::{Page, PageState};
use crate::relocator::{RelocationSet, Relocator};
use crate::remembered_set::RememberedSet;
use crate::safepoint::BarrierScheduler;

/// Tunables for a [`crate::heap::Heap`]: a plain struct with a `Default`
/// impl rather than a config file.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    pub tenure_threshold: u8,
    pub relocation_threshold: f64,
    pub reclaim_delay_cycles: u32,
    pub min_heap_pages: usize,
    /// Must equal [`PAGE_SIZE`]: the colored-pointer addressing scheme
    /// recovers a page's owning `Page` from any payload pointer with a
    /// compile-time mask (`PAGE_BASE_MASK`), so the granularity can't
    /// actually vary per heap. Kept as a field (rather than dropped) so a
    /// mismatched value is rejected loudly instead of silently ignored.
    pub page_size: usize,
    /// Bound on how long a phase transition waits for a slow mutator to
    /// acknowledge before logging and proceeding anyway.
    pub handshake_timeout: Duration,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            tenure_threshold: DEFAULT_TENURE_THRESHOLD,
            relocation_threshold: DEFAULT_RELOCATION_THRESHOLD,
            reclaim_delay_cycles: RECLAIM_DELAY_CYCLES,
            min_heap_pages: crate::globals::DEFAULT_INITIAL_PAGES,
            page_size: PAGE_SIZE,
            handshake_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CycleKind {
    Minor,
    Major,
}

/// Shared state the collector thread and mutator-facing `Heap` both need a
/// handle to. Held behind `Arc` so the background thread can outlive a
/// single `&Heap` borrow.
pub struct CollectorShared {
    pub colors: ColorState,
    pub mark_stack: MarkStack,
    pub root_set: RootSet,
    pub remembered_set: RememberedSet,
    pub handles: HandlePool,
    pub scheduler: BarrierScheduler,
    pub young_pages: Mutex<Vec<*mut Page>>,
    pub old_pages: Mutex<Vec<*mut Page>>,
    pub config: HeapConfig,
    shutdown: AtomicBool,
}

unsafe impl Send for CollectorShared {}
unsafe impl Sync for CollectorShared {}

impl CollectorShared {
    pub fn new(config: HeapConfig) -> Self {
        assert_eq!(
            config.page_size, PAGE_SIZE,
            "page_size is fixed by the colored-pointer addressing scheme and cannot be overridden"
        );
        CollectorShared {
            colors: ColorState::new(),
            mark_stack: MarkStack::new(),
            root_set: RootSet::new(),
            remembered_set: RememberedSet::new(),
            handles: HandlePool::new(),
            scheduler: BarrierScheduler::new(),
            young_pages: Mutex::new(Vec::new()),
            old_pages: Mutex::new(Vec::new()),
            config,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn barrier(&self) -> BarrierContext<'_> {
        BarrierContext {
            colors: &self.colors,
            mark_stack: &self.mark_stack,
            remembered_set: &self.remembered_set,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn mark_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn pages_for(&self, generation: Generation) -> &Mutex<Vec<*mut Page>> {
        match generation {
            Generation::Young => &self.young_pages,
            Generation::Old => &self.old_pages,
        }
    }

    /// Reserves a fresh page, aborting the process on mmap failure. Used
    /// for startup reservation and mid-relocation destinations, where
    /// there is no sensible way to surface a `GcResult` to the caller.
    pub fn new_page(&self, generation: Generation) -> *mut Page {
        self.try_new_page(generation)
            .unwrap_or_else(|| crate::error::fatal("page mmap failed"))
    }

    /// Reserves a fresh page, returning `None` on mmap failure instead of
    /// aborting. Used by `Heap::allocate`'s assist-cycle-then-retry path.
    pub fn try_new_page(&self, generation: Generation) -> Option<*mut Page> {
        let page = Page::create(generation)?;
        self.pages_for(generation).lock().push(page);
        Some(page)
    }

    /// Runs one full cycle synchronously on the calling thread. Used both
    /// by the background driver and by `Heap::minor_gc`/`major_gc` for a
    /// caller-requested (synchronous) collection.
    pub fn run_cycle(&self, kind: CycleKind) {
        let minor = kind == CycleKind::Minor;
        log::info!("GC cycle start: {kind:?}");

        for generation_pages in self.scan_generations(minor) {
            for &page in generation_pages.iter() {
                unsafe { (*page).mark_bitmap.clear() };
            }
        }
        for handle in self.handles.snapshot() {
            if !minor || handle.generation() == Generation::Young {
                handle.set_collector_reachable(false);
            }
        }

        self.colors.begin_mark();
        let mark_color = self.colors.good_color();
        let epoch = self.scheduler.begin_transition();
        self.scheduler.wait_for_handshake(epoch, self.config.handshake_timeout);

        let marker = Marker {
            colors: &self.colors,
            mark_stack: &self.mark_stack,
            root_set: &self.root_set,
            remembered_set: &self.remembered_set,
        };
        let marked = marker.run(minor);
        log::debug!("mark phase marked {marked} handles");

        let mut candidates = self.young_pages.lock().clone();
        if !minor {
            candidates.extend(self.old_pages.lock().iter().copied());
        }
        for &page in &candidates {
            unsafe {
                if (*page).state() == PageState::Active {
                    (*page).retire();
                }
            }
        }
        let relocation_set = RelocationSet::select(&candidates, self.config.relocation_threshold);

        self.colors.begin_relocate();
        let epoch = self.scheduler.begin_transition();
        self.scheduler.wait_for_handshake(epoch, self.config.handshake_timeout);

        if !relocation_set.pages.is_empty() {
            let live_handles: Vec<_> = self
                .handles
                .snapshot()
                .into_iter()
                .filter(|h| h.is_marked_reachable())
                .collect();
            let relocator = Relocator {
                tenure_threshold: self.config.tenure_threshold,
                reclaim_delay_cycles: self.config.reclaim_delay_cycles,
            };
            relocator.relocate(&relocation_set, &live_handles, |generation| self.new_page(generation));
        }

        self.colors.end_relocate(mark_color);

        self.sweep_unreachable();
        self.tick_reclamation();

        log::info!("GC cycle end: {kind:?}");
    }

    fn scan_generations(&self, minor: bool) -> Vec<Vec<*mut Page>> {
        if minor {
            vec![self.young_pages.lock().clone()]
        } else {
            vec![self.young_pages.lock().clone(), self.old_pages.lock().clone()]
        }
    }

    fn sweep_unreachable(&self) {
        for handle in self.handles.snapshot() {
            if handle.is_destructible() && handle.try_mark_destroyed() {
                self.handles.recycle(handle);
            }
        }
    }

    fn tick_reclamation(&self) {
        for pages in [&self.young_pages, &self.old_pages] {
            let mut pages = pages.lock();
            let mut reclaimed = Vec::new();
            pages.retain(|&page| unsafe {
                if (*page).state() == PageState::Relocating && (*page).tick_reclaim_countdown() {
                    (*page).mark_reclaimed();
                    reclaimed.push(page);
                    false
                } else {
                    true
                }
            });
            drop(pages);
            for page in reclaimed {
                unsafe { Page::destroy(page) };
            }
        }
    }
}

/// Background driver thread. Mutators request a cycle by calling
/// [`Collector::request`]; the thread wakes, runs it, and goes back to
/// sleep. `stop` joins the thread after one last drain.
pub struct Collector {
    shared: Arc<CollectorShared>,
    trigger: Arc<(Mutex<Option<CycleKind>>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Collector {
    pub fn spawn(shared: Arc<CollectorShared>) -> Self {
        let trigger = Arc::new((Mutex::new(None::<CycleKind>), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_shared = shared.clone();
        let thread_trigger = trigger.clone();
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("gc-collector".into())
            .spawn(move || loop {
                let kind = {
                    let (lock, cvar) = &*thread_trigger;
                    let mut guard = lock.lock();
                    while guard.is_none() && !thread_shutdown.load(Ordering::Acquire) {
                        cvar.wait(&mut guard);
                    }
                    if thread_shutdown.load(Ordering::Acquire) && guard.is_none() {
                        return;
                    }
                    guard.take().unwrap()
                };
                thread_shared.run_cycle(kind);
            })
            .expect("failed to spawn gc-collector thread");

        Collector {
            shared,
            trigger,
            shutdown,
            thread: Some(handle),
        }
    }

    pub fn request(&self, kind: CycleKind) {
        let (lock, cvar) = &*self.trigger;
        *lock.lock() = Some(kind);
        cvar.notify_one();
    }

    pub fn shared(&self) -> &CollectorShared {
        &self.shared
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.trigger.1.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
