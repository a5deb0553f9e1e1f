// Memory budget enforcement
//
// Every charged VM allocation asks the tracker first. Frees and shrinks are
// always granted; growth is granted while the budget holds, while a
// bookkeeping bracket forces success, or after a garbage-collection callback
// has made room.

use std::cell::{Cell, RefCell};

use tracing::debug;

type GcCallback = Box<dyn FnMut()>;

pub struct AllocationTracker {
    budget: Cell<usize>,
    used: Cell<usize>,
    peak: Cell<usize>,
    rejections: Cell<u64>,
    gc_callback: RefCell<Option<GcCallback>>,
}

impl AllocationTracker {
    pub fn new(budget: usize) -> Self {
        AllocationTracker {
            budget: Cell::new(budget),
            used: Cell::new(0),
            peak: Cell::new(0),
            rejections: Cell::new(0),
            gc_callback: RefCell::new(None),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget.get()
    }

    /// Lowering the budget below current usage only affects future growth.
    pub fn set_budget(&self, budget: usize) {
        self.budget.set(budget);
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.get()
    }

    /// Installs the callback run when growth would exceed the budget.
    pub fn set_gc_callback(&self, callback: Option<GcCallback>) {
        *self.gc_callback.borrow_mut() = callback;
    }

    /// Decides one reallocation from `old_size` to `new_size` bytes.
    pub fn request(&self, old_size: usize, new_size: usize, forced: bool) -> bool {
        if new_size <= old_size {
            self.release(old_size - new_size);
            return true;
        }
        let delta = new_size - old_size;
        if forced || self.fits(delta) {
            self.charge(delta);
            return true;
        }
        if self.collect() && self.fits(delta) {
            self.charge(delta);
            return true;
        }
        self.rejections.set(self.rejections.get() + 1);
        debug!(
            requested = delta,
            used = self.used.get(),
            budget = self.budget.get(),
            "allocation rejected"
        );
        false
    }

    fn fits(&self, delta: usize) -> bool {
        self.used
            .get()
            .checked_add(delta)
            .is_some_and(|total| total <= self.budget.get())
    }

    fn charge(&self, delta: usize) {
        let used = self.used.get().saturating_add(delta);
        self.used.set(used);
        if used > self.peak.get() {
            self.peak.set(used);
        }
    }

    fn release(&self, delta: usize) {
        self.used.set(self.used.get().saturating_sub(delta));
    }

    // The callback is taken out while it runs, so it may allocate or free
    // through this tracker without re-entering itself.
    fn collect(&self) -> bool {
        let Some(mut callback) = self.gc_callback.borrow_mut().take() else {
            return false;
        };
        callback();
        let mut slot = self.gc_callback.borrow_mut();
        if slot.is_none() {
            *slot = Some(callback);
        }
        true
    }
}
