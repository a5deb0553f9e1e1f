//! Resource governor: one memory budget and one instruction budget per
//! machine.
//!
//! The governor is shared (`Rc`) between the machine and the VM, which sees
//! it as its [`AllocHook`]. Host-side bookkeeping (marshaling values,
//! maintaining the object registry) runs inside a [`BookkeepingGuard`]:
//! allocations are forced to succeed and timeouts are held back, so the
//! bridge never fails halfway through its own work.

mod allocator;
mod timeout;

use std::cell::Cell;

use tracing::trace;

pub use allocator::AllocationTracker;
pub use timeout::TimeoutMonitor;

use crate::lua_vm::{AllocHook, MachineOptions, TimeoutStage};

pub struct ResourceGovernor {
    memory: AllocationTracker,
    timeout: TimeoutMonitor,
    hook_period: Cell<u32>,
    bookkeeping_depth: Cell<u32>,
}

impl ResourceGovernor {
    pub fn new(options: &MachineOptions) -> Self {
        ResourceGovernor {
            memory: AllocationTracker::new(options.total_memory_budget),
            timeout: TimeoutMonitor::new(
                options.enforce_time_limits,
                options.soft_instruction_limit,
                options.hard_instruction_limit,
            ),
            hook_period: Cell::new(options.hook_period.max(1)),
            bookkeeping_depth: Cell::new(0),
        }
    }

    pub fn memory(&self) -> &AllocationTracker {
        &self.memory
    }

    pub fn timeout(&self) -> &TimeoutMonitor {
        &self.timeout
    }

    pub fn hook_period(&self) -> u32 {
        self.hook_period.get()
    }

    /// Enters a bookkeeping bracket; nests.
    pub fn bookkeeping(&self) -> BookkeepingGuard<'_> {
        self.bookkeeping_depth.set(self.bookkeeping_depth.get() + 1);
        BookkeepingGuard { governor: self }
    }

    pub fn in_bookkeeping(&self) -> bool {
        self.bookkeeping_depth.get() > 0
    }

    /// Called from the VM count hook once per hook period.
    pub fn on_hook(&self) -> Option<TimeoutStage> {
        let stage = self
            .timeout
            .on_instructions(self.hook_period.get() as u64, self.in_bookkeeping());
        if let Some(stage) = stage {
            trace!(?stage, "instruction limit reached");
        }
        stage
    }
}

impl AllocHook for ResourceGovernor {
    fn realloc(&self, old_size: usize, new_size: usize) -> bool {
        self.memory
            .request(old_size, new_size, self.in_bookkeeping())
    }

    fn realloc_forced(&self, old_size: usize, new_size: usize) {
        self.memory.request(old_size, new_size, true);
    }
}

/// Keeps the governor in bookkeeping mode until dropped.
pub struct BookkeepingGuard<'a> {
    governor: &'a ResourceGovernor,
}

impl Drop for BookkeepingGuard<'_> {
    fn drop(&mut self) {
        let depth = self.governor.bookkeeping_depth.get();
        self.governor.bookkeeping_depth.set(depth.saturating_sub(1));
    }
}
