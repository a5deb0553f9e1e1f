// Instruction-count timeouts
//
// The VM's count hook reports every `hook_period` instructions. After
// `soft_limit` instructions the soft timeout fires once; the counter then
// starts over, and every `hard_limit` further instructions the hard timeout
// fires. A reset re-arms the soft stage.

use std::cell::Cell;

use crate::lua_vm::TimeoutStage;

pub struct TimeoutMonitor {
    enabled: Cell<bool>,
    soft_limit: Cell<u64>,
    hard_limit: Cell<u64>,
    since_reset: Cell<u64>,
    total: Cell<u64>,
    soft_fired: Cell<bool>,
}

impl TimeoutMonitor {
    pub fn new(enabled: bool, soft_limit: u64, hard_limit: u64) -> Self {
        TimeoutMonitor {
            enabled: Cell::new(enabled),
            soft_limit: Cell::new(soft_limit),
            hard_limit: Cell::new(hard_limit),
            since_reset: Cell::new(0),
            total: Cell::new(0),
            soft_fired: Cell::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn set_limits(&self, soft_limit: u64, hard_limit: u64) {
        self.soft_limit.set(soft_limit);
        self.hard_limit.set(hard_limit);
    }

    pub fn limits(&self) -> (u64, u64) {
        (self.soft_limit.get(), self.hard_limit.get())
    }

    /// Instructions counted since the last reset.
    pub fn instructions_since_reset(&self) -> u64 {
        self.since_reset.get()
    }

    /// Instructions reported since the monitor was created.
    pub fn total_instructions(&self) -> u64 {
        self.total.get()
    }

    pub fn soft_fired(&self) -> bool {
        self.soft_fired.get()
    }

    pub fn reset(&self) {
        self.since_reset.set(0);
        self.soft_fired.set(false);
    }

    /// Accounts `executed` instructions and reports a timeout if one is due.
    /// While `suppressed` the count still advances but nothing fires.
    pub fn on_instructions(&self, executed: u64, suppressed: bool) -> Option<TimeoutStage> {
        self.total.set(self.total.get().saturating_add(executed));
        if !self.enabled.get() {
            return None;
        }
        let since = self.since_reset.get().saturating_add(executed);
        self.since_reset.set(since);
        if suppressed {
            return None;
        }
        if !self.soft_fired.get() {
            if since >= self.soft_limit.get() {
                self.since_reset.set(0);
                self.soft_fired.set(true);
                return Some(TimeoutStage::Soft);
            }
        } else if since >= self.hard_limit.get() {
            self.since_reset.set(0);
            return Some(TimeoutStage::Hard);
        }
        None
    }
}
