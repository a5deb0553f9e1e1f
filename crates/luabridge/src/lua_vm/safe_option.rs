use crate::lua_vm::lua_limits::{
    DEFAULT_HARD_INSTRUCTION_LIMIT, DEFAULT_HOOK_PERIOD, DEFAULT_MEMORY_BUDGET,
    DEFAULT_SOFT_INSTRUCTION_LIMIT,
};

/// When the instruction counter of the timeout monitor starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimeoutReset {
    /// Every top-level host call starts with a fresh budget.
    PerCall,
    /// Only `LuaMachine::reset_timeout` restarts the budget.
    Manual,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MachineOptions {
    /// Maximum bytes the VM may hold through the allocator hook
    pub total_memory_budget: usize,
    pub enforce_time_limits: bool,
    /// Whether the `load` global accepts precompiled chunks
    pub allow_bytecode_loading: bool,
    pub soft_instruction_limit: u64,
    /// Instructions allowed after the soft timeout fired
    pub hard_instruction_limit: u64,
    pub hook_period: u32,
    pub timeout_reset: TimeoutReset,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            total_memory_budget: DEFAULT_MEMORY_BUDGET,
            enforce_time_limits: true,
            allow_bytecode_loading: false,
            soft_instruction_limit: DEFAULT_SOFT_INSTRUCTION_LIMIT,
            hard_instruction_limit: DEFAULT_HARD_INSTRUCTION_LIMIT,
            hook_period: DEFAULT_HOOK_PERIOD,
            timeout_reset: TimeoutReset::PerCall,
        }
    }
}

impl MachineOptions {
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.total_memory_budget = bytes;
        self
    }

    pub fn with_time_limits(mut self, enforce: bool) -> Self {
        self.enforce_time_limits = enforce;
        self
    }

    pub fn with_instruction_limits(mut self, soft: u64, hard: u64) -> Self {
        self.soft_instruction_limit = soft;
        self.hard_instruction_limit = hard;
        self
    }

    pub fn with_bytecode_loading(mut self, allow: bool) -> Self {
        self.allow_bytecode_loading = allow;
        self
    }

    pub fn with_hook_period(mut self, period: u32) -> Self {
        self.hook_period = period.max(1);
        self
    }

    pub fn with_timeout_reset(mut self, reset: TimeoutReset) -> Self {
        self.timeout_reset = reset;
        self
    }
}
