//! Centralized bridge limits and configuration constants.
//!
//! All magic numbers that control marshaling, the resource governor and
//! the binary codec are collected here for easy tuning.

// ===== Resource Governor =====

/// Default total memory budget for one machine (bytes).
pub const DEFAULT_MEMORY_BUDGET: usize = 64 * 1024 * 1024;

/// Instructions a script may execute before the first (soft) timeout.
pub const DEFAULT_SOFT_INSTRUCTION_LIMIT: u64 = 10_000_000;

/// Additional instructions allowed after the soft timeout before the hard one.
pub const DEFAULT_HARD_INSTRUCTION_LIMIT: u64 = 1_000_000;

/// How many instructions run between two count-hook invocations.
pub const DEFAULT_HOOK_PERIOD: u32 = 1000;

/// Error message raised when the soft instruction limit is reached.
pub const SOFT_TIMEOUT_MESSAGE: &str = "Script timed out";

/// Error message raised when a script keeps running after the soft timeout.
pub const HARD_TIMEOUT_MESSAGE: &str = "Script timed out (hard limit)";

// ===== Marshaling =====

/// Arguments stored inline before an argument list spills to the heap.
pub const INLINE_ARGS: usize = 4;

/// Name of the metatable field carrying a host object's type name.
pub const TYPE_NAME_FIELD: &str = "__name";

/// Maximum table nesting copied across the boundary in either direction.
pub const MAX_MARSHAL_DEPTH: usize = 200;

// ===== BLON =====

/// Strings up to this length go through the string back-reference cache.
pub const BLON_CACHED_STRING_MAX: usize = 32;

/// Slots in the string back-reference cache (replaced round-robin).
pub const BLON_CACHE_SLOTS: usize = 256;

/// Maximum number of values in an encoded argument list.
pub const BLON_MAX_ARGS: usize = u8::MAX as usize;

/// Maximum table nesting accepted by the decoder.
pub const MAX_DECODE_DEPTH: usize = 200;
