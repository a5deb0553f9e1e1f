// Machine layer: the capability interface, errors, options and the bridge
// state machine driving one interpreter instance.

mod continuation;
mod lua_api;
mod lua_error;
pub mod lua_limits;
mod machine;
mod machine_map;
mod marshal;
mod object_registry;
mod safe_option;
mod trampoline;

pub use continuation::{CallOutcome, Continuation, ContinuationTable};
pub use lua_api::{
    AllocHook, ApiResult, ContinuationFn, HookFn, LoadMode, LuaApi, LuaType, MULTRET, NativeFn,
    NativeResult, NativeReturn, REGISTRY_INDEX, Raised, StateHandle, ThreadStatus, VmStatus,
    upvalue_index,
};
pub use lua_error::{LuaError, LuaResult, TimeoutStage};
pub use machine::LuaMachine;
pub use safe_option::{MachineOptions, TimeoutReset};

#[cfg(test)]
pub(crate) use machine_map::registered_count;
