// Lua embedding bridge
// Marshals values between a Rust host and Lua 5.3, with a memory budget, a
// two-stage instruction timeout and a continuation protocol for host
// functions that call back into scripts or yield.

#[cfg(test)]
mod test;

pub mod blon;
pub mod governor;
pub mod lib_registry;
pub mod lua53;
pub mod lua_value;
pub mod lua_vm;

pub use governor::ResourceGovernor;
pub use lib_registry::{LibraryEntry, LibraryModule};
pub use lua_value::{
    FromLua, IntoLua, LuaArgs, LuaCoroutine, LuaFunction, LuaNativeFunction, LuaObject, LuaString,
    LuaTable, LuaValue, ObjectId, ReleaseQueue,
};
pub use lua_vm::{
    CallOutcome, LuaError, LuaMachine, LuaResult, MachineOptions, ThreadStatus, TimeoutReset,
    TimeoutStage,
};
pub use lua53::Lua53;
