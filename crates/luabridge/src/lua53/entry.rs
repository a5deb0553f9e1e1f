// C entry points the interpreter calls back into.
//
// `lua_error`, `lua_yieldk` and errors thrown inside `lua_callk` unwind with
// `longjmp`, which skips destructors. Rust work is therefore done in
// `run_*` helpers that return a plain `Step`; the extern functions and
// `finish` hold nothing that needs dropping when they hand control back to
// the interpreter.

use std::mem;
use std::os::raw::{c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

use tracing::error;

use super::Lua53;
use super::ffi::*;
use crate::lua_vm::{
    ApiResult, ContinuationFn, LuaApi, NativeFn, NativeResult, NativeReturn, VmStatus,
};

/// What the entry point does once the Rust side has returned.
#[derive(Clone, Copy)]
enum Step {
    Return(c_int),
    Raise,
    Call {
        nargs: c_int,
        nresults: c_int,
        protected: bool,
        ctx: isize,
        k: ContinuationFn,
    },
    Yield {
        nresults: c_int,
        ctx: isize,
        k: Option<ContinuationFn>,
    },
}

pub(super) fn vm_status(status: c_int) -> VmStatus {
    match status {
        LUA_OK => VmStatus::Ok,
        LUA_YIELD => VmStatus::Yield,
        LUA_ERRSYNTAX => VmStatus::SyntaxError,
        LUA_ERRMEM => VmStatus::MemoryError,
        _ => VmStatus::RuntimeError,
    }
}

/// Every native closure: upvalue 1 holds the `NativeFn`, the closure's own
/// upvalues follow.
pub(super) unsafe extern "C-unwind" fn native_entry(state: *mut lua_State) -> c_int {
    let step = unsafe { run_native(state) };
    unsafe { finish(state, step) }
}

/// Re-entry point after `lua_callk` / `lua_pcallk` / `lua_yieldk`. The
/// Rust continuation sits at the bottom of the frame.
unsafe extern "C-unwind" fn continue_entry(
    state: *mut lua_State,
    status: c_int,
    ctx: lua_KContext,
) -> c_int {
    let step = unsafe { run_continuation(state, status, ctx) };
    unsafe { finish(state, step) }
}

unsafe fn finish(state: *mut lua_State, mut step: Step) -> c_int {
    // Calls that return without yielding come back here and loop, so a chain
    // of continuations runs at constant host stack depth.
    loop {
        match step {
            Step::Return(n) => return n,
            Step::Raise => unsafe { lua_error(state) },
            Step::Call {
                nargs,
                nresults,
                protected,
                ctx,
                k,
            } => {
                unsafe { park(state, k) };
                let status = if protected {
                    unsafe { lua_pcallk(state, nargs, nresults, 0, ctx, Some(continue_entry)) }
                } else {
                    unsafe { lua_callk(state, nargs, nresults, ctx, Some(continue_entry)) };
                    LUA_OK
                };
                step = unsafe { run_continuation(state, status, ctx) };
            }
            Step::Yield {
                nresults,
                ctx,
                k: Some(k),
            } => {
                unsafe { park(state, k) };
                return unsafe { lua_yieldk(state, nresults, ctx, Some(continue_entry)) };
            }
            Step::Yield { nresults, k: None, .. } => {
                return unsafe { lua_yieldk(state, nresults, 0, None) };
            }
        }
    }
}

/// Stores `k` at the bottom of the frame, where the interpreter keeps it
/// across the call or yield.
unsafe fn park(state: *mut lua_State, k: ContinuationFn) {
    unsafe {
        reserve(state, 1);
        lua_pushlightuserdata(state, k as *mut c_void);
        lua_rotate(state, 1, 1);
    }
}

unsafe fn run_native(state: *mut lua_State) -> Step {
    let raw = unsafe { lua_touserdata(state, lua_upvalueindex(1)) };
    if raw.is_null() {
        return unsafe { raise_message(state, "native closure without a function") };
    }
    // SAFETY: upvalue 1 of a `native_entry` closure is always a `NativeFn`.
    let f = unsafe { mem::transmute::<*mut c_void, NativeFn>(raw) };
    let Some(mut api) = (unsafe { Lua53::borrowed(state) }) else {
        return Step::Return(0);
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| f(&mut api)));
    unsafe { settle(state, outcome) }
}

unsafe fn run_continuation(state: *mut lua_State, status: c_int, ctx: isize) -> Step {
    let raw = unsafe { lua_touserdata(state, 1) };
    unsafe { lua_rotate(state, 1, -1) };
    unsafe { lua_settop(state, -2) };
    if raw.is_null() {
        return unsafe { raise_message(state, "continuation lost its frame") };
    }
    // SAFETY: `park` stored a `ContinuationFn` in this slot.
    let k = unsafe { mem::transmute::<*mut c_void, ContinuationFn>(raw) };
    let Some(mut api) = (unsafe { Lua53::borrowed(state) }) else {
        return Step::Return(0);
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| k(&mut api, vm_status(status), ctx)));
    unsafe { settle(state, outcome) }
}

unsafe fn settle(state: *mut lua_State, outcome: std::thread::Result<NativeResult>) -> Step {
    match outcome {
        Ok(Ok(NativeReturn::Return(n))) => Step::Return(n.clamp(0, unsafe { lua_gettop(state) })),
        Ok(Ok(NativeReturn::CallK {
            nargs,
            nresults,
            ctx,
            k,
        })) => Step::Call {
            nargs,
            nresults,
            protected: false,
            ctx,
            k,
        },
        Ok(Ok(NativeReturn::PCallK {
            nargs,
            nresults,
            ctx,
            k,
        })) => Step::Call {
            nargs,
            nresults,
            protected: true,
            ctx,
            k,
        },
        Ok(Ok(NativeReturn::YieldK { nresults, ctx, k })) => Step::Yield { nresults, ctx, k },
        Ok(Err(_)) => Step::Raise,
        Err(_) => {
            error!("native function panicked");
            unsafe { raise_message(state, "native function panicked") }
        }
    }
}

unsafe fn raise_message(state: *mut lua_State, message: &'static str) -> Step {
    unsafe {
        reserve(state, 1);
        lua_pushlstring(state, message.as_ptr().cast(), message.len());
    }
    Step::Raise
}

unsafe fn reserve(state: *mut lua_State, n: c_int) -> bool {
    match unsafe { Lua53::borrowed(state) } {
        Some(api) => api.reserve(n),
        None => unsafe { lua_checkstack(state, n) != 0 },
    }
}

/// Count hook. An `Err` from the Rust hook raises its message here.
pub(super) unsafe extern "C-unwind" fn hook_entry(state: *mut lua_State, _ar: *mut lua_Debug) {
    if unsafe { run_hook(state) }.is_err() {
        unsafe { lua_error(state) }
    }
}

unsafe fn run_hook(state: *mut lua_State) -> ApiResult<()> {
    let Some(mut api) = (unsafe { Lua53::borrowed(state) }) else {
        return Ok(());
    };
    let Some(hook) = api.shared().hook.get() else {
        return Ok(());
    };
    catch_unwind(AssertUnwindSafe(|| hook(&mut api))).unwrap_or(Ok(()))
}

// ===== Protected helpers =====
//
// Operations that allocate can raise a memory error. They run as C
// functions under `lua_pcall` (see `Lua53::protect`) so the error comes back
// as a status instead of unwinding through Rust frames.

/// `(ptr, len) -> string`
pub(super) unsafe extern "C-unwind" fn push_string_raw(state: *mut lua_State) -> c_int {
    unsafe {
        let bytes = lua_touserdata(state, 1);
        let len = lua_tointegerx(state, 2, ptr::null_mut()) as usize;
        lua_pushlstring(state, bytes.cast(), len);
    }
    1
}

/// `(narr, nrec) -> table`
pub(super) unsafe extern "C-unwind" fn create_table_raw(state: *mut lua_State) -> c_int {
    unsafe {
        let narr = lua_tointegerx(state, 1, ptr::null_mut()) as c_int;
        let nrec = lua_tointegerx(state, 2, ptr::null_mut()) as c_int;
        lua_createtable(state, narr, nrec);
    }
    1
}

/// `(payload) -> userdata`
pub(super) unsafe extern "C-unwind" fn new_userdata_raw(state: *mut lua_State) -> c_int {
    unsafe {
        let payload = lua_tointegerx(state, 1, ptr::null_mut()) as u64;
        let block = lua_newuserdata(state, mem::size_of::<u64>()) as *mut u64;
        block.write_unaligned(payload);
    }
    1
}

/// `(t, k, v)`
pub(super) unsafe extern "C-unwind" fn raw_set_raw(state: *mut lua_State) -> c_int {
    unsafe { lua_rawset(state, 1) };
    0
}

/// `(t, n, v)`
pub(super) unsafe extern "C-unwind" fn raw_seti_raw(state: *mut lua_State) -> c_int {
    unsafe {
        let n = lua_tointegerx(state, 2, ptr::null_mut());
        lua_rawseti(state, 1, n);
    }
    0
}

/// `(v) -> ref`
pub(super) unsafe extern "C-unwind" fn reference_raw(state: *mut lua_State) -> c_int {
    unsafe {
        let reference = luaL_ref(state, LUA_REGISTRYINDEX);
        lua_pushinteger(state, reference as lua_Integer);
    }
    1
}

/// `(ref)`
pub(super) unsafe extern "C-unwind" fn unreference_raw(state: *mut lua_State) -> c_int {
    unsafe {
        let reference = lua_tointegerx(state, 1, ptr::null_mut()) as c_int;
        luaL_unref(state, LUA_REGISTRYINDEX, reference);
    }
    0
}

/// `(f) -> thread`
pub(super) unsafe extern "C-unwind" fn new_thread_raw(state: *mut lua_State) -> c_int {
    unsafe {
        let thread = lua_newthread(state);
        lua_pushvalue(state, 1);
        lua_xmove(state, thread, 1);
    }
    1
}

/// `(fn, upvalues...) -> closure`
pub(super) unsafe extern "C-unwind" fn closure_raw(state: *mut lua_State) -> c_int {
    unsafe {
        let n = lua_gettop(state);
        lua_pushcclosure(state, native_entry, n);
    }
    1
}

pub(super) unsafe extern "C-unwind" fn collect_raw(state: *mut lua_State) -> c_int {
    unsafe { lua_gc(state, LUA_GCCOLLECT, 0) };
    0
}

/// Opens the libraries scripts get. File, process, module and debug access
/// stay with the host.
pub(super) unsafe extern "C-unwind" fn open_libraries(state: *mut lua_State) -> c_int {
    let libraries: [(&std::ffi::CStr, lua_CFunction); 6] = [
        (c"_G", luaopen_base),
        (c"coroutine", luaopen_coroutine),
        (c"table", luaopen_table),
        (c"string", luaopen_string),
        (c"math", luaopen_math),
        (c"utf8", luaopen_utf8),
    ];
    for (name, open) in libraries {
        unsafe {
            luaL_requiref(state, name.as_ptr(), open, 1);
            lua_settop(state, -2);
        }
    }
    for name in [c"dofile", c"loadfile"] {
        unsafe {
            lua_pushnil(state);
            lua_setglobal(state, name.as_ptr());
        }
    }
    0
}

/// `lua_Writer` appending to a `Vec<u8>`.
pub(super) unsafe extern "C-unwind" fn write_chunk(
    _state: *mut lua_State,
    p: *const c_void,
    sz: usize,
    ud: *mut c_void,
) -> c_int {
    // SAFETY: `ud` is the Vec passed to lua_dump by `Lua53::dump`.
    let out = unsafe { &mut *(ud as *mut Vec<u8>) };
    if sz > 0 {
        out.extend_from_slice(unsafe { std::slice::from_raw_parts(p.cast::<u8>(), sz) });
    }
    0
}
