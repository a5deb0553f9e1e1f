//! Lua 5.3 C API entry points used by the backend.
//!
//! The interpreter itself is compiled and linked by `mlua-sys` (vendored
//! Lua 5.3). Only the functions the backend calls are declared here, with
//! their 5.3 signatures; macros of `lua.h` are written out where they are
//! used.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_int, c_void};

pub use mlua_sys::lua_State;

use crate::lua_vm::REGISTRY_INDEX;

pub type lua_Integer = i64;
pub type lua_Number = f64;
pub type lua_KContext = isize;

pub type lua_CFunction = unsafe extern "C-unwind" fn(state: *mut lua_State) -> c_int;
pub type lua_KFunction =
    unsafe extern "C-unwind" fn(state: *mut lua_State, status: c_int, ctx: lua_KContext) -> c_int;
pub type lua_Hook = unsafe extern "C-unwind" fn(state: *mut lua_State, ar: *mut lua_Debug);
pub type lua_Alloc =
    unsafe extern "C" fn(ud: *mut c_void, ptr: *mut c_void, osize: usize, nsize: usize) -> *mut c_void;
pub type lua_Writer = unsafe extern "C-unwind" fn(
    state: *mut lua_State,
    p: *const c_void,
    sz: usize,
    ud: *mut c_void,
) -> c_int;

// Status codes
pub const LUA_OK: c_int = 0;
pub const LUA_YIELD: c_int = 1;
pub const LUA_ERRSYNTAX: c_int = 3;
pub const LUA_ERRMEM: c_int = 4;

// Basic types
pub const LUA_TNIL: c_int = 0;
pub const LUA_TBOOLEAN: c_int = 1;
pub const LUA_TLIGHTUSERDATA: c_int = 2;
pub const LUA_TNUMBER: c_int = 3;
pub const LUA_TSTRING: c_int = 4;
pub const LUA_TTABLE: c_int = 5;
pub const LUA_TFUNCTION: c_int = 6;
pub const LUA_TUSERDATA: c_int = 7;
pub const LUA_TTHREAD: c_int = 8;

pub const LUA_REGISTRYINDEX: c_int = mlua_sys::LUA_REGISTRYINDEX;
pub const LUA_RIDX_GLOBALS: lua_Integer = 2;
pub const LUA_MASKCOUNT: c_int = 1 << 3;
pub const LUA_GCCOLLECT: c_int = 2;
pub const LUA_IDSIZE: usize = 60;

// The bridge hands registry and upvalue pseudo-indices straight through.
const _: () = assert!(LUA_REGISTRYINDEX == REGISTRY_INDEX);

#[inline]
pub const fn lua_upvalueindex(n: c_int) -> c_int {
    LUA_REGISTRYINDEX - n
}

/// Activation record filled by `lua_getstack` (5.3 layout).
#[repr(C)]
pub struct lua_Debug {
    pub event: c_int,
    pub name: *const c_char,
    pub namewhat: *const c_char,
    pub what: *const c_char,
    pub source: *const c_char,
    pub currentline: c_int,
    pub linedefined: c_int,
    pub lastlinedefined: c_int,
    pub nups: u8,
    pub nparams: u8,
    pub isvararg: c_char,
    pub istailcall: c_char,
    pub short_src: [c_char; LUA_IDSIZE],
    pub i_ci: *mut c_void,
}

// `mlua-sys` declares some of these with its own types for the same layout.
#[allow(clashing_extern_declarations)]
unsafe extern "C-unwind" {
    // state
    pub fn lua_newstate(f: lua_Alloc, ud: *mut c_void) -> *mut lua_State;
    pub fn lua_close(state: *mut lua_State);
    pub fn lua_newthread(state: *mut lua_State) -> *mut lua_State;
    pub fn lua_getallocf(state: *mut lua_State, ud: *mut *mut c_void) -> lua_Alloc;

    // stack
    pub fn lua_absindex(state: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_gettop(state: *mut lua_State) -> c_int;
    pub fn lua_settop(state: *mut lua_State, idx: c_int);
    pub fn lua_pushvalue(state: *mut lua_State, idx: c_int);
    pub fn lua_rotate(state: *mut lua_State, idx: c_int, n: c_int);
    pub fn lua_checkstack(state: *mut lua_State, n: c_int) -> c_int;
    pub fn lua_xmove(from: *mut lua_State, to: *mut lua_State, n: c_int);

    // access
    pub fn lua_type(state: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_isinteger(state: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_toboolean(state: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_tointegerx(state: *mut lua_State, idx: c_int, isnum: *mut c_int) -> lua_Integer;
    pub fn lua_tonumberx(state: *mut lua_State, idx: c_int, isnum: *mut c_int) -> lua_Number;
    pub fn lua_tolstring(state: *mut lua_State, idx: c_int, len: *mut usize) -> *const c_char;
    pub fn lua_rawlen(state: *mut lua_State, idx: c_int) -> usize;
    pub fn lua_tocfunction(state: *mut lua_State, idx: c_int) -> Option<lua_CFunction>;
    pub fn lua_touserdata(state: *mut lua_State, idx: c_int) -> *mut c_void;
    pub fn lua_tothread(state: *mut lua_State, idx: c_int) -> *mut lua_State;
    pub fn lua_topointer(state: *mut lua_State, idx: c_int) -> *const c_void;

    // push
    pub fn lua_pushnil(state: *mut lua_State);
    pub fn lua_pushnumber(state: *mut lua_State, n: lua_Number);
    pub fn lua_pushinteger(state: *mut lua_State, n: lua_Integer);
    pub fn lua_pushlstring(state: *mut lua_State, s: *const c_char, len: usize) -> *const c_char;
    pub fn lua_pushcclosure(state: *mut lua_State, f: lua_CFunction, n: c_int);
    pub fn lua_pushboolean(state: *mut lua_State, b: c_int);
    pub fn lua_pushlightuserdata(state: *mut lua_State, p: *mut c_void);

    // tables
    pub fn lua_rawget(state: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_rawgeti(state: *mut lua_State, idx: c_int, n: lua_Integer) -> c_int;
    pub fn lua_rawset(state: *mut lua_State, idx: c_int);
    pub fn lua_rawseti(state: *mut lua_State, idx: c_int, n: lua_Integer);
    pub fn lua_createtable(state: *mut lua_State, narr: c_int, nrec: c_int);
    pub fn lua_newuserdata(state: *mut lua_State, sz: usize) -> *mut c_void;
    pub fn lua_getmetatable(state: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_setmetatable(state: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_setglobal(state: *mut lua_State, name: *const c_char);
    pub fn lua_next(state: *mut lua_State, idx: c_int) -> c_int;

    // calls and coroutines
    pub fn lua_callk(
        state: *mut lua_State,
        nargs: c_int,
        nresults: c_int,
        ctx: lua_KContext,
        k: Option<lua_KFunction>,
    );
    pub fn lua_pcallk(
        state: *mut lua_State,
        nargs: c_int,
        nresults: c_int,
        errfunc: c_int,
        ctx: lua_KContext,
        k: Option<lua_KFunction>,
    ) -> c_int;
    pub fn lua_yieldk(
        state: *mut lua_State,
        nresults: c_int,
        ctx: lua_KContext,
        k: Option<lua_KFunction>,
    ) -> c_int;
    pub fn lua_resume(state: *mut lua_State, from: *mut lua_State, narg: c_int) -> c_int;
    pub fn lua_status(state: *mut lua_State) -> c_int;
    pub fn lua_error(state: *mut lua_State) -> !;

    // misc
    pub fn lua_gc(state: *mut lua_State, what: c_int, data: c_int) -> c_int;
    pub fn lua_dump(state: *mut lua_State, writer: lua_Writer, data: *mut c_void, strip: c_int) -> c_int;
    pub fn lua_getupvalue(state: *mut lua_State, funcindex: c_int, n: c_int) -> *const c_char;
    pub fn lua_sethook(state: *mut lua_State, f: Option<lua_Hook>, mask: c_int, count: c_int);
    pub fn lua_getstack(state: *mut lua_State, level: c_int, ar: *mut lua_Debug) -> c_int;

    // auxiliary library
    pub fn luaL_loadbufferx(
        state: *mut lua_State,
        buff: *const c_char,
        sz: usize,
        name: *const c_char,
        mode: *const c_char,
    ) -> c_int;
    pub fn luaL_ref(state: *mut lua_State, t: c_int) -> c_int;
    pub fn luaL_unref(state: *mut lua_State, t: c_int, reference: c_int);
    pub fn luaL_requiref(state: *mut lua_State, modname: *const c_char, openf: lua_CFunction, glb: c_int);

    // standard libraries
    pub fn luaopen_base(state: *mut lua_State) -> c_int;
    pub fn luaopen_coroutine(state: *mut lua_State) -> c_int;
    pub fn luaopen_table(state: *mut lua_State) -> c_int;
    pub fn luaopen_string(state: *mut lua_State) -> c_int;
    pub fn luaopen_math(state: *mut lua_State) -> c_int;
    pub fn luaopen_utf8(state: *mut lua_State) -> c_int;
}
