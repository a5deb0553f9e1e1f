//! Lua 5.3 behind the [`LuaApi`] capability interface.
//!
//! [`Lua53`] owns a `lua_State` created over a gated allocator and opens the
//! script-safe standard libraries (base, coroutine, table, string, math,
//! utf8). Native functions, continuations and the count hook enter Rust
//! through the C functions in `entry`; every operation that can allocate
//! runs protected, so a memory error comes back as a status instead of a
//! `longjmp` through Rust frames.

mod entry;
mod ffi;
mod heap;

use std::ffi::{CStr, CString};
use std::mem::{self, MaybeUninit};
use std::os::raw::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::lua_value::format_number;
use crate::lua_vm::{
    AllocHook, ApiResult, HookFn, LoadMode, LuaApi, LuaError, LuaResult, LuaType, NativeFn,
    REGISTRY_INDEX, Raised, StateHandle, ThreadStatus, VmStatus,
};

use entry::{native_entry, vm_status};
use ffi::*;
use heap::{VmShared, allocate};

/// Reference returned for nil; pushing it yields nil.
pub const LUA_REFNIL: i32 = -1;
/// Never a valid reference.
pub const LUA_NOREF: i32 = -2;

/// A Lua 5.3 interpreter, or a view of one of its threads.
///
/// The value returned by [`Lua53::new`] owns the state and closes it on
/// drop. Native functions receive short-lived views of whichever thread
/// called them.
pub struct Lua53 {
    state: *mut lua_State,
    shared: NonNull<VmShared>,
    owner: bool,
}

impl Lua53 {
    pub fn new() -> LuaResult<Self> {
        let shared = NonNull::from(Box::leak(Box::new(VmShared::new(StateHandle::next()))));
        let state = unsafe { lua_newstate(allocate, shared.as_ptr().cast()) };
        if state.is_null() {
            // SAFETY: leaked above and never handed to an interpreter.
            drop(unsafe { Box::from_raw(shared.as_ptr()) });
            return Err(LuaError::ResourceExhausted);
        }
        let mut vm = Lua53 {
            state,
            shared,
            owner: true,
        };
        if vm.protect(0, 0, entry::open_libraries).is_err() {
            return Err(LuaError::ResourceExhausted);
        }
        debug!(handle = vm.handle().raw(), bytes = vm.memory_in_use(), "lua 5.3 state opened");
        Ok(vm)
    }

    /// A non-owning view of `state`.
    ///
    /// # Safety
    /// `state` must belong to an interpreter created by [`Lua53::new`] that
    /// is still open.
    pub(super) unsafe fn borrowed(state: *mut lua_State) -> Option<Self> {
        let mut ud: *mut c_void = ptr::null_mut();
        unsafe { lua_getallocf(state, &mut ud) };
        NonNull::new(ud.cast::<VmShared>()).map(|shared| Lua53 {
            state,
            shared,
            owner: false,
        })
    }

    pub(super) fn shared(&self) -> &VmShared {
        // SAFETY: the shared block outlives every view of the state.
        unsafe { self.shared.as_ref() }
    }

    /// Makes room for `n` more slots. Growth that would exceed the memory
    /// budget is charged anyway: the stack is the VM's, not the script's.
    pub(super) fn reserve(&self, n: i32) -> bool {
        if unsafe { lua_checkstack(self.state, n) } != 0 {
            return true;
        }
        let _unchecked = self.shared().unchecked();
        unsafe { lua_checkstack(self.state, n) != 0 }
    }

    /// Runs the C function `f` under `lua_pcall` with the top `nargs` values.
    /// On failure the error object is left on top.
    fn protect(&mut self, nargs: i32, nresults: i32, f: lua_CFunction) -> ApiResult<()> {
        self.reserve(2);
        unsafe {
            lua_pushcclosure(self.state, f, 0);
            lua_rotate(self.state, -(nargs + 1), 1);
            match lua_pcallk(self.state, nargs, nresults, 0, 0, None) {
                LUA_OK => Ok(()),
                status => Err(Raised::new(vm_status(status))),
            }
        }
    }

    /// Stack slot for a bridge index. Native closures keep their function
    /// in upvalue 1, so bridge upvalue `n` is C upvalue `n + 1`.
    #[inline]
    fn slot(idx: i32) -> c_int {
        if idx < REGISTRY_INDEX { idx - 1 } else { idx }
    }

    /// Like `slot`, but stable across pushes.
    fn fixed_slot(&self, idx: i32) -> c_int {
        if idx > 0 || idx <= REGISTRY_INDEX {
            Self::slot(idx)
        } else {
            unsafe { lua_absindex(self.state, idx) }
        }
    }

    fn raw_type(&self, slot: c_int) -> c_int {
        unsafe { lua_type(self.state, slot) }
    }

    fn is_native_closure(&self, slot: c_int) -> bool {
        unsafe { lua_tocfunction(self.state, slot) }
            .is_some_and(|f| ptr::fn_addr_eq(f, native_entry as lua_CFunction))
    }

    /// Replaces the top `n` values with an error message.
    fn fail(&mut self, n: i32, message: &str) -> Raised {
        self.set_top(-n - 1);
        match self.push_str(message) {
            Ok(()) => Raised::runtime(),
            Err(raised) => raised,
        }
    }

    fn coroutine_status(&self, co: *mut lua_State) -> ThreadStatus {
        if co == self.state {
            return ThreadStatus::Running;
        }
        match unsafe { lua_status(co) } {
            LUA_YIELD => ThreadStatus::Suspended,
            LUA_OK => {
                let mut ar = MaybeUninit::<lua_Debug>::zeroed();
                if unsafe { lua_getstack(co, 0, ar.as_mut_ptr()) } > 0 {
                    ThreadStatus::Normal
                } else if unsafe { lua_gettop(co) } == 0 {
                    ThreadStatus::Dead
                } else {
                    ThreadStatus::Suspended
                }
            }
            _ => ThreadStatus::Dead,
        }
    }

    fn refuse_resume(&mut self, nargs: i32, message: &str) -> (VmStatus, i32) {
        let raised = self.fail(nargs, message);
        (raised.status(), 1)
    }
}

impl Drop for Lua53 {
    fn drop(&mut self) {
        if self.owner {
            unsafe {
                lua_close(self.state);
                // SAFETY: created by `Lua53::new`; no thread of the state remains.
                drop(Box::from_raw(self.shared.as_ptr()));
            }
        }
    }
}

fn lua_type_of(t: c_int) -> LuaType {
    match t {
        LUA_TNIL => LuaType::Nil,
        LUA_TBOOLEAN => LuaType::Boolean,
        LUA_TLIGHTUSERDATA => LuaType::LightUserdata,
        LUA_TNUMBER => LuaType::Number,
        LUA_TSTRING => LuaType::String,
        LUA_TTABLE => LuaType::Table,
        LUA_TFUNCTION => LuaType::Function,
        LUA_TUSERDATA => LuaType::Userdata,
        LUA_TTHREAD => LuaType::Thread,
        _ => LuaType::None,
    }
}

impl LuaApi for Lua53 {
    fn handle(&self) -> StateHandle {
        self.shared().handle
    }

    // ===== Stack =====

    fn get_top(&self) -> i32 {
        unsafe { lua_gettop(self.state) }
    }

    fn set_top(&mut self, idx: i32) {
        let top = self.get_top();
        if idx > top && !self.reserve(idx - top) {
            return;
        }
        unsafe { lua_settop(self.state, idx) }
    }

    fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            unsafe { lua_absindex(self.state, idx) }
        }
    }

    fn push_value(&mut self, idx: i32) {
        if self.reserve(1) {
            unsafe { lua_pushvalue(self.state, Self::slot(idx)) }
        }
    }

    fn remove(&mut self, idx: i32) {
        unsafe {
            lua_rotate(self.state, Self::slot(idx), -1);
            lua_settop(self.state, -2);
        }
    }

    fn insert(&mut self, idx: i32) {
        unsafe { lua_rotate(self.state, Self::slot(idx), 1) }
    }

    // ===== Access =====

    fn type_of(&self, idx: i32) -> LuaType {
        lua_type_of(self.raw_type(Self::slot(idx)))
    }

    fn is_integer(&self, idx: i32) -> bool {
        unsafe { lua_isinteger(self.state, Self::slot(idx)) != 0 }
    }

    fn to_boolean(&self, idx: i32) -> bool {
        unsafe { lua_toboolean(self.state, Self::slot(idx)) != 0 }
    }

    fn to_integer(&self, idx: i32) -> Option<i64> {
        let mut ok = 0;
        let n = unsafe { lua_tointegerx(self.state, Self::slot(idx), &mut ok) };
        (ok != 0).then_some(n)
    }

    fn to_number(&self, idx: i32) -> Option<f64> {
        let mut ok = 0;
        let n = unsafe { lua_tonumberx(self.state, Self::slot(idx), &mut ok) };
        (ok != 0).then_some(n)
    }

    fn to_bytes(&self, idx: i32) -> Option<Vec<u8>> {
        let slot = Self::slot(idx);
        match self.raw_type(slot) {
            LUA_TSTRING => {
                let mut len = 0;
                let p = unsafe { lua_tolstring(self.state, slot, &mut len) };
                if p.is_null() {
                    return None;
                }
                // SAFETY: Lua strings stay valid while on the stack.
                Some(unsafe { std::slice::from_raw_parts(p.cast::<u8>(), len) }.to_vec())
            }
            // Numbers are formatted here rather than converted in place.
            LUA_TNUMBER => match self.to_integer(idx).filter(|_| self.is_integer(idx)) {
                Some(n) => Some(itoa::Buffer::new().format(n).as_bytes().to_vec()),
                None => self.to_number(idx).map(|n| format_number(n).into_bytes()),
            },
            _ => None,
        }
    }

    fn to_pointer(&self, idx: i32) -> usize {
        unsafe { lua_topointer(self.state, Self::slot(idx)) as usize }
    }

    fn to_light_userdata(&self, idx: i32) -> Option<usize> {
        let slot = Self::slot(idx);
        (self.raw_type(slot) == LUA_TLIGHTUSERDATA)
            .then(|| unsafe { lua_touserdata(self.state, slot) } as usize)
    }

    fn to_userdata(&self, idx: i32) -> Option<u64> {
        let slot = Self::slot(idx);
        if self.raw_type(slot) != LUA_TUSERDATA {
            return None;
        }
        let block = unsafe { lua_touserdata(self.state, slot) } as *const u64;
        // SAFETY: every full userdata of this state is created by `new_userdata`.
        (!block.is_null()).then(|| unsafe { block.read_unaligned() })
    }

    fn to_native(&self, idx: i32) -> Option<NativeFn> {
        let slot = Self::slot(idx);
        if !self.is_native_closure(slot) || !self.reserve(1) {
            return None;
        }
        unsafe {
            if lua_getupvalue(self.state, slot, 1).is_null() {
                return None;
            }
            let raw = lua_touserdata(self.state, -1);
            lua_settop(self.state, -2);
            // SAFETY: upvalue 1 of a native closure is its `NativeFn`.
            (!raw.is_null()).then(|| mem::transmute::<*mut c_void, NativeFn>(raw))
        }
    }

    fn raw_len(&self, idx: i32) -> usize {
        unsafe { lua_rawlen(self.state, Self::slot(idx)) }
    }

    // ===== Push =====

    fn push_nil(&mut self) {
        if self.reserve(1) {
            unsafe { lua_pushnil(self.state) }
        }
    }

    fn push_boolean(&mut self, b: bool) {
        if self.reserve(1) {
            unsafe { lua_pushboolean(self.state, b as c_int) }
        }
    }

    fn push_integer(&mut self, n: i64) {
        if self.reserve(1) {
            unsafe { lua_pushinteger(self.state, n) }
        }
    }

    fn push_number(&mut self, n: f64) {
        if self.reserve(1) {
            unsafe { lua_pushnumber(self.state, n) }
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> ApiResult<()> {
        self.reserve(3);
        unsafe {
            lua_pushlightuserdata(self.state, bytes.as_ptr() as *mut c_void);
            lua_pushinteger(self.state, bytes.len() as lua_Integer);
        }
        self.protect(2, 1, entry::push_string_raw)
    }

    fn push_light_userdata(&mut self, p: usize) {
        if self.reserve(1) {
            unsafe { lua_pushlightuserdata(self.state, p as *mut c_void) }
        }
    }

    fn push_native(&mut self, f: NativeFn, n_upvalues: i32) -> ApiResult<()> {
        self.reserve(3);
        unsafe {
            lua_pushlightuserdata(self.state, f as *mut c_void);
            lua_rotate(self.state, -(n_upvalues + 1), 1);
        }
        self.protect(n_upvalues + 1, 1, entry::closure_raw)
    }

    fn new_userdata(&mut self, payload: u64) -> ApiResult<()> {
        self.push_integer(payload as i64);
        self.protect(1, 1, entry::new_userdata_raw)
    }

    fn get_upvalue(&mut self, func_idx: i32, n: i32) -> bool {
        let slot = Self::slot(func_idx);
        let n = if self.is_native_closure(slot) { n + 1 } else { n };
        self.reserve(1) && !unsafe { lua_getupvalue(self.state, slot, n) }.is_null()
    }

    // ===== Tables =====

    fn create_table(&mut self, narr: usize, nrec: usize) -> ApiResult<()> {
        self.push_integer(narr.min(c_int::MAX as usize) as i64);
        self.push_integer(nrec.min(c_int::MAX as usize) as i64);
        self.protect(2, 1, entry::create_table_raw)
    }

    fn raw_get(&mut self, idx: i32) -> LuaType {
        let slot = Self::slot(idx);
        if self.raw_type(slot) != LUA_TTABLE {
            self.pop(1);
            self.push_nil();
            return LuaType::Nil;
        }
        lua_type_of(unsafe { lua_rawget(self.state, slot) })
    }

    fn raw_set(&mut self, idx: i32) -> ApiResult<()> {
        let table = self.fixed_slot(idx);
        if self.raw_type(table) != LUA_TTABLE {
            return Err(self.fail(2, "table expected"));
        }
        self.reserve(2);
        unsafe {
            lua_pushvalue(self.state, table);
            lua_rotate(self.state, -3, 1);
        }
        self.protect(3, 0, entry::raw_set_raw)
    }

    fn raw_geti(&mut self, idx: i32, n: i64) -> LuaType {
        let slot = Self::slot(idx);
        if self.raw_type(slot) != LUA_TTABLE || !self.reserve(1) {
            self.push_nil();
            return LuaType::Nil;
        }
        lua_type_of(unsafe { lua_rawgeti(self.state, slot, n) })
    }

    fn raw_seti(&mut self, idx: i32, n: i64) -> ApiResult<()> {
        let table = self.fixed_slot(idx);
        if self.raw_type(table) != LUA_TTABLE {
            return Err(self.fail(1, "table expected"));
        }
        self.reserve(3);
        unsafe {
            lua_pushvalue(self.state, table);
            lua_rotate(self.state, -2, 1);
            lua_pushinteger(self.state, n);
            lua_rotate(self.state, -2, 1);
        }
        self.protect(3, 0, entry::raw_seti_raw)
    }

    fn next(&mut self, idx: i32) -> bool {
        let slot = Self::slot(idx);
        if self.raw_type(slot) != LUA_TTABLE || !self.reserve(2) {
            self.pop(1);
            return false;
        }
        unsafe { lua_next(self.state, slot) != 0 }
    }

    fn get_global(&mut self, name: &str) -> LuaType {
        self.reserve(3);
        unsafe { lua_rawgeti(self.state, LUA_REGISTRYINDEX, LUA_RIDX_GLOBALS) };
        if self.push_str(name).is_err() {
            self.pop(2);
            self.push_nil();
            return LuaType::Nil;
        }
        let found = lua_type_of(unsafe { lua_rawget(self.state, -2) });
        self.remove(-2);
        found
    }

    fn set_global(&mut self, name: &str) -> ApiResult<()> {
        self.reserve(3);
        unsafe {
            lua_rawgeti(self.state, LUA_REGISTRYINDEX, LUA_RIDX_GLOBALS);
            lua_rotate(self.state, -2, 1);
        }
        if let Err(raised) = self.push_str(name) {
            unsafe {
                lua_rotate(self.state, -3, 1);
                lua_settop(self.state, -3);
            }
            return Err(raised);
        }
        unsafe { lua_rotate(self.state, -2, 1) };
        self.protect(3, 0, entry::raw_set_raw)
    }

    fn set_metatable(&mut self, idx: i32) {
        let top = self.raw_type(-1);
        if top != LUA_TTABLE && top != LUA_TNIL {
            self.pop(1);
            return;
        }
        unsafe { lua_setmetatable(self.state, Self::slot(idx)) };
    }

    fn get_metatable(&mut self, idx: i32) -> bool {
        self.reserve(1) && unsafe { lua_getmetatable(self.state, Self::slot(idx)) } != 0
    }

    // ===== Registry references =====

    fn reference(&mut self) -> ApiResult<i32> {
        self.protect(1, 1, entry::reference_raw)?;
        let reference = self.to_integer(-1).unwrap_or(LUA_NOREF as i64) as i32;
        self.pop(1);
        Ok(reference)
    }

    fn unreference(&mut self, reference: i32) {
        if reference < 0 {
            return;
        }
        self.push_integer(reference as i64);
        if self.protect(1, 0, entry::unreference_raw).is_err() {
            self.pop(1);
        }
    }

    // ===== Execution =====

    fn load(&mut self, chunk: &[u8], chunk_name: &str, mode: LoadMode) -> VmStatus {
        let name: Vec<u8> = chunk_name.bytes().filter(|b| *b != 0).collect();
        let name = CString::new(name).unwrap_or_default();
        let mode: &CStr = match mode {
            LoadMode::Text => c"t",
            LoadMode::Binary => c"b",
            LoadMode::Both => c"bt",
        };
        self.reserve(1);
        let status = unsafe {
            luaL_loadbufferx(
                self.state,
                chunk.as_ptr().cast(),
                chunk.len(),
                name.as_ptr(),
                mode.as_ptr(),
            )
        };
        vm_status(status)
    }

    fn dump(&mut self, idx: i32) -> Option<Vec<u8>> {
        let slot = Self::slot(idx);
        if self.raw_type(slot) != LUA_TFUNCTION || !self.reserve(1) {
            return None;
        }
        let mut out: Vec<u8> = Vec::new();
        let status = unsafe {
            lua_pushvalue(self.state, slot);
            let status = lua_dump(
                self.state,
                entry::write_chunk,
                (&mut out as *mut Vec<u8>).cast(),
                0,
            );
            lua_settop(self.state, -2);
            status
        };
        (status == 0 && !out.is_empty()).then_some(out)
    }

    fn pcall(&mut self, nargs: i32, nresults: i32) -> VmStatus {
        self.reserve(1);
        vm_status(unsafe { lua_pcallk(self.state, nargs, nresults, 0, 0, None) })
    }

    fn new_thread(&mut self) -> ApiResult<()> {
        self.protect(1, 1, entry::new_thread_raw)
    }

    fn resume(&mut self, thread_idx: i32, nargs: i32) -> (VmStatus, i32) {
        let co = unsafe { lua_tothread(self.state, Self::slot(thread_idx)) };
        if co.is_null() {
            return self.refuse_resume(nargs, "cannot resume non-coroutine");
        }
        match self.coroutine_status(co) {
            ThreadStatus::Suspended => {}
            ThreadStatus::Dead => return self.refuse_resume(nargs, "cannot resume dead coroutine"),
            ThreadStatus::Running | ThreadStatus::Normal => {
                return self.refuse_resume(nargs, "cannot resume non-suspended coroutine");
            }
        }
        // SAFETY: `co` is a thread of this state, checked above.
        let mut target = Lua53 {
            state: co,
            shared: self.shared,
            owner: false,
        };
        if !target.reserve(nargs + 1) {
            return self.refuse_resume(nargs, "too many arguments to resume");
        }
        let status = unsafe {
            lua_xmove(self.state, co, nargs);
            lua_resume(co, self.state, nargs)
        };
        match status {
            LUA_OK | LUA_YIELD => {
                let n = target.get_top();
                if !self.reserve(n + 1) {
                    target.set_top(0);
                    return self.refuse_resume(0, "too many results to resume");
                }
                unsafe { lua_xmove(co, self.state, n) };
                (vm_status(status), n)
            }
            _ => {
                self.reserve(1);
                unsafe { lua_xmove(co, self.state, 1) };
                (vm_status(status), 1)
            }
        }
    }

    fn thread_status(&self, idx: i32) -> Option<ThreadStatus> {
        let co = unsafe { lua_tothread(self.state, Self::slot(idx)) };
        (!co.is_null()).then(|| self.coroutine_status(co))
    }

    // ===== Resource hooks =====

    fn set_hook(&mut self, hook: Option<HookFn>, count: u32) {
        self.shared().hook.set(hook);
        match hook {
            Some(_) if count > 0 => unsafe {
                let count = count.min(c_int::MAX as u32) as c_int;
                lua_sethook(self.state, Some(entry::hook_entry), LUA_MASKCOUNT, count);
            },
            _ => unsafe { lua_sethook(self.state, None, 0, 0) },
        }
    }

    fn set_allocator(&mut self, hook: Rc<dyn AllocHook>) {
        self.shared().set_gate(hook);
    }

    fn collect_garbage(&mut self) {
        if self.protect(0, 0, entry::collect_raw).is_err() {
            let message = self.to_bytes(-1).unwrap_or_default();
            warn!(error = %String::from_utf8_lossy(&message), "finalizer failed during collection");
            self.pop(1);
        }
    }

    fn memory_in_use(&self) -> usize {
        self.shared().in_use()
    }
}
