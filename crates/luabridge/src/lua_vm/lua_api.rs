//! Capability interface over the embedded interpreter.
//!
//! The bridge never talks to a concrete VM. Everything it needs is expressed
//! here as a stack-based API in the spirit of the Lua 5.3 C API: values are
//! pushed and read through stack indices, tables are manipulated with raw
//! accessors, and calls are driven through `pcall` / `resume`.
//!
//! Differences from the C API, all forced by Rust having no `longjmp`:
//! - A native function reports an error by returning `Err(Raised)` with the
//!   error object on top of its stack instead of calling `lua_error`.
//! - `lua_callk` / `lua_pcallk` / `lua_yieldk` are *return values* of a native
//!   function ([`NativeReturn`]). The VM performs the call (or the yield) and
//!   then invokes the continuation itself, so chains of continuations never
//!   grow the host stack.
//! - Every API call that may allocate returns `ApiResult`; on failure the
//!   error object has already been pushed.

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pseudo-index of the VM registry table.
pub const REGISTRY_INDEX: i32 = -1_001_000;

/// Option for multiple returns in `pcall` / `resume` / `NativeReturn`.
pub const MULTRET: i32 = -1;

/// Pseudo-index of the `n`-th upvalue (1-based) of the running native closure.
#[inline]
pub const fn upvalue_index(n: i32) -> i32 {
    REGISTRY_INDEX - n
}

/// Basic types as reported by [`LuaApi::type_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    /// Index is not valid.
    None,
    Nil,
    Boolean,
    LightUserdata,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}

impl LuaType {
    pub fn name(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata | LuaType::Userdata => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Thread => "thread",
        }
    }
}

/// Status codes (LUA_OK, LUA_YIELD, LUA_ERRRUN, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Ok,
    Yield,
    RuntimeError,
    SyntaxError,
    MemoryError,
}

impl VmStatus {
    #[inline]
    pub fn is_error(self) -> bool {
        !matches!(self, VmStatus::Ok | VmStatus::Yield)
    }
}

/// Coroutine status (`coroutine.status` semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Not started yet, or suspended in a yield.
    Suspended,
    Running,
    /// Active but not running (it resumed another coroutine).
    Normal,
    /// Finished normally or with an error.
    Dead,
}

/// Which chunk kinds `load` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Text,
    Binary,
    Both,
}

impl LoadMode {
    pub fn accepts_text(self) -> bool {
        matches!(self, LoadMode::Text | LoadMode::Both)
    }

    pub fn accepts_binary(self) -> bool {
        matches!(self, LoadMode::Binary | LoadMode::Both)
    }
}

/// Marker for "an error was raised; the error object is on top of the stack".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised {
    status: VmStatus,
}

impl Raised {
    pub const fn new(status: VmStatus) -> Self {
        Raised { status }
    }

    pub const fn runtime() -> Self {
        Raised::new(VmStatus::RuntimeError)
    }

    pub const fn memory() -> Self {
        Raised::new(VmStatus::MemoryError)
    }

    #[inline]
    pub fn status(self) -> VmStatus {
        self.status
    }
}

pub type ApiResult<T> = Result<T, Raised>;

/// What a native function asks the VM to do after it returns.
#[derive(Clone, Copy)]
pub enum NativeReturn {
    /// Return the top `n` values of the native frame.
    Return(i32),
    /// Call the function below the top `nargs` values; when it returns, its
    /// results (adjusted to `nresults`) are left on the native frame and
    /// `k(status, ctx)` is invoked, with `Ok`, or `Yield` if the callee
    /// yielded on the way. Errors propagate past the frame.
    CallK {
        nargs: i32,
        nresults: i32,
        ctx: isize,
        k: ContinuationFn,
    },
    /// Like `CallK`, but errors in the callee are caught: `k` runs with the
    /// error status and the error object as the only value on the frame.
    PCallK {
        nargs: i32,
        nresults: i32,
        ctx: isize,
        k: ContinuationFn,
    },
    /// Yield the top `nresults` values to the resumer. On resume the yielded
    /// values are replaced by the resume arguments (anything below them stays
    /// on the frame) and `k(status = Yield, ctx)` runs. Without `k` the resume
    /// arguments become the native's results.
    YieldK {
        nresults: i32,
        ctx: isize,
        k: Option<ContinuationFn>,
    },
}

pub type NativeResult = Result<NativeReturn, Raised>;

/// A native function (lua_CFunction).
pub type NativeFn = fn(&mut dyn LuaApi) -> NativeResult;

/// Continuation of a native function (lua_KFunction).
pub type ContinuationFn = fn(&mut dyn LuaApi, VmStatus, isize) -> NativeResult;

/// Count hook. Returning `Err` raises the value on top of the stack at the
/// current instruction.
pub type HookFn = fn(&mut dyn LuaApi) -> ApiResult<()>;

/// Allocation gate installed with [`LuaApi::set_allocator`].
///
/// Called before every charged allocation with the old and new block size.
/// A `false` answer makes the VM raise a memory error without allocating.
/// Frees (`new_size == 0`) are reported too and must always succeed.
pub trait AllocHook {
    fn realloc(&self, old_size: usize, new_size: usize) -> bool;

    /// Growth the VM cannot back out of (its own stack, blocks that existed
    /// before the hook was installed). Must be recorded, cannot be refused.
    fn realloc_forced(&self, old_size: usize, new_size: usize) {
        let _ = self.realloc(old_size, new_size);
    }
}

/// Opaque identity of one VM instance.
///
/// Native trampolines receive only the API object; the handle is how they
/// find the host-side state owning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateHandle(u64);

impl StateHandle {
    pub fn next() -> Self {
        static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
        StateHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Stack-based interpreter capability.
///
/// Indices follow the C API: positive indices count from the bottom of the
/// current frame (1 = first argument of the running native function),
/// negative indices from the top, plus the pseudo-indices
/// [`REGISTRY_INDEX`] and [`upvalue_index`].
pub trait LuaApi {
    fn handle(&self) -> StateHandle;

    // ===== Stack =====

    fn get_top(&self) -> i32;
    /// Grows (with nils) or shrinks the frame; negative values are relative.
    fn set_top(&mut self, idx: i32);
    fn abs_index(&self, idx: i32) -> i32;
    /// Pushes a copy of the value at `idx`.
    fn push_value(&mut self, idx: i32);
    fn remove(&mut self, idx: i32);
    /// Moves the top value into `idx`, shifting up the values above it.
    fn insert(&mut self, idx: i32);

    fn pop(&mut self, n: i32) {
        self.set_top(-n - 1);
    }

    // ===== Access =====

    fn type_of(&self, idx: i32) -> LuaType;
    fn is_integer(&self, idx: i32) -> bool;
    fn to_boolean(&self, idx: i32) -> bool;
    fn to_integer(&self, idx: i32) -> Option<i64>;
    fn to_number(&self, idx: i32) -> Option<f64>;
    fn to_bytes(&self, idx: i32) -> Option<Vec<u8>>;
    /// Identity of a collectable value, 0 for everything else.
    fn to_pointer(&self, idx: i32) -> usize;
    fn to_light_userdata(&self, idx: i32) -> Option<usize>;
    /// Payload of a full userdata.
    fn to_userdata(&self, idx: i32) -> Option<u64>;
    /// The function pointer of a native closure.
    fn to_native(&self, idx: i32) -> Option<NativeFn>;
    fn raw_len(&self, idx: i32) -> usize;

    // ===== Push =====

    fn push_nil(&mut self);
    fn push_boolean(&mut self, b: bool);
    fn push_integer(&mut self, n: i64);
    fn push_number(&mut self, n: f64);
    fn push_bytes(&mut self, bytes: &[u8]) -> ApiResult<()>;
    fn push_light_userdata(&mut self, p: usize);
    /// Pops `n_upvalues` values and pushes a native closure capturing them.
    fn push_native(&mut self, f: NativeFn, n_upvalues: i32) -> ApiResult<()>;
    /// Pushes a new full userdata carrying `payload`.
    fn new_userdata(&mut self, payload: u64) -> ApiResult<()>;
    /// Pushes upvalue `n` of the native closure at `func_idx`.
    fn get_upvalue(&mut self, func_idx: i32, n: i32) -> bool;

    fn push_str(&mut self, s: &str) -> ApiResult<()> {
        self.push_bytes(s.as_bytes())
    }

    // ===== Tables =====

    fn create_table(&mut self, narr: usize, nrec: usize) -> ApiResult<()>;
    /// Replaces the key on top with `t[key]` for the table at `idx`.
    fn raw_get(&mut self, idx: i32) -> LuaType;
    /// `t[key] = value` with key and value on top (both popped).
    fn raw_set(&mut self, idx: i32) -> ApiResult<()>;
    fn raw_geti(&mut self, idx: i32, n: i64) -> LuaType;
    /// `t[n] = value` with the value on top (popped).
    fn raw_seti(&mut self, idx: i32, n: i64) -> ApiResult<()>;
    /// Pops a key and pushes the next key/value pair; false at the end.
    fn next(&mut self, idx: i32) -> bool;
    fn get_global(&mut self, name: &str) -> LuaType;
    /// Pops a value and assigns it to the global `name`.
    fn set_global(&mut self, name: &str) -> ApiResult<()>;
    /// Pops a table (or nil) and sets it as metatable of the value at `idx`.
    fn set_metatable(&mut self, idx: i32);
    fn get_metatable(&mut self, idx: i32) -> bool;

    // ===== Registry references =====

    /// Pops the top value into the registry and returns its reference.
    fn reference(&mut self) -> ApiResult<i32>;
    fn unreference(&mut self, reference: i32);
    fn push_reference(&mut self, reference: i32) -> LuaType {
        self.raw_geti(REGISTRY_INDEX, reference as i64)
    }

    // ===== Execution =====

    /// Compiles a chunk and pushes the resulting function, or pushes the
    /// error message and returns the error status.
    fn load(&mut self, chunk: &[u8], chunk_name: &str, mode: LoadMode) -> VmStatus;
    /// Binary form of the function at `idx`.
    fn dump(&mut self, idx: i32) -> Option<Vec<u8>>;
    /// Protected call of the function below the top `nargs` values. On error
    /// the function and arguments are replaced by the error object.
    fn pcall(&mut self, nargs: i32, nresults: i32) -> VmStatus;
    /// Pops a function and pushes a new coroutine that will run it.
    fn new_thread(&mut self) -> ApiResult<()>;
    /// Resumes the coroutine at `thread_idx` with the top `nargs` values.
    /// Yielded/returned values (or the error object) end up on this stack;
    /// the second element is their count.
    fn resume(&mut self, thread_idx: i32, nargs: i32) -> (VmStatus, i32);
    fn thread_status(&self, idx: i32) -> Option<ThreadStatus>;
    /// Raises the value on top of the stack. For native functions:
    /// `return Err(api.error())`.
    fn error(&mut self) -> Raised {
        Raised::runtime()
    }

    // ===== Resource hooks =====

    fn set_hook(&mut self, hook: Option<HookFn>, count: u32);
    fn set_allocator(&mut self, hook: Rc<dyn AllocHook>);
    /// Full collection, running the finalizers of everything it frees.
    fn collect_garbage(&mut self);
    /// Bytes currently charged through the allocator.
    fn memory_in_use(&self) -> usize;
}
