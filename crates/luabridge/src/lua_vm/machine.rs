// LuaMachine: one interpreter instance plus everything the bridge keeps
// next to it.
//
// All public operations run inside a session: the release queue is flushed,
// abandoned continuations are dropped, the VM stack top is saved and
// restored, and the state flips to Executing for the duration. Registry
// borrows never span a pcall/resume, because native trampolines borrow the
// registry again from inside the VM.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::governor::ResourceGovernor;
use crate::lib_registry::{LibraryEntry, LibraryModule};
use crate::lua_value::{
    LuaArgs, LuaCoroutine, LuaFunction, LuaNativeFunction, LuaTable, LuaValue, ObjectId, ReleaseQueue,
};
use crate::lua_vm::continuation::ContinuationTable;
use crate::lua53::Lua53;
use crate::lua_vm::machine_map;
use crate::lua_vm::marshal::{api_error, error_from_status};
use crate::lua_vm::object_registry::ObjectRegistry;
use crate::lua_vm::trampoline::{load_trampoline, timeout_hook};
use crate::lua_vm::{
    AllocHook, HookFn, LoadMode, LuaApi, LuaError, LuaResult, MULTRET, MachineOptions, StateHandle,
    ThreadStatus, TimeoutReset, VmStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Executing,
}

/// What a session is for; only executing sessions restart the timeout.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Entry {
    Execute,
    Inspect,
}

/// Host-side state shared with the native trampolines.
pub(crate) struct MachineCore {
    pub(crate) registry: RefCell<ObjectRegistry>,
    pub(crate) continuations: RefCell<ContinuationTable>,
    /// Tokens whose guard was collected, dropped at the next safe point.
    abandoned: RefCell<Vec<isize>>,
    pub(crate) governor: Rc<ResourceGovernor>,
    pub(crate) releases: ReleaseQueue,
    pub(crate) allow_bytecode: Cell<bool>,
    timeout_reset: Cell<TimeoutReset>,
    state: Cell<SessionState>,
}

impl MachineCore {
    pub(crate) fn abandon_continuation(&self, token: isize) {
        self.abandoned.borrow_mut().push(token);
    }

    /// Drops continuations whose frames the VM collected. Tokens of
    /// continuations that already ran find nothing.
    fn drop_abandoned(&self) {
        let tokens = std::mem::take(&mut *self.abandoned.borrow_mut());
        if tokens.is_empty() {
            return;
        }
        let dropped: Vec<_> = {
            let mut table = self.continuations.borrow_mut();
            tokens.iter().filter_map(|&token| table.take(token)).collect()
        };
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "dropped abandoned continuations");
        }
    }
}

/// A sandboxed interpreter instance and its bridge to the host.
///
/// ```ignore
/// let mut machine = LuaMachine::new(MachineOptions::default())?;
/// machine.register_function("add", LuaNativeFunction::wrap(|args| {
///     Ok(args![args.get_integer(0)? + args.get_integer(1)?])
/// }))?;
/// let add = machine.get_global("add")?;
/// assert_eq!(machine.call(add, args![2, 3])?, args![5]);
/// ```
pub struct LuaMachine {
    vm: Option<Box<dyn LuaApi>>,
    core: Rc<MachineCore>,
    handle: StateHandle,
}

impl LuaMachine {
    /// A machine running on Lua 5.3 ([`Lua53`]).
    pub fn new(options: MachineOptions) -> LuaResult<Self> {
        Self::with_vm(Box::new(Lua53::new()?), options)
    }

    /// A machine running on another [`LuaApi`] backend.
    pub fn with_vm(mut vm: Box<dyn LuaApi>, options: MachineOptions) -> LuaResult<Self> {
        let handle = vm.handle();
        let governor = Rc::new(ResourceGovernor::new(&options));
        let hook: Rc<dyn AllocHook> = governor.clone();
        vm.set_allocator(hook);

        let releases = ReleaseQueue::new();
        let registry = {
            let _guard = governor.bookkeeping();
            let registry = ObjectRegistry::new(vm.as_mut(), handle, releases.clone())
                .map_err(|r| api_error(vm.as_mut(), r))?;
            vm.push_native(load_trampoline, 0)
                .and_then(|_| vm.set_global("load"))
                .map_err(|r| api_error(vm.as_mut(), r))?;
            registry
        };
        if options.enforce_time_limits {
            vm.set_hook(Some(timeout_hook), governor.hook_period());
        }

        let core = Rc::new(MachineCore {
            registry: RefCell::new(registry),
            continuations: RefCell::new(ContinuationTable::new()),
            abandoned: RefCell::new(Vec::new()),
            governor,
            releases,
            allow_bytecode: Cell::new(options.allow_bytecode_loading),
            timeout_reset: Cell::new(options.timeout_reset),
            state: Cell::new(SessionState::Idle),
        });
        machine_map::register(handle, &core);
        debug!(
            machine = handle.raw(),
            budget = options.total_memory_budget,
            time_limits = options.enforce_time_limits,
            bytecode = options.allow_bytecode_loading,
            "machine created"
        );
        Ok(LuaMachine {
            vm: Some(vm),
            core,
            handle,
        })
    }

    fn session<T, F>(&mut self, entry: Entry, f: F) -> LuaResult<T>
    where
        F: FnOnce(&mut dyn LuaApi, &MachineCore) -> LuaResult<T>,
    {
        let core = self.core.clone();
        let Some(vm) = self.vm.as_deref_mut() else {
            return Err(LuaError::MachineClosed);
        };
        if core.state.get() == SessionState::Executing {
            return Err(LuaError::MachineBusy);
        }
        core.state.set(SessionState::Executing);
        let top = vm.get_top();
        {
            let _guard = core.governor.bookkeeping();
            core.registry.borrow_mut().flush(vm);
        }
        core.drop_abandoned();
        if entry == Entry::Execute && core.timeout_reset.get() == TimeoutReset::PerCall {
            core.governor.timeout().reset();
        }
        trace!(machine = self.handle.raw(), "session start");
        let result = f(vm, &core);
        vm.set_top(top);
        core.state.set(SessionState::Idle);
        trace!(machine = self.handle.raw(), ok = result.is_ok(), "session end");
        result
    }

    // ===== Globals and registration =====

    pub fn get_global(&mut self, name: &str) -> LuaResult<LuaValue> {
        self.session(Entry::Inspect, |vm, core| {
            let _guard = core.governor.bookkeeping();
            vm.get_global(name);
            core.registry.borrow_mut().read_value(vm, -1)
        })
    }

    /// Assigns a global; host tables are copied into the VM.
    pub fn set_global(&mut self, name: &str, value: impl Into<LuaValue>) -> LuaResult<()> {
        let value = value.into();
        self.session(Entry::Inspect, |vm, core| {
            let _guard = core.governor.bookkeeping();
            core.registry.borrow_mut().push_value(vm, &value)?;
            vm.set_global(name).map_err(|r| api_error(vm, r))
        })
    }

    pub fn register_global(&mut self, name: &str, value: impl Into<LuaValue>) -> LuaResult<()> {
        self.set_global(name, value)
    }

    pub fn register_function(&mut self, name: &str, function: LuaNativeFunction) -> LuaResult<()> {
        self.set_global(name, function)
    }

    /// Publishes `entries` as a global table of functions.
    pub fn register_table<'a, I>(&mut self, name: &str, entries: I) -> LuaResult<()>
    where
        I: IntoIterator<Item = (&'a str, LuaNativeFunction)>,
    {
        let table = LuaTable::new();
        for (key, function) in entries {
            table.set(key, function)?;
        }
        self.set_global(name, table)
    }

    /// Loads a [`LibraryModule`]. A module named `_G` populates the globals
    /// directly.
    pub fn register_library(&mut self, module: &LibraryModule) -> LuaResult<()> {
        let entry_value = |entry: &LibraryEntry| match entry {
            LibraryEntry::Function(f) => LuaValue::NativeFunction(f.clone()),
            LibraryEntry::Value(v) => v.clone(),
        };
        if module.name == "_G" {
            for (name, entry) in &module.entries {
                self.set_global(name, entry_value(entry))?;
            }
            return Ok(());
        }
        let table = LuaTable::new();
        for (name, entry) in &module.entries {
            table.set(*name, entry_value(entry))?;
        }
        debug!(library = module.name, entries = module.entries.len(), "library registered");
        self.set_global(module.name, table)
    }

    // ===== Loading and calling =====

    /// Compiles `source` into a function. Binary chunks are accepted only
    /// while bytecode loading is allowed.
    pub fn load(&mut self, source: impl AsRef<[u8]>, chunk_name: &str) -> LuaResult<LuaFunction> {
        let source = source.as_ref();
        self.session(Entry::Inspect, |vm, core| {
            let mode = if core.allow_bytecode.get() {
                LoadMode::Both
            } else {
                LoadMode::Text
            };
            let status = vm.load(source, chunk_name, mode);
            if status != VmStatus::Ok {
                let error = take_error(vm, core, status);
                debug!(chunk = chunk_name, %error, "load failed");
                return Err(error);
            }
            let _guard = core.governor.bookkeeping();
            let anchor = core
                .registry
                .borrow_mut()
                .handle_for_stack_value(vm, false)
                .map_err(|r| api_error(vm, r))?;
            Ok(LuaFunction::from_anchor(anchor))
        })
    }

    /// Loads and runs a chunk, returning its results.
    pub fn do_string(&mut self, source: impl AsRef<[u8]>, chunk_name: &str) -> LuaResult<LuaArgs> {
        let function = self.load(source, chunk_name)?;
        self.call(function, LuaArgs::empty())
    }

    /// Calls `function` with `args` in protected mode.
    pub fn call(&mut self, function: impl Into<LuaValue>, args: impl Into<LuaArgs>) -> LuaResult<LuaArgs> {
        let function = function.into();
        let args = args.into();
        self.session(Entry::Execute, |vm, core| {
            let base = vm.get_top();
            let nargs = {
                let _guard = core.governor.bookkeeping();
                let mut registry = core.registry.borrow_mut();
                registry.push_value(vm, &function)?;
                registry.push_args(vm, &args)?
            };
            let status = vm.pcall(nargs, MULTRET);
            if status != VmStatus::Ok {
                return Err(take_error(vm, core, status));
            }
            let count = vm.get_top() - base;
            let _guard = core.governor.bookkeeping();
            core.registry.borrow_mut().read_args(vm, base + 1, count)
        })
    }

    // ===== Coroutines =====

    pub fn create_coroutine(&mut self, function: impl Into<LuaValue>) -> LuaResult<LuaCoroutine> {
        let function = function.into();
        self.session(Entry::Inspect, |vm, core| {
            let _guard = core.governor.bookkeeping();
            let mut registry = core.registry.borrow_mut();
            registry.push_value(vm, &function)?;
            vm.new_thread().map_err(|r| api_error(vm, r))?;
            let anchor = registry
                .handle_for_stack_value(vm, true)
                .map_err(|r| api_error(vm, r))?;
            Ok(LuaCoroutine::from_anchor(anchor))
        })
    }

    /// Runs `coroutine` until it yields or finishes; returns the yielded
    /// values or its results.
    pub fn resume(&mut self, coroutine: &LuaCoroutine, args: impl Into<LuaArgs>) -> LuaResult<LuaArgs> {
        let coroutine = LuaValue::Coroutine(coroutine.clone());
        let args = args.into();
        self.session(Entry::Execute, |vm, core| {
            let (thread, nargs) = {
                let _guard = core.governor.bookkeeping();
                let mut registry = core.registry.borrow_mut();
                registry.push_value(vm, &coroutine)?;
                let thread = vm.get_top();
                (thread, registry.push_args(vm, &args)?)
            };
            let (status, count) = vm.resume(thread, nargs);
            if status.is_error() {
                return Err(take_error(vm, core, status));
            }
            let first = vm.get_top() - count + 1;
            let _guard = core.governor.bookkeeping();
            core.registry.borrow_mut().read_args(vm, first, count)
        })
    }

    pub fn coroutine_status(&mut self, coroutine: &LuaCoroutine) -> LuaResult<ThreadStatus> {
        let coroutine = LuaValue::Coroutine(coroutine.clone());
        self.session(Entry::Inspect, |vm, core| {
            let _guard = core.governor.bookkeeping();
            core.registry.borrow_mut().push_value(vm, &coroutine)?;
            vm.thread_status(-1)
                .ok_or_else(|| LuaError::Marshal("value is not a coroutine".into()))
        })
    }

    /// True once the coroutine returned or raised; false while it can still
    /// be resumed.
    pub fn is_finished(&mut self, coroutine: &LuaCoroutine) -> LuaResult<bool> {
        Ok(self.coroutine_status(coroutine)? == ThreadStatus::Dead)
    }

    // ===== Registry =====

    /// Registers a host object or closure (or returns the id of a VM handle)
    /// and optionally pins it.
    pub fn anchor(&mut self, value: &LuaValue, permanent: bool) -> LuaResult<ObjectId> {
        match value {
            LuaValue::Function(f) => Ok(f.id()),
            LuaValue::Coroutine(c) => Ok(c.id()),
            LuaValue::Object(_) | LuaValue::NativeFunction(_) => self.session(Entry::Inspect, |vm, core| {
                let _guard = core.governor.bookkeeping();
                core.registry
                    .borrow_mut()
                    .anchor(vm, value, permanent)
                    .map_err(|r| api_error(vm, r))
            }),
            other => Err(LuaError::Marshal(format!(
                "cannot anchor a {} value",
                other.type_name()
            ))),
        }
    }

    /// The live value registered under `id`.
    pub fn resolve(&self, id: ObjectId) -> Option<LuaValue> {
        self.core.registry.borrow().resolve(id)
    }

    /// Queues `id` for removal at the start of the next session.
    pub fn release(&self, id: ObjectId) {
        self.core.releases.release(id);
    }

    /// Keeps the proxy of `value` alive even when no script references it.
    pub fn pin(&mut self, value: &LuaValue) -> LuaResult<ObjectId> {
        self.anchor(value, true)
    }

    /// Undoes [`pin`](Self::pin). Returns false for values that were never
    /// registered or cannot be unpinned.
    pub fn unpin(&mut self, value: &LuaValue) -> LuaResult<bool> {
        let Some(id) = self.core.registry.borrow().id_of(value) else {
            return Ok(false);
        };
        self.session(Entry::Inspect, |vm, core| Ok(core.registry.borrow_mut().unpin(vm, id)))
    }

    /// A handle other threads can use to release ids.
    pub fn release_queue(&self) -> ReleaseQueue {
        self.core.releases.clone()
    }

    pub fn live_objects(&self) -> usize {
        self.core.registry.borrow().len()
    }

    /// Continuations parked by async calls or yields still in flight.
    pub fn pending_continuations(&self) -> usize {
        self.core.continuations.borrow().len()
    }

    // ===== Housekeeping =====

    /// Runs a full collection and drops the entries and continuations it
    /// freed. Returns the number of registry entries removed.
    pub fn collect_garbage(&mut self) -> LuaResult<usize> {
        self.session(Entry::Inspect, |vm, core| {
            vm.collect_garbage();
            let removed = {
                let _guard = core.governor.bookkeeping();
                core.registry.borrow_mut().flush(vm)
            };
            core.drop_abandoned();
            Ok(removed)
        })
    }

    pub fn memory_used(&self) -> usize {
        self.core.governor.memory().used()
    }

    pub fn memory_budget(&self) -> usize {
        self.core.governor.memory().budget()
    }

    pub fn set_memory_budget(&self, bytes: usize) {
        self.core.governor.memory().set_budget(bytes);
    }

    pub fn set_enforce_time_limits(&mut self, enforce: bool) {
        self.core.governor.timeout().set_enabled(enforce);
        if let Some(vm) = self.vm.as_deref_mut() {
            let hook = enforce.then_some(timeout_hook as HookFn);
            vm.set_hook(hook, self.core.governor.hook_period());
        }
    }

    pub fn enforce_time_limits(&self) -> bool {
        self.core.governor.timeout().is_enabled()
    }

    pub fn set_allow_bytecode_loading(&self, allow: bool) {
        self.core.allow_bytecode.set(allow);
    }

    pub fn allow_bytecode_loading(&self) -> bool {
        self.core.allow_bytecode.get()
    }

    /// Gives running scripts a fresh instruction budget.
    pub fn reset_timeout(&self) {
        self.core.governor.timeout().reset();
    }

    pub fn set_timeout_reset(&self, reset: TimeoutReset) {
        self.core.timeout_reset.set(reset);
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.core.governor
    }

    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.vm.is_none()
    }

    /// Shuts the interpreter down. Fails while a call is in flight.
    pub fn close(&mut self) -> LuaResult<()> {
        if self.core.state.get() == SessionState::Executing {
            return Err(LuaError::MachineBusy);
        }
        if self.vm.is_none() {
            return Err(LuaError::MachineClosed);
        }
        machine_map::unregister(self.handle);
        let abandoned = self.core.continuations.borrow().len();
        self.core.continuations.borrow_mut().clear();
        self.vm = None;
        debug!(machine = self.handle.raw(), abandoned, "machine closed");
        Ok(())
    }
}

impl Drop for LuaMachine {
    fn drop(&mut self) {
        machine_map::unregister(self.handle);
    }
}

/// Reads and pops the error object left by a failed load, call or resume.
fn take_error(vm: &mut dyn LuaApi, core: &MachineCore, status: VmStatus) -> LuaError {
    let value = {
        let _guard = core.governor.bookkeeping();
        core.registry.borrow_mut().read_value(vm, -1)
    };
    vm.pop(1);
    match value {
        Ok(value) => error_from_status(status, value),
        Err(error) => error,
    }
}
