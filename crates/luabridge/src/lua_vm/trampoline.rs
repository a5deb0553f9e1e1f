// Native entry points installed into the VM
//
// Every host callback reaches the VM through one of the functions below.
// They find their machine through the state handle, marshal the stack into
// LuaArgs, run the callback outside any registry borrow and translate the
// CallOutcome into a NativeReturn. Host errors become script errors here.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::lua_value::{LuaArgs, ObjectId};
use crate::lua_vm::lua_limits::TYPE_NAME_FIELD;
use crate::lua_vm::continuation::Continuation;
use crate::lua_vm::machine::MachineCore;
use crate::lua_vm::machine_map;
use crate::lua_vm::{
    ApiResult, CallOutcome, LoadMode, LuaApi, LuaError, LuaResult, LuaType, MULTRET, NativeResult,
    NativeReturn, Raised, VmStatus, upvalue_index,
};

/// The machine owning `api`.
pub(crate) fn current_core(api: &mut dyn LuaApi) -> Result<Rc<MachineCore>, Raised> {
    match machine_map::lookup(api.handle()) {
        Some(core) => Ok(core),
        None => {
            // Nothing to account against any more; a failed push still
            // leaves an error object on top.
            let _ = api.push_str("machine is closed");
            Err(Raised::runtime())
        }
    }
}

/// Runs a host callback, turning a panic into a script error.
fn call_guarded<F>(f: F) -> LuaResult<CallOutcome>
where
    F: FnOnce() -> LuaResult<CallOutcome>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(LuaError::runtime(format!("native function panicked: {}", detail)))
        }
    }
}

/// Pushes the error object for `error` and returns the matching marker.
fn raise(api: &mut dyn LuaApi, core: &MachineCore, error: LuaError) -> Raised {
    let raised = match error {
        LuaError::ResourceExhausted => Raised::memory(),
        _ => Raised::runtime(),
    };
    let value = error.to_error_value();
    let _guard = core.governor.bookkeeping();
    let pushed = core.registry.borrow_mut().push_value(api, &value);
    if pushed.is_err() {
        let _ = api.push_str(&error.to_string());
    }
    raised
}

/// A host callback reached from a finalizer that ran while the bridge was
/// marshaling.
fn raise_busy(api: &mut dyn LuaApi) -> Raised {
    let _ = api.push_str(&LuaError::MachineBusy.to_string());
    Raised::runtime()
}

/// Payload of the userdata at `idx` (an object id).
fn proxy_id(api: &mut dyn LuaApi, idx: i32) -> Option<ObjectId> {
    api.push_value(idx);
    let id = api.to_userdata(-1);
    api.pop(1);
    id.map(|id| id as ObjectId)
}

/// Reads `count` stack values starting at `first` into LuaArgs.
fn read_frame(api: &mut dyn LuaApi, core: &MachineCore, first: i32) -> LuaResult<LuaArgs> {
    let count = (api.get_top() - first + 1).max(0);
    let _guard = core.governor.bookkeeping();
    core.registry.borrow_mut().read_args(api, first, count)
}

/// Turns a callback outcome into what the VM should do next. The frame is
/// emptied first; the callback's stack values are no longer needed.
fn complete(api: &mut dyn LuaApi, core: &MachineCore, outcome: LuaResult<CallOutcome>) -> NativeResult {
    api.set_top(0);
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(error) => return Err(raise(api, core, error)),
    };
    match outcome {
        CallOutcome::Return(results) => {
            let pushed = {
                let _guard = core.governor.bookkeeping();
                core.registry.borrow_mut().push_args(api, &results)
            };
            match pushed {
                Ok(n) => Ok(NativeReturn::Return(n)),
                Err(error) => {
                    api.set_top(0);
                    Err(raise(api, core, error))
                }
            }
        }
        CallOutcome::AsyncCall {
            function,
            args,
            continuation,
        } => {
            let token = park(api, core, continuation)?;
            let pushed = {
                let _guard = core.governor.bookkeeping();
                let mut registry = core.registry.borrow_mut();
                registry
                    .push_value(api, &function)
                    .and_then(|_| registry.push_args(api, &args))
            };
            let nargs = match pushed {
                Ok(n) => n,
                Err(error) => {
                    unpark(api, core, token);
                    return Err(raise(api, core, error));
                }
            };
            trace!(token, nargs, "parked continuation for async call");
            Ok(NativeReturn::PCallK {
                nargs,
                nresults: MULTRET,
                ctx: token,
                k: continuation_trampoline,
            })
        }
        CallOutcome::Yield {
            results,
            continuation,
        } => {
            let token = match continuation {
                Some(continuation) => park(api, core, continuation)?,
                None => -1,
            };
            let pushed = {
                let _guard = core.governor.bookkeeping();
                core.registry.borrow_mut().push_args(api, &results)
            };
            let nresults = match pushed {
                Ok(n) => n,
                Err(error) => {
                    unpark(api, core, token);
                    return Err(raise(api, core, error));
                }
            };
            if token < 0 {
                return Ok(NativeReturn::YieldK {
                    nresults,
                    ctx: -1,
                    k: None,
                });
            }
            trace!(token, nresults, "parked continuation for yield");
            Ok(NativeReturn::YieldK {
                nresults,
                ctx: token,
                k: Some(continuation_trampoline),
            })
        }
    }
}

/// Parks `continuation` and pushes its guard at the bottom of the (empty)
/// frame, where it stays until the continuation runs.
fn park(api: &mut dyn LuaApi, core: &MachineCore, continuation: Continuation) -> Result<isize, Raised> {
    let token = core.continuations.borrow_mut().insert(continuation);
    let pushed = {
        let _guard = core.governor.bookkeeping();
        core.registry.borrow().push_continuation_guard(api, token)
    };
    match pushed {
        Ok(()) => Ok(token),
        Err(raised) => {
            let dropped = core.continuations.borrow_mut().take(token);
            drop(dropped);
            Err(raised)
        }
    }
}

fn unpark(api: &mut dyn LuaApi, core: &MachineCore, token: isize) {
    api.set_top(0);
    if token > 0 {
        let dropped = core.continuations.borrow_mut().take(token);
        drop(dropped);
    }
}

/// Entry point of every host closure proxy. Upvalue 1 is the proxy userdata.
pub(crate) fn native_trampoline(api: &mut dyn LuaApi) -> NativeResult {
    let core = current_core(api)?;
    let id = proxy_id(api, upvalue_index(1)).unwrap_or_default();
    let function = match core.registry.try_borrow() {
        Ok(registry) => registry.function(id),
        Err(_) => return Err(raise_busy(api)),
    };
    let Some(function) = function else {
        let error = LuaError::Disconnected("function".into());
        return Err(raise(api, &core, error));
    };
    let args = match read_frame(api, &core, 1) {
        Ok(args) => args,
        Err(error) => return Err(raise(api, &core, error)),
    };
    let outcome = call_guarded(|| function.call(args));
    complete(api, &core, outcome)
}

/// Resumes a parked continuation with the values left on the frame.
pub(crate) fn continuation_trampoline(api: &mut dyn LuaApi, status: VmStatus, ctx: isize) -> NativeResult {
    let core = current_core(api)?;
    let continuation = if ctx > 0 {
        core.continuations.borrow_mut().take(ctx)
    } else {
        None
    };
    if status.is_error() {
        // The error object is on top; let it travel on.
        return Err(Raised::new(status));
    }
    // Slot 1 holds the continuation's guard.
    let first = if ctx > 0 { 2 } else { 1 };
    let Some(continuation) = continuation else {
        return Ok(NativeReturn::Return((api.get_top() - first + 1).max(0)));
    };
    let args = match read_frame(api, &core, first) {
        Ok(args) => args,
        Err(error) => return Err(raise(api, &core, error)),
    };
    let outcome = call_guarded(move || continuation(args));
    complete(api, &core, outcome)
}

/// `__index` entry of an object metatable. Upvalue 1 is the method name.
pub(crate) fn method_trampoline(api: &mut dyn LuaApi) -> NativeResult {
    let core = current_core(api)?;
    let name = api
        .to_bytes(upvalue_index(1))
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    if api.type_of(1) != LuaType::Userdata {
        let error = LuaError::runtime(format!("bad argument #1 to '{}' (object expected)", name));
        return Err(raise(api, &core, error));
    }
    let id = api.to_userdata(1).unwrap_or_default() as ObjectId;
    let object = match core.registry.try_borrow() {
        Ok(registry) => registry.object(id),
        Err(_) => return Err(raise_busy(api)),
    };
    let Some(object) = object else {
        let type_name = proxy_type_name(api, 1);
        return Err(raise(api, &core, LuaError::Disconnected(type_name.into())));
    };
    let args = match read_frame(api, &core, 2) {
        Ok(args) => args,
        Err(error) => return Err(raise(api, &core, error)),
    };
    let outcome = call_guarded(|| object.call_method(&name, args));
    complete(api, &core, outcome)
}

fn proxy_type_name(api: &mut dyn LuaApi, idx: i32) -> String {
    if !api.get_metatable(idx) {
        return "object".to_string();
    }
    let name = match api.push_str(TYPE_NAME_FIELD) {
        Ok(()) => {
            api.raw_get(-2);
            let name = api.to_bytes(-1);
            api.pop(1);
            name
        }
        Err(_) => {
            api.pop(1);
            None
        }
    };
    api.pop(1);
    name.map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_else(|| "object".to_string())
}

/// `__gc` of every proxy. Collection runs inside allocations, so the id is
/// only queued; the next flush decides whether the entry goes.
pub(crate) fn gc_trampoline(api: &mut dyn LuaApi) -> NativeResult {
    let Some(core) = machine_map::lookup(api.handle()) else {
        return Ok(NativeReturn::Return(0));
    };
    if let Some(id) = api.to_userdata(1) {
        trace!(id, "proxy collected");
        core.releases.collected(id as ObjectId);
    }
    Ok(NativeReturn::Return(0))
}

/// `__gc` of a continuation guard. A coroutine dropped while parked takes
/// its frame, and with it the guard, so the token comes back here.
pub(crate) fn continuation_gc(api: &mut dyn LuaApi) -> NativeResult {
    let Some(core) = machine_map::lookup(api.handle()) else {
        return Ok(NativeReturn::Return(0));
    };
    if let Some(token) = api.to_userdata(1) {
        core.abandon_continuation(token as isize);
    }
    Ok(NativeReturn::Return(0))
}

/// The `load` global: `load(chunk [, chunkname])`. Returns the compiled
/// function, or nil plus the error message.
pub(crate) fn load_trampoline(api: &mut dyn LuaApi) -> NativeResult {
    let core = current_core(api)?;
    if api.type_of(1) != LuaType::String {
        let got = api.type_of(1).name();
        let error = LuaError::runtime(format!("bad argument #1 to 'load' (string expected, got {})", got));
        return Err(raise(api, &core, error));
    }
    let chunk = api.to_bytes(1).unwrap_or_default();
    let name = api
        .to_bytes(2)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_else(|| "=(load)".to_string());
    let mode = if core.allow_bytecode.get() {
        LoadMode::Both
    } else {
        LoadMode::Text
    };
    api.set_top(0);
    match api.load(&chunk, &name, mode) {
        VmStatus::Ok => Ok(NativeReturn::Return(1)),
        status => {
            let message = api
                .to_bytes(-1)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            debug!(chunk = %name, ?status, %message, "load rejected chunk");
            api.push_nil();
            api.insert(-2);
            Ok(NativeReturn::Return(2))
        }
    }
}

/// Count hook driving the timeout monitor.
pub(crate) fn timeout_hook(api: &mut dyn LuaApi) -> ApiResult<()> {
    let Some(core) = machine_map::lookup(api.handle()) else {
        return Ok(());
    };
    let Some(stage) = core.governor.on_hook() else {
        return Ok(());
    };
    debug!(?stage, "script timed out");
    let _guard = core.governor.bookkeeping();
    api.push_str(stage.message())?;
    Err(Raised::runtime())
}
