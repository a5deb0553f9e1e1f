// Host objects and host closures exposed to scripts

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::lua_value::LuaArgs;
use crate::lua_vm::{CallOutcome, LuaError, LuaResult};

/// A host object scripts can hold as userdata and call methods on.
///
/// Every type gets one metatable, built the first time an instance crosses
/// into a machine: `__name` is [`type_name`](LuaObject::type_name) and
/// `__index` maps each of [`method_names`](LuaObject::method_names) to a
/// dispatcher calling [`call_method`](LuaObject::call_method). The method
/// list is therefore fixed per type name.
///
/// ```ignore
/// struct Counter(Cell<i64>);
///
/// impl LuaObject for Counter {
///     fn type_name(&self) -> &'static str { "Counter" }
///     fn method_names(&self) -> &'static [&'static str] { &["inc"] }
///     fn call_method(&self, name: &str, _args: LuaArgs) -> LuaResult<CallOutcome> {
///         self.0.set(self.0.get() + 1);
///         Ok(args![self.0.get()].into())
///     }
///     fn as_any(&self) -> &dyn Any { self }
/// }
/// ```
pub trait LuaObject: Any {
    fn type_name(&self) -> &'static str;

    fn method_names(&self) -> &'static [&'static str] {
        &[]
    }

    /// `args` excludes the receiver.
    fn call_method(&self, name: &str, args: LuaArgs) -> LuaResult<CallOutcome> {
        let _ = args;
        Err(LuaError::runtime(format!(
            "{} has no method '{}'",
            self.type_name(),
            name
        )))
    }

    fn as_any(&self) -> &dyn Any;
}

type NativeCallback = dyn Fn(LuaArgs) -> LuaResult<CallOutcome>;

/// A host closure callable from scripts.
///
/// The callback may return plain results, ask the machine to call a script
/// function and continue afterwards, or yield the running coroutine; see
/// [`CallOutcome`].
#[derive(Clone)]
pub struct LuaNativeFunction {
    func: Rc<NativeCallback>,
}

impl LuaNativeFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(LuaArgs) -> LuaResult<CallOutcome> + 'static,
    {
        LuaNativeFunction { func: Rc::new(f) }
    }

    /// A callback that only ever returns values.
    pub fn wrap<F, R>(f: F) -> Self
    where
        F: Fn(LuaArgs) -> LuaResult<R> + 'static,
        R: Into<LuaArgs>,
    {
        LuaNativeFunction::new(move |args| f(args).map(|r| CallOutcome::Return(r.into())))
    }

    #[inline]
    pub fn call(&self, args: LuaArgs) -> LuaResult<CallOutcome> {
        (self.func)(args)
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.func) as *const () as usize
    }
}

impl PartialEq for LuaNativeFunction {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for LuaNativeFunction {}

impl fmt::Debug for LuaNativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LuaNativeFunction({:#x})", self.addr())
    }
}
