// Deferred native results
//
// A host callback either returns its results or hands the machine one more
// step to perform before it is finished: call a script function, or yield
// the running coroutine. The rest of the callback is a Continuation, parked
// in the ContinuationTable under a token the VM carries in its frame and
// passes back to the continuation trampoline.

use std::fmt;

use ahash::AHashMap;

use crate::lua_value::{LuaArgs, LuaValue};
use crate::lua_vm::LuaResult;

/// The rest of a native call; receives the results of the deferred step.
pub type Continuation = Box<dyn FnOnce(LuaArgs) -> LuaResult<CallOutcome>>;

/// What a host callback asks the machine to do.
pub enum CallOutcome {
    /// Finished with these results.
    Return(LuaArgs),
    /// Call `function` with `args`; its results go to `continuation`, whose
    /// outcome becomes the outcome of the original call. Errors raised by
    /// `function` propagate past the continuation.
    AsyncCall {
        function: LuaValue,
        args: LuaArgs,
        continuation: Continuation,
    },
    /// Suspend the running coroutine, handing `results` to the resumer. The
    /// resume arguments go to `continuation`, or become the call's results
    /// when there is none.
    Yield {
        results: LuaArgs,
        continuation: Option<Continuation>,
    },
}

impl CallOutcome {
    pub fn ret(results: impl Into<LuaArgs>) -> Self {
        CallOutcome::Return(results.into())
    }

    pub fn async_call<F>(function: impl Into<LuaValue>, args: impl Into<LuaArgs>, continuation: F) -> Self
    where
        F: FnOnce(LuaArgs) -> LuaResult<CallOutcome> + 'static,
    {
        CallOutcome::AsyncCall {
            function: function.into(),
            args: args.into(),
            continuation: Box::new(continuation),
        }
    }

    pub fn yield_then<F>(results: impl Into<LuaArgs>, continuation: F) -> Self
    where
        F: FnOnce(LuaArgs) -> LuaResult<CallOutcome> + 'static,
    {
        CallOutcome::Yield {
            results: results.into(),
            continuation: Some(Box::new(continuation)),
        }
    }

    /// Yield whose resume arguments are returned as-is.
    pub fn yield_values(results: impl Into<LuaArgs>) -> Self {
        CallOutcome::Yield {
            results: results.into(),
            continuation: None,
        }
    }
}

impl From<LuaArgs> for CallOutcome {
    fn from(results: LuaArgs) -> Self {
        CallOutcome::Return(results)
    }
}

impl fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Return(results) => f.debug_tuple("Return").field(results).finish(),
            CallOutcome::AsyncCall { function, args, .. } => f
                .debug_struct("AsyncCall")
                .field("function", function)
                .field("args", args)
                .finish_non_exhaustive(),
            CallOutcome::Yield {
                results,
                continuation,
            } => f
                .debug_struct("Yield")
                .field("results", results)
                .field("continuation", &continuation.is_some())
                .finish(),
        }
    }
}

/// Pending continuations keyed by token. Tokens are positive and never
/// reused; a negative token means "no continuation".
#[derive(Default)]
pub struct ContinuationTable {
    next_token: isize,
    pending: AHashMap<isize, Continuation>,
}

impl ContinuationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, continuation: Continuation) -> isize {
        self.next_token += 1;
        self.pending.insert(self.next_token, continuation);
        self.next_token
    }

    pub fn take(&mut self, token: isize) -> Option<Continuation> {
        self.pending.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every parked continuation (coroutines abandoned mid-yield).
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
