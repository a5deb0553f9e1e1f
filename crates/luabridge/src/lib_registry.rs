// Host libraries
// A named bundle of host callbacks and constants, published as one global
// table (or straight into the globals when named `_G`).

use crate::lua_value::{LuaArgs, LuaNativeFunction, LuaValue};
use crate::lua_vm::LuaResult;

pub enum LibraryEntry {
    Function(LuaNativeFunction),
    Value(LuaValue),
}

/// Contents of one global table, in registration order.
pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, LibraryEntry)>,
}

impl LibraryModule {
    pub const fn new(name: &'static str) -> Self {
        LibraryModule {
            name,
            entries: Vec::new(),
        }
    }

    pub fn with_function(mut self, name: &'static str, function: LuaNativeFunction) -> Self {
        self.entries.push((name, LibraryEntry::Function(function)));
        self
    }

    /// Shorthand for a callback that only returns values.
    pub fn with_fn<F, R>(self, name: &'static str, f: F) -> Self
    where
        F: Fn(LuaArgs) -> LuaResult<R> + 'static,
        R: Into<LuaArgs>,
    {
        self.with_function(name, LuaNativeFunction::wrap(f))
    }

    pub fn with_value(mut self, name: &'static str, value: impl Into<LuaValue>) -> Self {
        self.entries.push((name, LibraryEntry::Value(value.into())));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `lib_module!("name", { "f" => |args| ..., ... })` builds a
/// [`LibraryModule`] of plain-return callbacks.
#[macro_export]
macro_rules! lib_module {
    ($name:expr, {
        $($item_name:expr => $item:expr),* $(,)?
    }) => {{
        let mut module = $crate::lib_registry::LibraryModule::new($name);
        $(
            module = module.with_fn($item_name, $item);
        )*
        module
    }};
}
