mod lua_args;
mod lua_convert;
mod lua_handle;
mod lua_object;
mod lua_table;
#[allow(clippy::module_inception)]
mod lua_value;

pub use lua_args::LuaArgs;
pub use lua_convert::{FromLua, IntoLua};
pub(crate) use lua_handle::Anchor;
pub use lua_handle::{LuaCoroutine, LuaFunction, ObjectId, ReleaseQueue};
pub use lua_object::{LuaNativeFunction, LuaObject};
pub use lua_table::LuaTable;
pub use lua_value::{float_to_integer, format_number, LuaString, LuaValue, LuaValueKind};
