//! `FromLua` / `IntoLua`: conversions between Rust values and [`LuaValue`].
//!
//! `IntoLua` is implemented for everything that is `Into<LuaValue>`; the
//! `From` impls live next to the value type.
//!
//! # Built-in impls
//! - `bool`, `i8`..`i64`, `u8`..`u64`, `f32`, `f64`
//! - `String`, `Vec<u8>`, `LuaString`
//! - `LuaTable`, `LuaFunction`, `LuaCoroutine`
//! - `Option<T>` (nil maps to `None`)
//! - `LuaValue` (identity)
//!
//! An implementation returns `Err(expected_type_name)` on mismatch;
//! [`LuaArgs::get_as`](crate::LuaArgs::get_as) turns that into a
//! `bad argument` error.

use crate::lua_value::{LuaCoroutine, LuaFunction, LuaString, LuaTable, LuaValue};

pub trait FromLua: Sized {
    fn from_lua(value: &LuaValue) -> Result<Self, String>;
}

pub trait IntoLua {
    fn into_lua(self) -> LuaValue;
}

impl<T: Into<LuaValue>> IntoLua for T {
    #[inline]
    fn into_lua(self) -> LuaValue {
        self.into()
    }
}

// ==================== Identity ====================

impl FromLua for LuaValue {
    #[inline]
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        Ok(value.clone())
    }
}

// ==================== Booleans ====================

impl FromLua for bool {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        value.as_boolean().ok_or_else(|| "boolean".to_string())
    }
}

// ==================== Integers ====================

macro_rules! impl_from_lua_int {
    ($($t:ty),*) => {
        $(
            impl FromLua for $t {
                fn from_lua(value: &LuaValue) -> Result<Self, String> {
                    value
                        .as_integer()
                        .and_then(|i| <$t>::try_from(i).ok())
                        .ok_or_else(|| stringify!($t).to_string())
                }
            }
        )*
    };
}

impl_from_lua_int!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

// ==================== Floats ====================

impl FromLua for f64 {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        value.as_number().ok_or_else(|| "number".to_string())
    }
}

impl FromLua for f32 {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        value.as_number().map(|n| n as f32).ok_or_else(|| "number".to_string())
    }
}

// ==================== Strings ====================

impl FromLua for String {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        match value {
            LuaValue::String(s) => Ok(s.to_string_lossy().into_owned()),
            _ => Err("string".to_string()),
        }
    }
}

impl FromLua for LuaString {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        match value {
            LuaValue::String(s) => Ok(s.clone()),
            _ => Err("string".to_string()),
        }
    }
}

impl FromLua for Vec<u8> {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| "string".to_string())
    }
}

// ==================== Reference types ====================

impl FromLua for LuaTable {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        value.as_table().cloned().ok_or_else(|| "table".to_string())
    }
}

impl FromLua for LuaFunction {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        value.as_function().cloned().ok_or_else(|| "function".to_string())
    }
}

impl FromLua for LuaCoroutine {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        value.as_coroutine().cloned().ok_or_else(|| "thread".to_string())
    }
}

// ==================== Option ====================

impl<T: FromLua> FromLua for Option<T> {
    fn from_lua(value: &LuaValue) -> Result<Self, String> {
        match value {
            LuaValue::Nil => Ok(None),
            other => T::from_lua(other).map(Some),
        }
    }
}
