// Argument lists
// Arguments and results travel as LuaArgs: a small inline buffer for the
// common case, or a shared slice so that `select` can hand out views
// without copying.

use std::fmt;
use std::ops::Index;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::lua_value::{FromLua, LuaFunction, LuaObject, LuaTable, LuaValue};
use crate::lua_vm::lua_limits::INLINE_ARGS;
use crate::lua_vm::{LuaError, LuaResult};

#[derive(Clone)]
pub struct LuaArgs {
    repr: ArgsRepr,
}

#[derive(Clone)]
enum ArgsRepr {
    Inline(SmallVec<[LuaValue; INLINE_ARGS]>),
    Shared {
        values: Rc<[LuaValue]>,
        start: usize,
        len: usize,
    },
}

const NIL: &LuaValue = &LuaValue::Nil;

impl LuaArgs {
    pub fn empty() -> Self {
        LuaArgs {
            repr: ArgsRepr::Inline(SmallVec::new()),
        }
    }

    pub fn single(value: impl Into<LuaValue>) -> Self {
        let mut inline = SmallVec::new();
        inline.push(value.into());
        LuaArgs {
            repr: ArgsRepr::Inline(inline),
        }
    }

    pub fn from_vec(values: Vec<LuaValue>) -> Self {
        if values.len() <= INLINE_ARGS {
            LuaArgs {
                repr: ArgsRepr::Inline(SmallVec::from_vec(values)),
            }
        } else {
            let len = values.len();
            LuaArgs {
                repr: ArgsRepr::Shared {
                    values: Rc::from(values),
                    start: 0,
                    len,
                },
            }
        }
    }

    pub fn as_slice(&self) -> &[LuaValue] {
        match &self.repr {
            ArgsRepr::Inline(v) => v.as_slice(),
            ArgsRepr::Shared { values, start, len } => &values[*start..*start + *len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value at `index` (0-based); nil past the end.
    pub fn get(&self, index: usize) -> &LuaValue {
        self.as_slice().get(index).unwrap_or(NIL)
    }

    pub fn first(&self) -> &LuaValue {
        self.get(0)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LuaValue> {
        self.as_slice().iter()
    }

    pub fn to_vec(&self) -> Vec<LuaValue> {
        self.as_slice().to_vec()
    }

    /// Everything from `start` on.
    pub fn select(&self, start: usize) -> LuaArgs {
        let len = self.len().saturating_sub(start);
        self.select_range(start, len)
    }

    /// A view of `len` values starting at `start`, clamped to the list.
    /// Shared lists keep pointing at the same backing storage.
    pub fn select_range(&self, start: usize, len: usize) -> LuaArgs {
        let total = self.len();
        let start = start.min(total);
        let len = len.min(total - start);
        match &self.repr {
            ArgsRepr::Inline(v) => LuaArgs {
                repr: ArgsRepr::Inline(v[start..start + len].iter().cloned().collect()),
            },
            ArgsRepr::Shared {
                values,
                start: base,
                ..
            } => LuaArgs {
                repr: ArgsRepr::Shared {
                    values: values.clone(),
                    start: base + start,
                    len,
                },
            },
        }
    }

    /// A new list holding `a` followed by `b`.
    pub fn concat(a: &LuaArgs, b: &LuaArgs) -> LuaArgs {
        if b.is_empty() {
            return a.clone();
        }
        if a.is_empty() {
            return b.clone();
        }
        a.iter().chain(b.iter()).cloned().collect()
    }

    /// Typed accessor with Lua-style error wording (`position` is 1-based
    /// in the message, matching what scripts see).
    pub fn get_as<T: FromLua>(&self, index: usize) -> LuaResult<T> {
        let value = self.get(index);
        T::from_lua(value).map_err(|expected| LuaError::bad_argument(index + 1, &expected, value))
    }

    pub fn get_integer(&self, index: usize) -> LuaResult<i64> {
        let value = self.get(index);
        value
            .as_integer()
            .ok_or_else(|| LuaError::bad_argument(index + 1, "integer", value))
    }

    pub fn get_number(&self, index: usize) -> LuaResult<f64> {
        let value = self.get(index);
        value
            .as_number()
            .ok_or_else(|| LuaError::bad_argument(index + 1, "number", value))
    }

    pub fn get_bool(&self, index: usize) -> LuaResult<bool> {
        let value = self.get(index);
        value
            .as_boolean()
            .ok_or_else(|| LuaError::bad_argument(index + 1, "boolean", value))
    }

    pub fn get_string(&self, index: usize) -> LuaResult<String> {
        let value = self.get(index);
        match value {
            LuaValue::String(s) => Ok(s.to_string_lossy().into_owned()),
            _ => Err(LuaError::bad_argument(index + 1, "string", value)),
        }
    }

    pub fn get_table(&self, index: usize) -> LuaResult<LuaTable> {
        let value = self.get(index);
        value
            .as_table()
            .cloned()
            .ok_or_else(|| LuaError::bad_argument(index + 1, "table", value))
    }

    pub fn get_bytes(&self, index: usize) -> LuaResult<Vec<u8>> {
        let value = self.get(index);
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| LuaError::bad_argument(index + 1, "string", value))
    }

    pub fn get_function(&self, index: usize) -> LuaResult<LuaFunction> {
        let value = self.get(index);
        value
            .as_function()
            .cloned()
            .ok_or_else(|| LuaError::bad_argument(index + 1, "function", value))
    }

    /// Host object of type `T` at `index`; a released object reads as nil.
    pub fn get_object<T: LuaObject + 'static>(&self, index: usize) -> LuaResult<&T> {
        let value = self.get(index);
        value.downcast_object::<T>().ok_or_else(|| {
            let expected = std::any::type_name::<T>().rsplit("::").next().unwrap_or("object");
            LuaError::bad_argument(index + 1, expected, value)
        })
    }

    pub fn get_optional_integer(&self, index: usize, default: i64) -> LuaResult<i64> {
        match self.get(index) {
            LuaValue::Nil => Ok(default),
            _ => self.get_integer(index),
        }
    }

    pub fn get_optional_number(&self, index: usize, default: f64) -> LuaResult<f64> {
        match self.get(index) {
            LuaValue::Nil => Ok(default),
            _ => self.get_number(index),
        }
    }

    pub fn get_optional_string(&self, index: usize, default: &str) -> LuaResult<String> {
        match self.get(index) {
            LuaValue::Nil => Ok(default.to_owned()),
            _ => self.get_string(index),
        }
    }

    pub fn get_optional_bool(&self, index: usize, default: bool) -> LuaResult<bool> {
        match self.get(index) {
            LuaValue::Nil => Ok(default),
            _ => self.get_bool(index),
        }
    }

    /// Type name of the argument at `index` (`"nil"` past the end).
    pub fn type_name(&self, index: usize) -> &'static str {
        self.get(index).type_name()
    }

    pub fn is_nil(&self, index: usize) -> bool {
        self.get(index).is_nil()
    }
}

impl Default for LuaArgs {
    fn default() -> Self {
        LuaArgs::empty()
    }
}

impl FromIterator<LuaValue> for LuaArgs {
    fn from_iter<I: IntoIterator<Item = LuaValue>>(iter: I) -> Self {
        let inline: SmallVec<[LuaValue; INLINE_ARGS]> = iter.into_iter().collect();
        if inline.spilled() {
            LuaArgs::from_vec(inline.into_vec())
        } else {
            LuaArgs {
                repr: ArgsRepr::Inline(inline),
            }
        }
    }
}

impl From<Vec<LuaValue>> for LuaArgs {
    fn from(values: Vec<LuaValue>) -> Self {
        LuaArgs::from_vec(values)
    }
}

impl From<LuaValue> for LuaArgs {
    fn from(value: LuaValue) -> Self {
        LuaArgs::single(value)
    }
}

impl From<()> for LuaArgs {
    fn from(_: ()) -> Self {
        LuaArgs::empty()
    }
}

impl Index<usize> for LuaArgs {
    type Output = LuaValue;

    fn index(&self, index: usize) -> &LuaValue {
        self.get(index)
    }
}

impl<'a> IntoIterator for &'a LuaArgs {
    type Item = &'a LuaValue;
    type IntoIter = std::slice::Iter<'a, LuaValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl PartialEq for LuaArgs {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for LuaArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Builds a [`LuaArgs`] from anything convertible into a [`LuaValue`].
///
/// ```ignore
/// let args = args![2, 3, "three"];
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::LuaArgs::empty()
    };
    ($($value:expr),+ $(,)?) => {
        [$($crate::LuaValue::from($value)),+]
            .into_iter()
            .collect::<$crate::LuaArgs>()
    };
}
