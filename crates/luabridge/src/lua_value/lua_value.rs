// Boundary value model
// Every value that crosses between host code and the VM is a LuaValue.

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::lua_value::{LuaArgs, LuaCoroutine, LuaFunction, LuaNativeFunction, LuaObject, LuaTable};

/// Discriminant of a [`LuaValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaValueKind {
    Nil,
    Boolean,
    Integer,
    Number,
    String,
    Table,
    Object,
    NativeFunction,
    Function,
    Coroutine,
    LightUserdata,
}

/// An immutable byte string. Text and raw bytes share this one type, so a
/// string built from `&str` compares equal to the same bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LuaString(Rc<[u8]>);

impl LuaString {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        LuaString(Rc::from(bytes.as_ref()))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl fmt::Display for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl From<&str> for LuaString {
    fn from(s: &str) -> Self {
        LuaString::new(s)
    }
}

impl From<String> for LuaString {
    fn from(s: String) -> Self {
        LuaString(Rc::from(s.into_bytes().into_boxed_slice()))
    }
}

impl From<&[u8]> for LuaString {
    fn from(b: &[u8]) -> Self {
        LuaString::new(b)
    }
}

impl From<Vec<u8>> for LuaString {
    fn from(b: Vec<u8>) -> Self {
        LuaString(Rc::from(b.into_boxed_slice()))
    }
}

/// Tagged union of everything the bridge can marshal.
///
/// Integers and floats compare (and hash) numerically, so `Integer(1)` and
/// `Number(1.0)` are the same table key. Tables, objects and functions
/// compare by identity.
#[derive(Clone, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(LuaString),
    Table(LuaTable),
    /// A host object exposed to scripts as userdata
    Object(Rc<dyn LuaObject>),
    /// A host closure callable from scripts
    NativeFunction(LuaNativeFunction),
    /// A script function owned by a machine
    Function(LuaFunction),
    Coroutine(LuaCoroutine),
    LightUserdata(usize),
}

impl LuaValue {
    pub fn kind(&self) -> LuaValueKind {
        match self {
            LuaValue::Nil => LuaValueKind::Nil,
            LuaValue::Boolean(_) => LuaValueKind::Boolean,
            LuaValue::Integer(_) => LuaValueKind::Integer,
            LuaValue::Number(_) => LuaValueKind::Number,
            LuaValue::String(_) => LuaValueKind::String,
            LuaValue::Table(_) => LuaValueKind::Table,
            LuaValue::Object(_) => LuaValueKind::Object,
            LuaValue::NativeFunction(_) => LuaValueKind::NativeFunction,
            LuaValue::Function(_) => LuaValueKind::Function,
            LuaValue::Coroutine(_) => LuaValueKind::Coroutine,
            LuaValue::LightUserdata(_) => LuaValueKind::LightUserdata,
        }
    }

    /// The name scripts see from `type()`.
    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Boolean(_) => "boolean",
            LuaValue::Integer(_) | LuaValue::Number(_) => "number",
            LuaValue::String(_) => "string",
            LuaValue::Table(_) => "table",
            LuaValue::Object(_) | LuaValue::LightUserdata(_) => "userdata",
            LuaValue::NativeFunction(_) | LuaValue::Function(_) => "function",
            LuaValue::Coroutine(_) => "thread",
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    /// Lua truthiness: everything except nil and false.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, LuaValue::NativeFunction(_) | LuaValue::Function(_))
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            LuaValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value; floats with an exact integer representation convert.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            LuaValue::Integer(i) => Some(*i),
            LuaValue::Number(n) => float_to_integer(*n),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            LuaValue::Integer(i) => Some(*i as f64),
            LuaValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LuaValue::String(s) => s.to_str(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            LuaValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&LuaTable> {
        match self {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Rc<dyn LuaObject>> {
        match self {
            LuaValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Downcasts an object value to its concrete host type.
    pub fn downcast_object<T: LuaObject + 'static>(&self) -> Option<&T> {
        self.as_object()?.as_any().downcast_ref::<T>()
    }

    pub fn as_function(&self) -> Option<&LuaFunction> {
        match self {
            LuaValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_coroutine(&self) -> Option<&LuaCoroutine> {
        match self {
            LuaValue::Coroutine(c) => Some(c),
            _ => None,
        }
    }

    /// Structural equality: tables compare by content (recursively),
    /// everything else by `==`.
    pub fn deep_equals(&self, other: &LuaValue) -> bool {
        deep_equals_at(self, other, 0)
    }

    /// Wraps this value into a single-element argument list.
    pub fn into_args(self) -> LuaArgs {
        LuaArgs::single(self)
    }
}

const DEEP_EQUALS_MAX_DEPTH: usize = 64;

fn deep_equals_at(a: &LuaValue, b: &LuaValue, depth: usize) -> bool {
    match (a, b) {
        (LuaValue::Table(x), LuaValue::Table(y)) => {
            if x == y {
                return true;
            }
            if depth >= DEEP_EQUALS_MAX_DEPTH || x.len() != y.len() {
                return false;
            }
            x.pairs()
                .iter()
                .all(|(k, v)| deep_equals_at(v, &y.get(k.clone()), depth + 1))
        }
        _ => a == b,
    }
}

/// Exact float to integer conversion (no rounding).
pub fn float_to_integer(n: f64) -> Option<i64> {
    // 2^63 is exactly representable; anything at or above it overflows i64
    if n.fract() == 0.0 && n >= -9_223_372_036_854_775_808.0 && n < 9_223_372_036_854_775_808.0 {
        Some(n as i64)
    } else {
        None
    }
}

/// Formats a float the way scripts print it (`1.0`, `0.5`, `inf`, `nan`).
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{:.1}", n)
    } else {
        format!("{}", n)
    }
}

fn object_addr(o: &Rc<dyn LuaObject>) -> usize {
    Rc::as_ptr(o) as *const () as usize
}

impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Number(a), LuaValue::Number(b)) => a == b,
            (LuaValue::Integer(i), LuaValue::Number(n)) | (LuaValue::Number(n), LuaValue::Integer(i)) => {
                float_to_integer(*n) == Some(*i)
            }
            (LuaValue::String(a), LuaValue::String(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => a == b,
            (LuaValue::Object(a), LuaValue::Object(b)) => object_addr(a) == object_addr(b),
            (LuaValue::NativeFunction(a), LuaValue::NativeFunction(b)) => a == b,
            (LuaValue::Function(a), LuaValue::Function(b)) => a == b,
            (LuaValue::Coroutine(a), LuaValue::Coroutine(b)) => a == b,
            (LuaValue::LightUserdata(a), LuaValue::LightUserdata(b)) => a == b,
            _ => false,
        }
    }
}

// NaN is the only value that is not equal to itself; tables refuse it as a key.
impl Eq for LuaValue {}

impl Hash for LuaValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            LuaValue::Nil => 0u8.hash(state),
            LuaValue::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            LuaValue::Integer(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            LuaValue::Number(n) => match float_to_integer(*n) {
                Some(i) => {
                    2u8.hash(state);
                    i.hash(state);
                }
                None => {
                    3u8.hash(state);
                    n.to_bits().hash(state);
                }
            },
            LuaValue::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            LuaValue::Table(t) => {
                5u8.hash(state);
                t.addr().hash(state);
            }
            LuaValue::Object(o) => {
                6u8.hash(state);
                object_addr(o).hash(state);
            }
            LuaValue::NativeFunction(f) => {
                7u8.hash(state);
                f.addr().hash(state);
            }
            LuaValue::Function(f) => {
                8u8.hash(state);
                f.id().hash(state);
            }
            LuaValue::Coroutine(c) => {
                9u8.hash(state);
                c.id().hash(state);
            }
            LuaValue::LightUserdata(p) => {
                10u8.hash(state);
                p.hash(state);
            }
        }
    }
}

impl fmt::Display for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => f.write_str("nil"),
            LuaValue::Boolean(b) => write!(f, "{}", b),
            LuaValue::Integer(i) => f.write_str(itoa::Buffer::new().format(*i)),
            LuaValue::Number(n) => f.write_str(&format_number(*n)),
            LuaValue::String(s) => write!(f, "{}", s),
            LuaValue::Table(t) => write!(f, "table: {:#x}", t.addr()),
            LuaValue::Object(o) => write!(f, "{}: {:#x}", o.type_name(), object_addr(o)),
            LuaValue::NativeFunction(n) => write!(f, "function: builtin: {:#x}", n.addr()),
            LuaValue::Function(func) => write!(f, "function: #{}", func.id()),
            LuaValue::Coroutine(c) => write!(f, "thread: #{}", c.id()),
            LuaValue::LightUserdata(p) => write!(f, "userdata: {:#x}", p),
        }
    }
}

impl fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::String(s) => write!(f, "String({:?})", s),
            LuaValue::Integer(i) => write!(f, "Integer({})", i),
            LuaValue::Number(n) => write!(f, "Number({})", n),
            LuaValue::Table(t) => write!(f, "Table({:#x}, {} entries)", t.addr(), t.len()),
            other => write!(f, "{}", other),
        }
    }
}

// ==================== Conversions into LuaValue ====================

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for LuaValue {
                #[inline]
                fn from(n: $t) -> Self {
                    LuaValue::Integer(n as i64)
                }
            }
        )*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32, isize);

impl From<f64> for LuaValue {
    fn from(n: f64) -> Self {
        LuaValue::Number(n)
    }
}

impl From<f32> for LuaValue {
    fn from(n: f32) -> Self {
        LuaValue::Number(n as f64)
    }
}

impl From<&str> for LuaValue {
    fn from(s: &str) -> Self {
        LuaValue::String(LuaString::from(s))
    }
}

impl From<String> for LuaValue {
    fn from(s: String) -> Self {
        LuaValue::String(LuaString::from(s))
    }
}

impl From<&[u8]> for LuaValue {
    fn from(b: &[u8]) -> Self {
        LuaValue::String(LuaString::from(b))
    }
}

impl From<Vec<u8>> for LuaValue {
    fn from(b: Vec<u8>) -> Self {
        LuaValue::String(LuaString::from(b))
    }
}

impl From<LuaString> for LuaValue {
    fn from(s: LuaString) -> Self {
        LuaValue::String(s)
    }
}

impl From<LuaTable> for LuaValue {
    fn from(t: LuaTable) -> Self {
        LuaValue::Table(t)
    }
}

impl From<LuaNativeFunction> for LuaValue {
    fn from(f: LuaNativeFunction) -> Self {
        LuaValue::NativeFunction(f)
    }
}

impl From<LuaFunction> for LuaValue {
    fn from(f: LuaFunction) -> Self {
        LuaValue::Function(f)
    }
}

impl From<LuaCoroutine> for LuaValue {
    fn from(c: LuaCoroutine) -> Self {
        LuaValue::Coroutine(c)
    }
}

impl From<Rc<dyn LuaObject>> for LuaValue {
    fn from(o: Rc<dyn LuaObject>) -> Self {
        LuaValue::Object(o)
    }
}

impl<T: Into<LuaValue>> From<Option<T>> for LuaValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(LuaValue::Nil, Into::into)
    }
}
