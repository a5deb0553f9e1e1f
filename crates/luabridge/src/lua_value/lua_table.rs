// Host-side table
// A shared, mutable key/value map with Lua table rules: nil values are
// absent, nil and NaN keys are rejected, float keys with an integer value
// are stored as integers.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::lua_value::{float_to_integer, LuaValue};
use crate::lua_vm::{LuaError, LuaResult};

#[derive(Clone, Default)]
pub struct LuaTable {
    entries: Rc<RefCell<AHashMap<LuaValue, LuaValue>>>,
}

impl LuaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        LuaTable {
            entries: Rc::new(RefCell::new(AHashMap::with_capacity(capacity))),
        }
    }

    /// Builds a sequence `{v1, v2, ...}`; nil elements leave holes.
    pub fn from_sequence<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<LuaValue>,
    {
        let table = LuaTable::new();
        {
            let mut entries = table.entries.borrow_mut();
            for (i, v) in values.into_iter().enumerate() {
                let v = v.into();
                if !v.is_nil() {
                    entries.insert(LuaValue::Integer(i as i64 + 1), v);
                }
            }
        }
        table
    }

    /// Builds a table from key/value pairs, failing on an invalid key.
    pub fn from_pairs<I, K, V>(pairs: I) -> LuaResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<LuaValue>,
        V: Into<LuaValue>,
    {
        let table = LuaTable::new();
        for (k, v) in pairs {
            table.set(k, v)?;
        }
        Ok(table)
    }

    pub fn get(&self, key: impl Into<LuaValue>) -> LuaValue {
        let key = normalize_key(key.into());
        self.entries.borrow().get(&key).cloned().unwrap_or_default()
    }

    /// Assigns `t[key] = value`. Assigning nil removes the entry.
    pub fn set(&self, key: impl Into<LuaValue>, value: impl Into<LuaValue>) -> LuaResult<()> {
        let key = normalize_key(key.into());
        match &key {
            LuaValue::Nil => return Err(LuaError::runtime("table index is nil")),
            LuaValue::Number(n) if n.is_nan() => {
                return Err(LuaError::runtime("table index is NaN"));
            }
            _ => {}
        }
        let value = value.into();
        let mut entries = self.entries.borrow_mut();
        if value.is_nil() {
            entries.remove(&key);
        } else {
            entries.insert(key, value);
        }
        Ok(())
    }

    pub fn contains_key(&self, key: impl Into<LuaValue>) -> bool {
        let key = normalize_key(key.into());
        self.entries.borrow().contains_key(&key)
    }

    /// Appends at the border (`t[#t + 1] = value`).
    pub fn push(&self, value: impl Into<LuaValue>) -> LuaResult<()> {
        let n = self.sequence_len();
        self.set(n as i64 + 1, value)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Length of the sequence part (`#t` for tables without holes).
    pub fn sequence_len(&self) -> usize {
        let entries = self.entries.borrow();
        let mut n = 0usize;
        while entries.contains_key(&LuaValue::Integer(n as i64 + 1)) {
            n += 1;
        }
        n
    }

    /// Snapshot of all entries in unspecified order.
    pub fn pairs(&self) -> Vec<(LuaValue, LuaValue)> {
        self.entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of `t[1] .. t[#t]`.
    pub fn sequence(&self) -> Vec<LuaValue> {
        let entries = self.entries.borrow();
        let mut out = Vec::new();
        while let Some(v) = entries.get(&LuaValue::Integer(out.len() as i64 + 1)) {
            out.push(v.clone());
        }
        out
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// Identity of the underlying storage.
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.entries) as *const () as usize
    }
}

fn normalize_key(key: LuaValue) -> LuaValue {
    match key {
        LuaValue::Number(n) => match float_to_integer(n) {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n),
        },
        other => other,
    }
}

impl PartialEq for LuaTable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.entries, &other.entries)
    }
}

impl Eq for LuaTable {}

impl fmt::Debug for LuaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LuaTable({:#x}, {} entries)", self.addr(), self.len())
    }
}
