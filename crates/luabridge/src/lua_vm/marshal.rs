// Value marshaling between LuaValue and the VM stack

use std::rc::Rc;

use ahash::AHashMap;

use crate::lua_value::{Anchor, LuaArgs, LuaCoroutine, LuaFunction, LuaString, LuaTable, LuaValue};
use crate::lua_vm::lua_limits::MAX_MARSHAL_DEPTH;
use crate::lua_vm::object_registry::ObjectRegistry;
use crate::lua_vm::trampoline::native_trampoline;
use crate::lua_vm::{
    LuaApi, LuaError, LuaResult, LuaType, NativeFn, Raised, StateHandle, TimeoutStage, VmStatus,
};

/// Converts a failed API call into a host error, popping the error object.
pub(crate) fn api_error(api: &mut dyn LuaApi, raised: Raised) -> LuaError {
    let message = api.to_bytes(-1).unwrap_or_default();
    api.pop(1);
    match raised.status() {
        VmStatus::MemoryError => LuaError::ResourceExhausted,
        _ => LuaError::Script(LuaValue::from(message)),
    }
}

/// Host error for an error object raised with `status`.
pub(crate) fn error_from_status(status: VmStatus, value: LuaValue) -> LuaError {
    match status {
        VmStatus::MemoryError => LuaError::ResourceExhausted,
        VmStatus::SyntaxError => LuaError::Syntax(
            value
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_else(|| value.to_string()),
        ),
        _ => match TimeoutStage::from_error_value(&value) {
            Some(stage) => LuaError::Timeout(stage),
            None => LuaError::Script(value),
        },
    }
}

/// Tables already converted during one `read_value`; `None` while in progress.
type SeenTables = AHashMap<usize, Option<LuaTable>>;

fn too_deep() -> LuaError {
    LuaError::Marshal(format!("table nesting deeper than {}", MAX_MARSHAL_DEPTH))
}

impl ObjectRegistry {
    // ===== Host -> VM =====

    /// Pushes `value`. Host tables are copied; a table containing itself
    /// keeps its cycle in the copy.
    pub(crate) fn push_value(&mut self, api: &mut dyn LuaApi, value: &LuaValue) -> LuaResult<()> {
        let mut in_progress = AHashMap::new();
        self.push_inner(api, value, &mut in_progress, 0)
    }

    pub(crate) fn push_args(&mut self, api: &mut dyn LuaApi, args: &LuaArgs) -> LuaResult<i32> {
        let mut in_progress = AHashMap::new();
        for value in args {
            self.push_inner(api, value, &mut in_progress, 0)?;
        }
        Ok(args.len() as i32)
    }

    fn push_inner(
        &mut self,
        api: &mut dyn LuaApi,
        value: &LuaValue,
        in_progress: &mut AHashMap<usize, i32>,
        depth: usize,
    ) -> LuaResult<()> {
        match value {
            LuaValue::Nil => api.push_nil(),
            LuaValue::Boolean(b) => api.push_boolean(*b),
            LuaValue::Integer(i) => api.push_integer(*i),
            LuaValue::Number(n) => api.push_number(*n),
            LuaValue::LightUserdata(p) => api.push_light_userdata(*p),
            LuaValue::String(s) => api
                .push_bytes(s.as_bytes())
                .map_err(|r| api_error(api, r))?,
            LuaValue::Table(table) => {
                if let Some(&slot) = in_progress.get(&table.addr()) {
                    api.push_value(slot);
                    return Ok(());
                }
                if depth >= MAX_MARSHAL_DEPTH {
                    return Err(too_deep());
                }
                api.create_table(table.sequence_len(), table.len())
                    .map_err(|r| api_error(api, r))?;
                let slot = api.abs_index(-1);
                in_progress.insert(table.addr(), slot);
                for (k, v) in table.pairs() {
                    self.push_inner(api, &k, in_progress, depth + 1)?;
                    self.push_inner(api, &v, in_progress, depth + 1)?;
                    if api.type_of(-2) == LuaType::Nil || api.type_of(-1) == LuaType::Nil {
                        api.pop(2);
                        continue;
                    }
                    api.raw_set(slot).map_err(|r| api_error(api, r))?;
                }
                in_progress.remove(&table.addr());
            }
            LuaValue::Object(_) | LuaValue::NativeFunction(_) => {
                self.push_host(api, value).map_err(|r| api_error(api, r))?;
            }
            LuaValue::Function(f) => self.push_handle(api, f.machine(), f.id(), "function")?,
            LuaValue::Coroutine(c) => self.push_handle(api, c.machine(), c.id(), "coroutine")?,
        }
        Ok(())
    }

    fn push_handle(
        &mut self,
        api: &mut dyn LuaApi,
        machine: StateHandle,
        id: i64,
        kind: &str,
    ) -> LuaResult<()> {
        if machine != api.handle() {
            return Err(LuaError::Marshal(format!("{} belongs to another machine", kind)));
        }
        if !self.push_anchored(api, id) {
            return Err(LuaError::Marshal(format!("{} #{} is no longer anchored", kind, id)));
        }
        Ok(())
    }

    // ===== VM -> host =====

    /// Reads the value at `idx`. Tables are copied; a table reached again
    /// while it is still being copied reads as nil.
    pub(crate) fn read_value(&mut self, api: &mut dyn LuaApi, idx: i32) -> LuaResult<LuaValue> {
        let idx = api.abs_index(idx);
        let mut seen = SeenTables::new();
        self.read_inner(api, idx, &mut seen, 0)
    }

    /// Reads `count` values starting at absolute index `first`.
    pub(crate) fn read_args(&mut self, api: &mut dyn LuaApi, first: i32, count: i32) -> LuaResult<LuaArgs> {
        let mut seen = SeenTables::new();
        let mut values = Vec::with_capacity(count.max(0) as usize);
        for idx in first..first + count {
            values.push(self.read_inner(api, idx, &mut seen, 0)?);
        }
        Ok(LuaArgs::from_vec(values))
    }

    fn read_inner(
        &mut self,
        api: &mut dyn LuaApi,
        idx: i32,
        seen: &mut SeenTables,
        depth: usize,
    ) -> LuaResult<LuaValue> {
        let value = match api.type_of(idx) {
            LuaType::None | LuaType::Nil => LuaValue::Nil,
            LuaType::Boolean => LuaValue::Boolean(api.to_boolean(idx)),
            LuaType::Number => {
                if api.is_integer(idx) {
                    LuaValue::Integer(api.to_integer(idx).unwrap_or_default())
                } else {
                    LuaValue::Number(api.to_number(idx).unwrap_or_default())
                }
            }
            LuaType::String => LuaValue::String(LuaString::new(api.to_bytes(idx).unwrap_or_default())),
            LuaType::LightUserdata => LuaValue::LightUserdata(api.to_light_userdata(idx).unwrap_or_default()),
            LuaType::Table => self.read_table(api, idx, seen, depth)?,
            LuaType::Function => self.read_function(api, idx)?,
            LuaType::Thread => LuaValue::Coroutine(LuaCoroutine::from_anchor(self.handle_at(api, idx, true)?)),
            LuaType::Userdata => {
                let id = api.to_userdata(idx).unwrap_or_default() as i64;
                // A released object reads as nothing.
                self.object(id).map_or(LuaValue::Nil, LuaValue::Object)
            }
        };
        Ok(value)
    }

    fn read_table(
        &mut self,
        api: &mut dyn LuaApi,
        idx: i32,
        seen: &mut SeenTables,
        depth: usize,
    ) -> LuaResult<LuaValue> {
        let key = api.to_pointer(idx);
        match seen.get(&key) {
            Some(Some(done)) => return Ok(LuaValue::Table(done.clone())),
            Some(None) => return Ok(LuaValue::Nil),
            None => {}
        }
        if depth >= MAX_MARSHAL_DEPTH {
            return Err(too_deep());
        }
        seen.insert(key, None);
        let table = LuaTable::new();
        let base = api.get_top();
        api.push_nil();
        while api.next(idx) {
            let top = api.get_top();
            let (k, v) = match self.read_entry(api, top, seen, depth + 1) {
                Ok(entry) => entry,
                Err(error) => {
                    api.set_top(base);
                    return Err(error);
                }
            };
            api.pop(1);
            if !k.is_nil() && !v.is_nil() {
                // Keys coming from the VM are never nil or NaN.
                let _ = table.set(k, v);
            }
        }
        seen.insert(key, Some(table.clone()));
        Ok(LuaValue::Table(table))
    }

    /// Reads the key/value pair `lua_next` left at `top - 1` and `top`.
    fn read_entry(
        &mut self,
        api: &mut dyn LuaApi,
        top: i32,
        seen: &mut SeenTables,
        depth: usize,
    ) -> LuaResult<(LuaValue, LuaValue)> {
        let k = self.read_inner(api, top - 1, seen, depth)?;
        let v = self.read_inner(api, top, seen, depth)?;
        Ok((k, v))
    }

    fn read_function(&mut self, api: &mut dyn LuaApi, idx: i32) -> LuaResult<LuaValue> {
        if let Some(f) = api.to_native(idx)
            && std::ptr::fn_addr_eq(f, native_trampoline as NativeFn)
        {
            if !api.get_upvalue(idx, 1) {
                return Ok(LuaValue::Nil);
            }
            let id = api.to_userdata(-1).unwrap_or_default() as i64;
            api.pop(1);
            return Ok(self.function(id).map_or(LuaValue::Nil, LuaValue::NativeFunction));
        }
        Ok(LuaValue::Function(LuaFunction::from_anchor(self.handle_at(api, idx, false)?)))
    }

    fn handle_at(&mut self, api: &mut dyn LuaApi, idx: i32, coroutine: bool) -> LuaResult<Rc<Anchor>> {
        api.push_value(idx);
        match self.handle_for_stack_value(api, coroutine) {
            Ok(anchor) => {
                api.pop(1);
                Ok(anchor)
            }
            Err(raised) => {
                let error = api_error(api, raised);
                api.pop(1);
                Err(error)
            }
        }
    }
}
