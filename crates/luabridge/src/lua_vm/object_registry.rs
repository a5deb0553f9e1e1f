// Object registry
//
// Every host object or host closure that crosses into a machine gets a
// monotonically increasing ObjectId and a VM-side proxy:
//   - objects become userdata (payload = id) sharing one metatable per type
//   - closures become native_trampoline closures whose only upvalue is a
//     userdata proxy (payload = id)
// Proxies are kept in two anchor tables inside the VM registry: a weak-valued
// one holding every live proxy and a strong one holding pinned proxies.
//
// VM values handed out to the host (script functions, coroutines) are
// entries too: they sit in both anchor tables until the host drops the last
// handle and the id comes back through the ReleaseQueue.
//
// Entries are only ever removed in `flush`, at the start of a session. A
// proxy's `__gc` may run in the middle of any allocation, so it only queues
// its id.

use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tracing::{debug, trace};

use crate::lua_value::{Anchor, LuaNativeFunction, LuaObject, LuaValue, ObjectId, ReleaseQueue};
use crate::lua_value::{LuaCoroutine, LuaFunction};
use crate::lua_vm::lua_limits::TYPE_NAME_FIELD;
use crate::lua_vm::trampoline::{
    continuation_gc, gc_trampoline, method_trampoline, native_trampoline,
};
use crate::lua_vm::{ApiResult, LuaApi, LuaType, StateHandle};

pub(crate) enum EntryTarget {
    Object(Rc<dyn LuaObject>),
    Function(LuaNativeFunction),
    /// Lives only in the VM; the host holds it through `handles`.
    VmValue { coroutine: bool },
}

pub(crate) struct RegistryEntry {
    pub(crate) target: EntryTarget,
    pub(crate) permanent: bool,
    /// Identity key in `by_host` / `by_vm`.
    key: usize,
}

pub(crate) struct ObjectRegistry {
    machine: StateHandle,
    releases: ReleaseQueue,
    next_id: ObjectId,
    entries: AHashMap<ObjectId, RegistryEntry>,
    by_host: AHashMap<usize, ObjectId>,
    by_vm: AHashMap<usize, ObjectId>,
    handles: AHashMap<ObjectId, Weak<Anchor>>,
    weak_anchors: i32,
    strong_anchors: i32,
    metatables: AHashMap<&'static str, i32>,
    function_metatable: i32,
    guard_metatable: i32,
}

/// Identity of a host object or closure.
pub(crate) fn host_key(value: &LuaValue) -> Option<usize> {
    match value {
        LuaValue::Object(o) => Some(Rc::as_ptr(o) as *const () as usize),
        LuaValue::NativeFunction(f) => Some(f.addr()),
        _ => None,
    }
}

impl ObjectRegistry {
    pub(crate) fn new(
        api: &mut dyn LuaApi,
        machine: StateHandle,
        releases: ReleaseQueue,
    ) -> ApiResult<Self> {
        api.create_table(0, 0)?;
        api.create_table(0, 1)?;
        api.push_str("__mode")?;
        api.push_str("v")?;
        api.raw_set(-3)?;
        api.set_metatable(-2);
        let weak_anchors = api.reference()?;

        api.create_table(0, 0)?;
        let strong_anchors = api.reference()?;

        api.create_table(0, 2)?;
        api.push_str("__gc")?;
        api.push_native(gc_trampoline, 0)?;
        api.raw_set(-3)?;
        api.push_str(TYPE_NAME_FIELD)?;
        api.push_str("native function")?;
        api.raw_set(-3)?;
        let function_metatable = api.reference()?;

        api.create_table(0, 2)?;
        api.push_str("__gc")?;
        api.push_native(continuation_gc, 0)?;
        api.raw_set(-3)?;
        api.push_str(TYPE_NAME_FIELD)?;
        api.push_str("continuation")?;
        api.raw_set(-3)?;
        let guard_metatable = api.reference()?;

        Ok(ObjectRegistry {
            machine,
            releases,
            next_id: 1,
            entries: AHashMap::new(),
            by_host: AHashMap::new(),
            by_vm: AHashMap::new(),
            handles: AHashMap::new(),
            weak_anchors,
            strong_anchors,
            metatables: AHashMap::new(),
            function_metatable,
            guard_metatable,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entry(&self, id: ObjectId) -> Option<&RegistryEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn object(&self, id: ObjectId) -> Option<Rc<dyn LuaObject>> {
        match &self.entries.get(&id)?.target {
            EntryTarget::Object(o) => Some(o.clone()),
            _ => None,
        }
    }

    pub(crate) fn function(&self, id: ObjectId) -> Option<LuaNativeFunction> {
        match &self.entries.get(&id)?.target {
            EntryTarget::Function(f) => Some(f.clone()),
            _ => None,
        }
    }

    /// The host-side value registered under `id`, if it is still alive.
    pub(crate) fn resolve(&self, id: ObjectId) -> Option<LuaValue> {
        match &self.entries.get(&id)?.target {
            EntryTarget::Object(o) => Some(LuaValue::Object(o.clone())),
            EntryTarget::Function(f) => Some(LuaValue::NativeFunction(f.clone())),
            EntryTarget::VmValue { coroutine } => {
                let anchor = self.handles.get(&id)?.upgrade()?;
                Some(if *coroutine {
                    LuaValue::Coroutine(LuaCoroutine::from_anchor(anchor))
                } else {
                    LuaValue::Function(LuaFunction::from_anchor(anchor))
                })
            }
        }
    }

    /// Id under which `value` is registered.
    pub(crate) fn id_of(&self, value: &LuaValue) -> Option<ObjectId> {
        match value {
            LuaValue::Function(f) => Some(f.id()),
            LuaValue::Coroutine(c) => Some(c.id()),
            other => {
                let id = *self.by_host.get(&host_key(other)?)?;
                self.entries.contains_key(&id).then_some(id)
            }
        }
    }

    // ===== Anchor tables =====

    /// Pushes the anchored VM value of `id`; pushes nothing and returns
    /// false when it is gone.
    pub(crate) fn push_anchored(&self, api: &mut dyn LuaApi, id: ObjectId) -> bool {
        api.push_reference(self.weak_anchors);
        let ty = api.raw_geti(-1, id);
        api.remove(-2);
        if ty == LuaType::Nil {
            api.pop(1);
            false
        } else {
            true
        }
    }

    /// Whether the VM still holds a proxy for `id`.
    pub(crate) fn proxy_alive(&self, api: &mut dyn LuaApi, id: ObjectId) -> bool {
        let alive = self.push_anchored(api, id);
        if alive {
            api.pop(1);
        }
        alive
    }

    /// Stores the value on top of the stack (left in place) under `id`.
    fn store_anchor(&self, api: &mut dyn LuaApi, table: i32, id: ObjectId) -> ApiResult<()> {
        api.push_reference(table);
        api.push_value(-2);
        let result = api.raw_seti(-2, id);
        api.pop(1);
        result
    }

    fn clear_anchor(&self, api: &mut dyn LuaApi, table: i32, id: ObjectId) {
        let top = api.get_top();
        api.push_reference(table);
        api.push_nil();
        if api.raw_seti(-2, id).is_err() {
            trace!(id, "anchor slot left in place");
        }
        api.set_top(top);
    }

    /// Pushes the userdata guarding continuation `token`. Its `__gc` hands
    /// the token back once the frame holding it is gone.
    pub(crate) fn push_continuation_guard(&self, api: &mut dyn LuaApi, token: isize) -> ApiResult<()> {
        api.new_userdata(token as u64)?;
        api.push_reference(self.guard_metatable);
        api.set_metatable(-2);
        Ok(())
    }

    // ===== Host values =====

    /// Pushes the proxy of an already registered host object or closure.
    pub(crate) fn push_for(&mut self, api: &mut dyn LuaApi, value: &LuaValue) -> bool {
        match host_key(value).and_then(|key| self.by_host.get(&key)) {
            Some(&id) => self.push_anchored(api, id),
            None => false,
        }
    }

    /// Pushes the proxy for a host object or closure, registering it on
    /// first sight. Returns its id.
    pub(crate) fn push_host(&mut self, api: &mut dyn LuaApi, value: &LuaValue) -> ApiResult<ObjectId> {
        let Some(key) = host_key(value) else {
            api.push_nil();
            return Ok(0);
        };
        if let Some(&id) = self.by_host.get(&key) {
            if self.push_anchored(api, id) {
                return Ok(id);
            }
            // The previous proxy was collected; its pending __gc sees the new
            // proxy alive and keeps the entry.
            self.create_proxy(api, id, value)?;
            self.store_anchor(api, self.weak_anchors, id)?;
            if self.entries.get(&id).is_some_and(|e| e.permanent) {
                self.store_anchor(api, self.strong_anchors, id)?;
            }
            return Ok(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.create_proxy(api, id, value)?;
        self.store_anchor(api, self.weak_anchors, id)?;
        let target = match value {
            LuaValue::Object(o) => EntryTarget::Object(o.clone()),
            LuaValue::NativeFunction(f) => EntryTarget::Function(f.clone()),
            _ => EntryTarget::VmValue { coroutine: false },
        };
        trace!(id, kind = value.type_name(), "anchored host value");
        self.entries.insert(
            id,
            RegistryEntry {
                target,
                permanent: false,
                key,
            },
        );
        self.by_host.insert(key, id);
        Ok(id)
    }

    fn create_proxy(&mut self, api: &mut dyn LuaApi, id: ObjectId, value: &LuaValue) -> ApiResult<()> {
        match value {
            LuaValue::Object(object) => {
                api.new_userdata(id as u64)?;
                self.push_object_metatable(api, object.as_ref())?;
                api.set_metatable(-2);
            }
            _ => {
                api.new_userdata(id as u64)?;
                api.push_reference(self.function_metatable);
                api.set_metatable(-2);
                api.push_native(native_trampoline, 1)?;
            }
        }
        Ok(())
    }

    fn push_object_metatable(&mut self, api: &mut dyn LuaApi, object: &dyn LuaObject) -> ApiResult<()> {
        let type_name = object.type_name();
        if let Some(&reference) = self.metatables.get(type_name) {
            api.push_reference(reference);
            return Ok(());
        }
        let methods = object.method_names();
        api.create_table(0, 3)?;
        api.push_str(TYPE_NAME_FIELD)?;
        api.push_str(type_name)?;
        api.raw_set(-3)?;
        api.push_str("__gc")?;
        api.push_native(gc_trampoline, 0)?;
        api.raw_set(-3)?;
        api.push_str("__index")?;
        api.create_table(0, methods.len())?;
        for name in methods {
            api.push_str(name)?;
            api.push_str(name)?;
            api.push_native(method_trampoline, 1)?;
            api.raw_set(-3)?;
        }
        api.raw_set(-3)?;
        api.push_value(-1);
        let reference = api.reference()?;
        debug!(type_name, methods = methods.len(), "built object metatable");
        self.metatables.insert(type_name, reference);
        Ok(())
    }

    /// Registers a host value and optionally pins it. Returns its id.
    pub(crate) fn anchor(&mut self, api: &mut dyn LuaApi, value: &LuaValue, permanent: bool) -> ApiResult<ObjectId> {
        let id = self.push_host(api, value)?;
        let result = if permanent { self.pin_top(api, id) } else { Ok(()) };
        api.pop(1);
        result.map(|_| id)
    }

    fn pin_top(&mut self, api: &mut dyn LuaApi, id: ObjectId) -> ApiResult<()> {
        let Some(entry) = self.entries.get(&id) else {
            return Ok(());
        };
        if !entry.permanent {
            self.store_anchor(api, self.strong_anchors, id)?;
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.permanent = true;
            }
        }
        Ok(())
    }

    /// Drops the strong anchor of `id`; the proxy lives on while the VM
    /// references it.
    pub(crate) fn unpin(&mut self, api: &mut dyn LuaApi, id: ObjectId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if matches!(entry.target, EntryTarget::VmValue { .. }) {
            return false;
        }
        if entry.permanent {
            entry.permanent = false;
            self.clear_anchor(api, self.strong_anchors, id);
        }
        true
    }

    // ===== VM values =====

    /// Anchors the VM value on top of the stack (left in place).
    pub(crate) fn anchor_stack_value(
        &mut self,
        api: &mut dyn LuaApi,
        permanent: bool,
        coroutine: bool,
    ) -> ApiResult<ObjectId> {
        let key = api.to_pointer(-1);
        if let Some(&id) = self.by_vm.get(&key)
            && self.entries.contains_key(&id)
            && self.same_anchored(api, id, key)
        {
            if permanent {
                self.pin_top(api, id)?;
            }
            return Ok(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.store_anchor(api, self.weak_anchors, id)?;
        if permanent {
            self.store_anchor(api, self.strong_anchors, id)?;
        }
        self.entries.insert(
            id,
            RegistryEntry {
                target: EntryTarget::VmValue { coroutine },
                permanent,
                key,
            },
        );
        self.by_vm.insert(key, id);
        trace!(id, coroutine, "anchored vm value");
        Ok(id)
    }

    fn same_anchored(&self, api: &mut dyn LuaApi, id: ObjectId, key: usize) -> bool {
        if !self.push_anchored(api, id) {
            return false;
        }
        let same = api.to_pointer(-1) == key;
        api.pop(1);
        same
    }

    /// Host handle for the VM value on top of the stack (left in place).
    /// The same VM value always yields the same live handle.
    pub(crate) fn handle_for_stack_value(&mut self, api: &mut dyn LuaApi, coroutine: bool) -> ApiResult<Rc<Anchor>> {
        let id = self.anchor_stack_value(api, true, coroutine)?;
        if let Some(anchor) = self.handles.get(&id).and_then(Weak::upgrade) {
            return Ok(anchor);
        }
        let anchor = Rc::new(Anchor::new(id, self.machine, self.releases.clone()));
        self.handles.insert(id, Rc::downgrade(&anchor));
        Ok(anchor)
    }

    // ===== Release =====

    /// Removes every entry released since the last flush, except those a
    /// live host handle still refers to. Collected proxies only take their
    /// entry along if no newer proxy replaced them.
    pub(crate) fn flush(&mut self, api: &mut dyn LuaApi) -> usize {
        let (released, collected) = self.releases.drain();
        if released.is_empty() && collected.is_empty() {
            return 0;
        }
        let mut removed = 0;
        for id in released {
            removed += self.remove_entry(api, id) as usize;
        }
        for id in collected {
            if self.entries.contains_key(&id) && !self.proxy_alive(api, id) {
                removed += self.remove_entry(api, id) as usize;
            }
        }
        debug!(removed, live = self.entries.len(), "flushed released objects");
        removed
    }

    fn remove_entry(&mut self, api: &mut dyn LuaApi, id: ObjectId) -> bool {
        if self.handles.get(&id).is_some_and(|h| h.strong_count() > 0) {
            return false;
        }
        self.handles.remove(&id);
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        let index = match entry.target {
            EntryTarget::VmValue { .. } => &mut self.by_vm,
            _ => &mut self.by_host,
        };
        if index.get(&entry.key) == Some(&id) {
            index.remove(&entry.key);
        }
        self.clear_anchor(api, self.weak_anchors, id);
        if entry.permanent {
            self.clear_anchor(api, self.strong_anchors, id);
        }
        true
    }
}
