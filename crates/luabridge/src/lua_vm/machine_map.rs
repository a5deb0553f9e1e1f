// StateHandle -> machine lookup for native trampolines
//
// Trampolines only receive `&mut dyn LuaApi`; its handle is the key. A
// machine registers itself on construction and unregisters on close/drop.
// Machines are !Send, so the map is per host thread.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::lua_vm::StateHandle;
use crate::lua_vm::machine::MachineCore;

thread_local! {
    static MACHINES: RefCell<AHashMap<StateHandle, Weak<MachineCore>>> =
        RefCell::new(AHashMap::new());
}

pub(crate) fn register(handle: StateHandle, core: &Rc<MachineCore>) {
    MACHINES.with(|m| {
        m.borrow_mut().insert(handle, Rc::downgrade(core));
    });
}

pub(crate) fn unregister(handle: StateHandle) {
    // Ignore teardown order problems during thread exit.
    let _ = MACHINES.try_with(|m| {
        m.borrow_mut().remove(&handle);
    });
}

pub(crate) fn lookup(handle: StateHandle) -> Option<Rc<MachineCore>> {
    MACHINES.with(|m| m.borrow().get(&handle).and_then(Weak::upgrade))
}

#[cfg(test)]
pub(crate) fn registered_count() -> usize {
    MACHINES.with(|m| m.borrow().len())
}
