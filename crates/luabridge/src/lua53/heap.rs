// Allocator handed to `lua_newstate`.
//
// Every block the interpreter asks for passes through `allocate`, which
// keeps a running total and consults the installed `AllocHook` before a
// block grows. Stack growth the backend itself requests is charged without
// asking (see `Unchecked`).

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::os::raw::c_void;
use std::ptr;
use std::rc::Rc;

use crate::lua_vm::{AllocHook, HookFn, StateHandle};

// Matches the alignment `malloc` guarantees, which the interpreter assumes.
#[cfg(target_pointer_width = "64")]
const BLOCK_ALIGN: usize = 16;
#[cfg(not(target_pointer_width = "64"))]
const BLOCK_ALIGN: usize = 8;

/// Host state shared by every thread of one interpreter. Lives in a box
/// passed as the allocator's `ud`, so any `lua_State` can reach it.
pub(super) struct VmShared {
    pub(super) handle: StateHandle,
    gate: RefCell<Option<Rc<dyn AllocHook>>>,
    in_use: Cell<usize>,
    unchecked: Cell<u32>,
    pub(super) hook: Cell<Option<HookFn>>,
}

impl VmShared {
    pub(super) fn new(handle: StateHandle) -> Self {
        VmShared {
            handle,
            gate: RefCell::new(None),
            in_use: Cell::new(0),
            unchecked: Cell::new(0),
            hook: Cell::new(None),
        }
    }

    pub(super) fn in_use(&self) -> usize {
        self.in_use.get()
    }

    /// Installs the gate and charges it for what the interpreter already holds.
    pub(super) fn set_gate(&self, gate: Rc<dyn AllocHook>) {
        gate.realloc_forced(0, self.in_use.get());
        *self.gate.borrow_mut() = Some(gate);
    }

    /// While the returned guard lives, growth is charged but never refused.
    pub(super) fn unchecked(&self) -> Unchecked<'_> {
        self.unchecked.set(self.unchecked.get() + 1);
        Unchecked(self)
    }

    fn admit(&self, old: usize, new: usize) -> bool {
        let Ok(gate) = self.gate.try_borrow() else {
            return true;
        };
        match gate.as_ref() {
            None => true,
            Some(gate) if new > old && self.unchecked.get() > 0 => {
                gate.realloc_forced(old, new);
                true
            }
            Some(gate) => gate.realloc(old, new),
        }
    }

    fn settle(&self, old: usize, new: usize) {
        self.in_use.set(self.in_use.get() - old + new);
    }
}

pub(super) struct Unchecked<'a>(&'a VmShared);

impl Drop for Unchecked<'_> {
    fn drop(&mut self) {
        self.0.unchecked.set(self.0.unchecked.get() - 1);
    }
}

fn block_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, BLOCK_ALIGN).ok()
}

/// `lua_Alloc` over the global allocator.
pub(super) unsafe extern "C" fn allocate(
    ud: *mut c_void,
    block: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    // SAFETY: `ud` is the boxed VmShared, freed only after lua_close.
    let shared = unsafe { &*(ud as *const VmShared) };
    // For a fresh block `osize` carries a type tag, not a size.
    let old = if block.is_null() { 0 } else { osize };

    if nsize == 0 {
        if let Some(layout) = block_layout(old).filter(|_| !block.is_null()) {
            // SAFETY: the block was allocated here with this layout.
            unsafe { alloc::dealloc(block.cast(), layout) };
            shared.admit(old, 0);
            shared.settle(old, 0);
        }
        return ptr::null_mut();
    }

    let Some(layout) = block_layout(nsize) else {
        return ptr::null_mut();
    };
    if !shared.admit(old, nsize) {
        return ptr::null_mut();
    }
    let grown = match block_layout(old).filter(|_| !block.is_null()) {
        // SAFETY: same block and layout as the previous allocation; nsize > 0.
        Some(old_layout) => unsafe { alloc::realloc(block.cast(), old_layout, nsize) },
        // SAFETY: nsize > 0.
        None => unsafe { alloc::alloc(layout) },
    };
    if grown.is_null() {
        shared.admit(nsize, old);
        return ptr::null_mut();
    }
    shared.settle(old, nsize);
    grown.cast()
}
