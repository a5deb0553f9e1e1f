// Handles to VM-owned values
//
// A script function or coroutine handed to the host is anchored in the
// machine's object registry under an ObjectId. The host side holds a
// reference-counted Anchor; dropping the last clone enqueues the id on the
// machine's ReleaseQueue, which the machine drains at the start of the next
// top-level call. The handles themselves hold an `Rc` and stay on the
// machine's thread. Only a ReleaseQueue clone may be moved to another thread
// and release ids from there.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::lua_vm::StateHandle;

/// Registry identifier of an anchored value. Ids start at 1 and are never
/// reused within one machine.
pub type ObjectId = i64;

#[derive(Default)]
struct Pending {
    released: Vec<ObjectId>,
    collected: Vec<ObjectId>,
}

/// Ids waiting for the machine to drop their registry entries: released by
/// their host-side owner, or reported by the VM when a proxy was collected.
#[derive(Clone, Default)]
pub struct ReleaseQueue {
    pending: Arc<Mutex<Pending>>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `id`; never blocks on the machine.
    pub fn release(&self, id: ObjectId) {
        self.pending.lock().released.push(id);
    }

    /// Reports a collected proxy. The entry survives if a newer proxy for
    /// the same id exists by the time the queue is drained.
    pub(crate) fn collected(&self, id: ObjectId) {
        self.pending.lock().collected.push(id);
    }

    /// Takes `(released, collected)`.
    pub(crate) fn drain(&self) -> (Vec<ObjectId>, Vec<ObjectId>) {
        let mut pending = self.pending.lock();
        (
            std::mem::take(&mut pending.released),
            std::mem::take(&mut pending.collected),
        )
    }

    pub fn len(&self) -> usize {
        let pending = self.pending.lock();
        pending.released.len() + pending.collected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ReleaseQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseQueue")
            .field("pending", &self.len())
            .finish()
    }
}

/// Keeps one registry entry alive on the host side.
pub(crate) struct Anchor {
    id: ObjectId,
    machine: StateHandle,
    releases: ReleaseQueue,
}

impl Anchor {
    pub(crate) fn new(id: ObjectId, machine: StateHandle, releases: ReleaseQueue) -> Self {
        Anchor {
            id,
            machine,
            releases,
        }
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }
}

impl Drop for Anchor {
    fn drop(&mut self) {
        self.releases.release(self.id);
    }
}

macro_rules! anchored_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            anchor: Rc<Anchor>,
        }

        impl $name {
            pub(crate) fn from_anchor(anchor: Rc<Anchor>) -> Self {
                $name { anchor }
            }

            pub(crate) fn anchor(&self) -> &Rc<Anchor> {
                &self.anchor
            }

            pub fn id(&self) -> ObjectId {
                self.anchor.id
            }

            /// The machine this value lives in.
            pub fn machine(&self) -> StateHandle {
                self.anchor.machine
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.anchor.id == other.anchor.id && self.anchor.machine == other.anchor.machine
            }
        }

        impl Eq for $name {}

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(#{} in {:?})", stringify!($name), self.anchor.id, self.anchor.machine)
            }
        }
    };
}

anchored_handle!(
    /// A script function living in a machine. Call it with
    /// [`LuaMachine::call`](crate::LuaMachine::call).
    LuaFunction
);

anchored_handle!(
    /// A coroutine living in a machine. Drive it with
    /// [`LuaMachine::resume`](crate::LuaMachine::resume).
    LuaCoroutine
);
