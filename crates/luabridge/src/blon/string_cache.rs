// Round-robin cache of short strings shared by encoder and decoder.
// Both sides insert in the same order, so slot numbers stay in lockstep
// without ever being transmitted for insertions.

use ahash::AHashMap;

use crate::lua_value::LuaString;
use crate::lua_vm::lua_limits::{BLON_CACHED_STRING_MAX, BLON_CACHE_SLOTS};

pub(crate) struct StringCache {
    slots: Vec<Option<LuaString>>,
    lookup: AHashMap<LuaString, u8>,
    inserted: usize,
}

impl StringCache {
    pub(crate) fn new() -> Self {
        StringCache {
            slots: vec![None; BLON_CACHE_SLOTS],
            lookup: AHashMap::new(),
            inserted: 0,
        }
    }

    #[inline]
    pub(crate) fn is_cacheable(bytes: &[u8]) -> bool {
        bytes.len() <= BLON_CACHED_STRING_MAX
    }

    pub(crate) fn find(&self, s: &LuaString) -> Option<u8> {
        self.lookup.get(s).copied()
    }

    pub(crate) fn get(&self, slot: u8) -> Option<&LuaString> {
        self.slots[slot as usize].as_ref()
    }

    /// Stores `s` in the next slot, evicting its previous occupant.
    pub(crate) fn insert(&mut self, s: LuaString) -> u8 {
        let slot = (self.inserted % BLON_CACHE_SLOTS) as u8;
        self.inserted += 1;
        if let Some(evicted) = self.slots[slot as usize].take()
            && self.lookup.get(&evicted) == Some(&slot)
        {
            self.lookup.remove(&evicted);
        }
        self.lookup.insert(s.clone(), slot);
        self.slots[slot as usize] = Some(s);
        slot
    }
}
