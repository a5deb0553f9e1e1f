// Allocation budget tests
use std::cell::Cell;
use std::rc::Rc;

use crate::governor::{AllocationTracker, ResourceGovernor};
use crate::lua_vm::AllocHook;
use crate::{LuaError, LuaMachine, MachineOptions, args};

#[test]
fn test_budget_invariant() {
    let tracker = AllocationTracker::new(1000);
    assert!(tracker.request(0, 600, false));
    assert!(tracker.request(0, 400, false));
    assert_eq!(tracker.used(), 1000);

    // Rejected growth leaves the count untouched.
    assert!(!tracker.request(0, 1, false));
    assert_eq!(tracker.used(), 1000);
    assert_eq!(tracker.rejections(), 1);

    // Shrink and free always succeed.
    assert!(tracker.request(600, 100, false));
    assert_eq!(tracker.used(), 500);
    assert!(tracker.request(400, 0, false));
    assert_eq!(tracker.used(), 100);
}

#[test]
fn test_forced_allocations_may_exceed_budget() {
    let tracker = AllocationTracker::new(100);
    assert!(tracker.request(0, 90, false));
    assert!(tracker.request(0, 50, true));
    assert_eq!(tracker.used(), 140);
    assert_eq!(tracker.peak(), 140);
    assert!(!tracker.request(0, 1, false));
    assert!(tracker.request(50, 0, false));
    assert!(tracker.request(0, 10, false));
}

#[test]
fn test_simulated_sequence_never_exceeds_budget() {
    let budget = 4096;
    let tracker = AllocationTracker::new(budget);
    let mut blocks: Vec<usize> = Vec::new();
    let mut seed = 0x2545_f491u32;
    for _ in 0..2000 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let size = (seed % 700) as usize + 1;
        if seed % 3 == 0 && !blocks.is_empty() {
            let old = blocks.swap_remove(seed as usize % blocks.len());
            assert!(tracker.request(old, 0, false));
        } else if tracker.request(0, size, false) {
            blocks.push(size);
        }
        assert!(tracker.used() <= budget);
        assert_eq!(tracker.used(), blocks.iter().sum::<usize>());
    }
}

#[test]
fn test_gc_callback_makes_room() {
    let tracker = Rc::new(AllocationTracker::new(100));
    assert!(tracker.request(0, 100, false));
    let calls = Rc::new(Cell::new(0));
    let inner = tracker.clone();
    let counter = calls.clone();
    tracker.set_gc_callback(Some(Box::new(move || {
        counter.set(counter.get() + 1);
        inner.request(60, 0, false);
    })));
    assert!(tracker.request(0, 50, false));
    assert_eq!(calls.get(), 1);
    assert_eq!(tracker.used(), 90);
    // Break the Rc cycle.
    tracker.set_gc_callback(None);
}

#[test]
fn test_bookkeeping_forces_allocations() {
    let governor = ResourceGovernor::new(&MachineOptions::default().with_memory_budget(10));
    assert!(!governor.realloc(0, 20));
    {
        let _guard = governor.bookkeeping();
        assert!(governor.in_bookkeeping());
        assert!(governor.realloc(0, 20));
    }
    assert!(!governor.in_bookkeeping());
    assert_eq!(governor.memory().used(), 20);
}

#[test]
fn test_script_memory_error() {
    let options = MachineOptions::default().with_memory_budget(256 * 1024);
    let mut machine = LuaMachine::new(options).unwrap();
    let source = r#"
        local t = {}
        local i = 0
        while true do
            i = i + 1
            t[i] = "0123456789012345678901234567890123456789" .. i
        end
    "#;
    let err = machine.do_string(source, "=grow").unwrap_err();
    assert!(matches!(err, LuaError::ResourceExhausted), "{:?}", err);
    assert!(machine.memory_used() <= machine.memory_budget());
    assert!(machine.governor().memory().rejections() > 0);

    // The machine stays usable once the garbage is gone.
    machine.set_memory_budget(machine.memory_used() + 64 * 1024);
    let results = machine.do_string("return 7", "=after").unwrap();
    assert_eq!(results.get_integer(0).unwrap(), 7);
}

#[test]
fn test_script_pcall_sees_memory_error() {
    let options = MachineOptions::default().with_memory_budget(256 * 1024);
    let mut machine = LuaMachine::new(options).unwrap();
    let source = r#"
        local ok, message = pcall(function()
            local parts = {}
            while true do
                parts[#parts + 1] = string.rep("x", 1024)
            end
        end)
        return ok, message
    "#;
    let results = machine.do_string(source, "=guarded").unwrap();
    assert_eq!(results, args![false, "not enough memory"]);
}
