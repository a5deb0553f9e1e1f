// Lua 5.3 backend driven through the raw host API
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::Lua53;
use crate::lua53::{LUA_NOREF, LUA_REFNIL};
use crate::lua_vm::{
    AllocHook, ApiResult, LoadMode, LuaApi, LuaType, MULTRET, NativeResult, NativeReturn,
    ThreadStatus, VmStatus, upvalue_index,
};

thread_local! {
    static HOOK_CALLS: Cell<u32> = const { Cell::new(0) };
    static FINALIZED: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn lua() -> Lua53 {
    Lua53::new().unwrap()
}

fn load(vm: &mut Lua53, source: &str, name: &str) {
    assert_eq!(vm.load(source.as_bytes(), name, LoadMode::Text), VmStatus::Ok);
}

fn top_string(vm: &Lua53) -> String {
    String::from_utf8(vm.to_bytes(-1).unwrap()).unwrap()
}

#[test]
fn test_stack_manipulation() {
    let mut vm = lua();
    vm.push_integer(1);
    vm.push_integer(2);
    vm.push_integer(3);
    assert_eq!(vm.get_top(), 3);

    vm.insert(1);
    assert_eq!(vm.to_integer(1), Some(3));
    assert_eq!(vm.to_integer(3), Some(2));
    vm.remove(2);
    assert_eq!(vm.get_top(), 2);
    assert_eq!(vm.abs_index(-1), 2);

    vm.set_top(4);
    assert_eq!(vm.type_of(4), LuaType::Nil);
    assert_eq!(vm.type_of(5), LuaType::None);
    vm.set_top(-3);
    assert_eq!(vm.get_top(), 2);
    vm.pop(2);
    assert_eq!(vm.get_top(), 0);
}

#[test]
fn test_values_read_back() {
    let mut vm = lua();
    vm.push_number(2.5);
    vm.push_integer(-7);
    vm.push_boolean(true);
    vm.push_str("text").unwrap();
    vm.push_light_userdata(0x1000);
    assert_eq!(vm.to_number(1), Some(2.5));
    assert!(!vm.is_integer(1));
    assert!(vm.is_integer(2));
    assert_eq!(vm.to_bytes(2), Some(b"-7".to_vec()));
    // Reading a number as bytes leaves it a number.
    assert_eq!(vm.type_of(2), LuaType::Number);
    assert!(vm.to_boolean(3));
    assert_eq!(top_string_at(&vm, 4), "text");
    assert_eq!(vm.to_light_userdata(5), Some(0x1000));
    assert_eq!(vm.to_integer(4), None);
    assert_eq!(vm.raw_len(4), 4);
}

fn top_string_at(vm: &Lua53, idx: i32) -> String {
    String::from_utf8(vm.to_bytes(idx).unwrap()).unwrap()
}

#[test]
fn test_registry_references() {
    let mut vm = lua();
    vm.push_str("a").unwrap();
    let a = vm.reference().unwrap();
    vm.push_str("b").unwrap();
    let b = vm.reference().unwrap();
    assert_eq!(b, a + 1);
    assert_eq!(vm.get_top(), 0);

    vm.unreference(a);
    assert_eq!(vm.push_reference(b), LuaType::String);
    assert_eq!(top_string(&vm), "b");
    vm.pop(1);

    // A freed reference is handed out again.
    vm.push_str("c").unwrap();
    let c = vm.reference().unwrap();
    assert_eq!(c, a);
    assert_eq!(vm.push_reference(c), LuaType::String);
    assert_eq!(top_string(&vm), "c");
    vm.pop(1);

    vm.push_nil();
    assert_eq!(vm.reference().unwrap(), LUA_REFNIL);
    vm.unreference(LUA_REFNIL);
    vm.unreference(LUA_NOREF);
    assert_eq!(vm.push_reference(LUA_REFNIL), LuaType::Nil);
    assert_eq!(vm.get_top(), 1);
}

#[test]
fn test_globals_and_tables() {
    let mut vm = lua();
    vm.create_table(0, 2).unwrap();
    vm.push_str("x").unwrap();
    vm.push_integer(10);
    vm.raw_set(1).unwrap();
    vm.push_str("second").unwrap();
    vm.raw_seti(1, 2).unwrap();
    vm.set_global("point").unwrap();
    assert_eq!(vm.get_top(), 0);

    load(&mut vm, "return point.x * 2, point[2]", "=point");
    assert_eq!(vm.pcall(0, MULTRET), VmStatus::Ok);
    assert_eq!(vm.to_integer(1), Some(20));
    assert_eq!(top_string(&vm), "second");
    vm.set_top(0);

    assert_eq!(vm.get_global("point"), LuaType::Table);
    let mut keys = 0;
    vm.push_nil();
    while vm.next(1) {
        keys += 1;
        vm.pop(1);
    }
    assert_eq!(keys, 2);
    assert_eq!(vm.raw_geti(1, 2), LuaType::String);
    vm.push_str("x").unwrap();
    assert_eq!(vm.raw_get(1), LuaType::Number);
    assert_eq!(vm.get_global("nothing"), LuaType::Nil);
}

#[test]
fn test_weak_valued_table() {
    let mut vm = lua();
    vm.create_table(0, 0).unwrap();
    vm.create_table(0, 1).unwrap();
    vm.push_str("__mode").unwrap();
    vm.push_str("v").unwrap();
    vm.raw_set(-3).unwrap();
    vm.set_metatable(-2);
    assert!(vm.get_metatable(1));
    vm.pop(1);

    // Only referenced by the weak table: gone after a collection.
    vm.create_table(0, 0).unwrap();
    vm.raw_seti(1, 1).unwrap();

    // Still on the stack: kept.
    vm.create_table(0, 0).unwrap();
    vm.push_value(-1);
    vm.raw_seti(1, 2).unwrap();

    // Strings are values, not objects.
    vm.push_str("kept").unwrap();
    vm.raw_seti(1, 3).unwrap();

    vm.collect_garbage();
    assert_eq!(vm.raw_geti(1, 1), LuaType::Nil);
    assert_eq!(vm.raw_geti(1, 2), LuaType::Table);
    assert_eq!(vm.raw_geti(1, 3), LuaType::String);
    vm.set_top(1);

    vm.collect_garbage();
    assert_eq!(vm.raw_geti(1, 2), LuaType::Nil);
}

#[test]
fn test_pcall_results_and_errors() {
    let mut vm = lua();
    load(&mut vm, "local x = ...\nreturn x * x", "=square");
    vm.push_integer(6);
    assert_eq!(vm.pcall(1, MULTRET), VmStatus::Ok);
    assert_eq!(vm.get_top(), 1);
    assert_eq!(vm.to_integer(-1), Some(36));
    vm.pop(1);

    load(&mut vm, "local x = ...\nreturn x + {}", "=calc");
    vm.push_integer(7);
    assert_eq!(vm.pcall(1, MULTRET), VmStatus::RuntimeError);
    // The error replaces the function and its arguments.
    assert_eq!(vm.get_top(), 1);
    assert!(
        top_string(&vm).starts_with("calc:2: attempt to perform arithmetic on a table value"),
        "{}",
        top_string(&vm)
    );
    vm.pop(1);

    assert_eq!(vm.load(b"return +", "=broken", LoadMode::Text), VmStatus::SyntaxError);
    assert!(top_string(&vm).starts_with("broken:1:"));
}

#[test]
fn test_chunk_modes() {
    let mut vm = lua();
    load(&mut vm, "return 'dumped'", "=dumped");
    let binary = vm.dump(-1).unwrap();
    vm.pop(1);
    assert_eq!(vm.load(&binary, "=bin", LoadMode::Text), VmStatus::SyntaxError);
    vm.pop(1);
    assert_eq!(vm.load(b"return 1", "=text", LoadMode::Binary), VmStatus::SyntaxError);
    vm.pop(1);
    assert_eq!(vm.load(&binary, "=bin", LoadMode::Both), VmStatus::Ok);
    assert_eq!(vm.pcall(0, 1), VmStatus::Ok);
    assert_eq!(top_string(&vm), "dumped");
}

fn read_upvalue(api: &mut dyn LuaApi) -> NativeResult {
    api.push_value(upvalue_index(1));
    Ok(NativeReturn::Return(1))
}

#[test]
fn test_native_upvalues() {
    let mut vm = lua();
    vm.push_str("captured").unwrap();
    vm.push_native(read_upvalue, 1).unwrap();
    assert_eq!(vm.get_top(), 1);
    assert_eq!(vm.to_native(1).map(|f| f as usize), Some(read_upvalue as usize));
    assert!(vm.get_upvalue(1, 1));
    assert_eq!(top_string(&vm), "captured");
    vm.pop(1);
    assert!(!vm.get_upvalue(1, 2));
    assert_eq!(vm.pcall(0, 1), VmStatus::Ok);
    assert_eq!(top_string(&vm), "captured");
}

fn raise_from_native(api: &mut dyn LuaApi) -> NativeResult {
    let _ = api.push_str("native failure");
    Err(api.error())
}

#[test]
fn test_native_errors_unwind_to_pcall() {
    let mut vm = lua();
    vm.push_native(raise_from_native, 0).unwrap();
    vm.set_global("fail").unwrap();
    load(&mut vm, "return pcall(fail)", "=guarded");
    assert_eq!(vm.pcall(0, MULTRET), VmStatus::Ok);
    assert_eq!(vm.get_top(), 2);
    assert!(!vm.to_boolean(1));
    assert_eq!(top_string(&vm), "native failure");
}

fn counting_hook(_: &mut dyn LuaApi) -> ApiResult<()> {
    HOOK_CALLS.with(|calls| calls.set(calls.get() + 1));
    Ok(())
}

fn stopping_hook(api: &mut dyn LuaApi) -> ApiResult<()> {
    api.push_str("stopped")?;
    Err(api.error())
}

const HUNDRED_TURNS: &str = "local x = 0\nfor i = 1, 100 do x = x + i end\nreturn x";

#[test]
fn test_hook_period() {
    HOOK_CALLS.with(|calls| calls.set(0));
    let mut vm = lua();
    vm.set_hook(Some(counting_hook), 10);
    load(&mut vm, HUNDRED_TURNS, "=turns");
    assert_eq!(vm.pcall(0, 1), VmStatus::Ok);
    assert_eq!(vm.to_integer(-1), Some(5050));
    let calls = HOOK_CALLS.with(Cell::get);
    // Two instructions a turn.
    assert!((15..=30).contains(&calls), "{}", calls);

    vm.set_hook(None, 0);
    load(&mut vm, HUNDRED_TURNS, "=turns");
    assert_eq!(vm.pcall(0, 1), VmStatus::Ok);
    assert_eq!(HOOK_CALLS.with(Cell::get), calls);
}

#[test]
fn test_hook_error_stops_script() {
    let mut vm = lua();
    vm.set_hook(Some(stopping_hook), 3);
    load(&mut vm, "while true do end", "=forever");
    assert_eq!(vm.pcall(0, 0), VmStatus::RuntimeError);
    assert_eq!(top_string(&vm), "stopped");
}

struct Gate {
    closed: Cell<bool>,
    refused: Cell<u32>,
}

impl AllocHook for Gate {
    fn realloc(&self, old_size: usize, new_size: usize) -> bool {
        let refuse = self.closed.get() && new_size > old_size;
        if refuse {
            self.refused.set(self.refused.get() + 1);
        }
        !refuse
    }
}

#[test]
fn test_refused_allocation_is_memory_error() {
    let mut vm = lua();
    let gate = Rc::new(Gate {
        closed: Cell::new(false),
        refused: Cell::new(0),
    });
    vm.set_allocator(gate.clone());
    load(&mut vm, "return { 1, 2, 3 }", "=alloc");

    gate.closed.set(true);
    assert_eq!(vm.pcall(0, 1), VmStatus::MemoryError);
    assert_eq!(top_string(&vm), "not enough memory");
    assert!(gate.refused.get() > 0);
    vm.pop(1);
    assert_eq!(vm.create_table(4, 4), Err(crate::lua_vm::Raised::memory()));
    vm.pop(1);

    gate.closed.set(false);
    let before = vm.memory_in_use();
    vm.create_table(4, 4).unwrap();
    assert!(vm.memory_in_use() > before);
    vm.pop(1);
}

#[test]
fn test_memory_accounting_follows_collection() {
    let mut vm = lua();
    vm.collect_garbage();
    let before = vm.memory_in_use();
    assert!(before > 0);
    vm.create_table(64, 0).unwrap();
    vm.push_str(&"x".repeat(4096)).unwrap();
    assert!(vm.memory_in_use() > before + 4096);
    vm.pop(2);
    vm.collect_garbage();
    assert!(vm.memory_in_use() <= before);
}

fn record_finalizer(api: &mut dyn LuaApi) -> NativeResult {
    if let Some(payload) = api.to_userdata(1) {
        FINALIZED.with(|f| f.borrow_mut().push(payload));
    }
    Ok(NativeReturn::Return(0))
}

#[test]
fn test_finalizers_run_on_collect() {
    FINALIZED.with(|f| f.borrow_mut().clear());
    let mut vm = lua();
    vm.new_userdata(77).unwrap();
    vm.create_table(0, 1).unwrap();
    vm.push_str("__gc").unwrap();
    vm.push_native(record_finalizer, 0).unwrap();
    vm.raw_set(-3).unwrap();
    vm.set_metatable(-2);
    assert_eq!(vm.to_userdata(-1), Some(77));
    assert_eq!(vm.type_of(-1), LuaType::Userdata);

    vm.pop(1);
    vm.collect_garbage();
    assert_eq!(FINALIZED.with(|f| f.borrow().clone()), vec![77]);

    // A finalized userdata is not finalized twice.
    vm.collect_garbage();
    assert_eq!(FINALIZED.with(|f| f.borrow().len()), 1);
}

#[test]
fn test_coroutine_through_api() {
    let mut vm = lua();
    let source = r#"
        return function(a)
            local b = coroutine.yield(a)
            return a + b
        end
    "#;
    load(&mut vm, source, "=acc");
    assert_eq!(vm.pcall(0, 1), VmStatus::Ok);
    vm.new_thread().unwrap();
    assert_eq!(vm.type_of(1), LuaType::Thread);
    assert_eq!(vm.thread_status(1), Some(ThreadStatus::Suspended));

    vm.push_integer(10);
    assert_eq!(vm.resume(1, 1), (VmStatus::Yield, 1));
    assert_eq!(vm.to_integer(-1), Some(10));
    assert_eq!(vm.thread_status(1), Some(ThreadStatus::Suspended));
    vm.pop(1);

    vm.push_integer(5);
    assert_eq!(vm.resume(1, 1), (VmStatus::Ok, 1));
    assert_eq!(vm.to_integer(-1), Some(15));
    assert_eq!(vm.thread_status(1), Some(ThreadStatus::Dead));
    vm.pop(1);

    assert_eq!(vm.resume(1, 0), (VmStatus::RuntimeError, 1));
    assert_eq!(top_string(&vm), "cannot resume dead coroutine");
    assert_eq!(vm.thread_status(-1), None);
    vm.pop(1);

    vm.push_integer(3);
    assert_eq!(vm.resume(2, 0), (VmStatus::RuntimeError, 1));
    assert_eq!(top_string(&vm), "cannot resume non-coroutine");
}

#[test]
fn test_standard_libraries_are_limited() {
    let mut vm = lua();
    for present in ["string", "table", "math", "coroutine", "utf8", "pcall"] {
        assert_ne!(vm.get_global(present), LuaType::Nil, "{}", present);
        vm.pop(1);
    }
    for absent in ["io", "os", "debug", "package", "require", "dofile", "loadfile"] {
        assert_eq!(vm.get_global(absent), LuaType::Nil, "{}", absent);
        vm.pop(1);
    }
}
